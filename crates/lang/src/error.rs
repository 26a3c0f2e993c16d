//! Pattern-language error types
//!
//! Every stage reports the first hard error it hits as a value carrying a
//! kind, a source line where one exists, and a message. Console output is
//! collected separately and survives a hard error.

use runic_provider::ProviderError;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("preprocessor error at line {line}: {message}")]
    Preprocessor { line: u32, message: String },

    #[error("lex error at line {line}: {message}")]
    Lex { line: u32, message: String },

    #[error("parse error at line {line}: {message}")]
    Parse { line: u32, message: String },

    #[error("validation error at line {line}: {message}")]
    Validation { line: u32, message: String },

    #[error("evaluation error at line {line}: {message}")]
    Evaluation { line: u32, message: String },

    #[error("recursion limit of {limit} exceeded at line {line}")]
    RecursionLimit { line: u32, limit: u32 },

    #[error("pattern limit of {limit} exceeded at line {line}")]
    PatternLimit { line: u32, limit: u64 },

    #[error("evaluation aborted")]
    Aborted,

    #[error("provider error: {0}")]
    Provider(String),
}

impl From<ProviderError> for Error {
    fn from(error: ProviderError) -> Self {
        Error::Provider(error.to_string())
    }
}

impl Error {
    /// Source line the error points at, where one exists.
    pub fn line(&self) -> Option<u32> {
        match self {
            Error::Preprocessor { line, .. }
            | Error::Lex { line, .. }
            | Error::Parse { line, .. }
            | Error::Validation { line, .. }
            | Error::Evaluation { line, .. }
            | Error::RecursionLimit { line, .. }
            | Error::PatternLimit { line, .. } => Some(*line),
            Error::Aborted | Error::Provider(_) => None,
        }
    }
}
