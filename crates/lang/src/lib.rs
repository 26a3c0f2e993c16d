//! runic pattern language
//!
//! A small domain-specific language for decoding binary data: programs
//! describe how to interpret the bytes of a [`Provider`] as a tree of
//! typed, annotated [`Pattern`]s, which a host then renders or exports.
//!
//! The pipeline is strictly layered:
//!
//! ```text
//! source ─▶ preprocessor ─▶ lexer ─▶ parser ─▶ validator ─▶ evaluator ─▶ patterns
//! ```
//!
//! [`Runtime`] wires the stages together and carries everything that used
//! to be ambient state: registered functions, limits, the default byte
//! order and the abort flag.
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use runic_lang::Runtime;
//! use runic_provider::MemoryProvider;
//!
//! let provider = Arc::new(MemoryProvider::new(vec![0x34, 0x12]));
//! let mut runtime = Runtime::new();
//! let patterns = runtime
//!     .execute_string(provider, "u16 magic @ 0;", HashMap::new(), HashMap::new())
//!     .unwrap();
//! assert_eq!(patterns[0].size, 2);
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use runic_provider::Provider;
use tracing::debug;

pub mod ast;
pub mod console;
pub mod error;
pub mod evaluator;
pub mod functions;
pub mod lexer;
pub mod parser;
pub mod pattern;
pub mod preprocessor;
pub mod token;
pub mod validator;
pub mod value;
pub mod visitor;

pub use console::{Level, LogConsole};
pub use error::Error;
pub use functions::{EvalContext, FunctionRegistry, ParamCount};
pub use pattern::{Pattern, PatternKind, to_json};
pub use token::ValueType;
pub use value::{Endian, Literal};
pub use visitor::{PatternVisitor, TreeFormatter, render_value, walk};

use evaluator::{Evaluator, Limits};
use preprocessor::Preprocessor;

/// Host-side cancellation for a running evaluation; safe to trigger from
/// any thread.
#[derive(Clone)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// The embedding API: owns registered functions, limits and the results
/// of the last run.
pub struct Runtime {
    registry: FunctionRegistry,
    include_paths: Vec<PathBuf>,
    default_endian: Endian,
    pattern_limit: u64,
    recursion_limit: u32,
    provider: Option<Arc<dyn Provider>>,
    abort: Arc<AtomicBool>,

    patterns: Vec<Pattern>,
    console: Vec<(Level, String)>,
    out_vars: BTreeMap<String, Literal>,
    error: Option<Error>,
}

impl Runtime {
    /// A fresh runtime with the `std` builtins registered.
    pub fn new() -> Self {
        let mut registry = FunctionRegistry::new();
        functions::register_std(&mut registry);

        let limits = Limits::default();
        Runtime {
            registry,
            include_paths: Vec::new(),
            default_endian: Endian::native(),
            pattern_limit: limits.pattern_limit,
            recursion_limit: limits.recursion_limit,
            provider: None,
            abort: Arc::new(AtomicBool::new(false)),
            patterns: Vec::new(),
            console: Vec::new(),
            out_vars: BTreeMap::new(),
            error: None,
        }
    }

    // ---- configuration ----

    pub fn set_pattern_limit(&mut self, limit: u64) {
        self.pattern_limit = limit;
    }

    pub fn set_recursion_limit(&mut self, limit: u32) {
        self.recursion_limit = limit;
    }

    pub fn set_default_endian(&mut self, endian: Endian) {
        self.default_endian = endian;
    }

    pub fn set_include_paths(&mut self, paths: Vec<PathBuf>) {
        self.include_paths = paths;
    }

    pub fn set_data_source(&mut self, provider: Arc<dyn Provider>) {
        self.provider = Some(provider);
    }

    /// Register a host function callable as `namespace::name`.
    pub fn register_function(
        &mut self,
        namespace: &str,
        name: &str,
        param_count: ParamCount,
        callback: impl Fn(&mut EvalContext<'_>, &[Literal]) -> Result<Option<Literal>, Error>
            + Send
            + Sync
            + 'static,
    ) {
        self.registry.register(namespace, name, param_count, callback);
    }

    /// Request cancellation; the evaluator unwinds at the next statement
    /// boundary with [`Error::Aborted`].
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle(Arc::clone(&self.abort))
    }

    // ---- results of the last run ----

    /// Borrowed view of the top-level pattern list of the last run.
    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    /// Ordered console entries of the last run, kept even on hard error.
    pub fn console_log(&self) -> &[(Level, String)] {
        &self.console
    }

    /// `out` variable values after a successful run.
    pub fn out_variables(&self) -> &BTreeMap<String, Literal> {
        &self.out_vars
    }

    /// The hard error that ended the last run, if any.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    // ---- execution ----

    /// Run a pattern program against a provider.
    pub fn execute_string(
        &mut self,
        provider: Arc<dyn Provider>,
        source: &str,
        env_vars: HashMap<String, Literal>,
        in_vars: HashMap<String, Literal>,
    ) -> Result<Vec<Pattern>, Error> {
        self.execute(provider, source, None, env_vars, in_vars, None)
    }

    /// Run a pattern file; includes resolve relative to it.
    pub fn execute_file(
        &mut self,
        provider: Arc<dyn Provider>,
        path: impl AsRef<Path>,
        env_vars: HashMap<String, Literal>,
        in_vars: HashMap<String, Literal>,
    ) -> Result<Vec<Pattern>, Error> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| Error::Provider(format!("cannot read '{}': {e}", path.display())))?;
        self.execute(provider, &source, Some(path), env_vars, in_vars, None)
    }

    /// Evaluate a snippet as a function body and return its result. The
    /// code is wrapped in an implicit `fn main()` when no entry point is
    /// present.
    pub fn execute_function(
        &mut self,
        provider: Arc<dyn Provider>,
        code: &str,
    ) -> Result<Option<Literal>, Error> {
        let source = if code.contains("fn main") {
            code.to_string()
        } else {
            format!("fn main() {{\n{code}\n}}\n")
        };

        let mut result = None;
        self.execute(
            provider,
            &source,
            None,
            HashMap::new(),
            HashMap::new(),
            Some(&mut result),
        )?;
        Ok(result)
    }

    fn execute(
        &mut self,
        provider: Arc<dyn Provider>,
        source: &str,
        origin: Option<&Path>,
        env_vars: HashMap<String, Literal>,
        in_vars: HashMap<String, Literal>,
        entry_result: Option<&mut Option<Literal>>,
    ) -> Result<Vec<Pattern>, Error> {
        self.provider = Some(Arc::clone(&provider));
        self.abort.store(false, Ordering::Release);
        self.patterns.clear();
        self.console.clear();
        self.out_vars.clear();
        self.error = None;

        let result =
            self.run_pipeline(provider, source, origin, env_vars, in_vars, entry_result);
        match result {
            Ok(patterns) => {
                self.patterns = patterns.clone();
                Ok(patterns)
            }
            Err(error) => {
                debug!(%error, "pattern execution failed");
                self.error = Some(error.clone());
                Err(error)
            }
        }
    }

    fn run_pipeline(
        &mut self,
        provider: Arc<dyn Provider>,
        source: &str,
        origin: Option<&Path>,
        env_vars: HashMap<String, Literal>,
        in_vars: HashMap<String, Literal>,
        entry_result: Option<&mut Option<Literal>>,
    ) -> Result<Vec<Pattern>, Error> {
        let mut preprocessor = Preprocessor::new();
        preprocessor.set_include_paths(self.include_paths.clone());
        preprocessor
            .add_pragma_handler("endian", |v| matches!(v, "big" | "little" | "native"));

        let processed = preprocessor.preprocess(source, origin)?;

        let mut endian = self.default_endian;
        let mut recursion_limit = self.recursion_limit;
        for (key, value) in preprocessor.pragmas() {
            match (key.as_str(), value.as_str()) {
                ("endian", "big") => endian = Endian::Big,
                ("endian", "little") => endian = Endian::Little,
                ("endian", "native") => endian = Endian::native(),
                ("eval_depth", depth) => {
                    if let Ok(depth) = depth.parse() {
                        recursion_limit = depth;
                    }
                }
                _ => {}
            }
        }

        let tokens = lexer::lex(&processed)?;
        let program = parser::parse(&tokens)?;
        validator::validate(&program)?;

        let mut evaluator = Evaluator::new(
            provider.as_ref(),
            &program.ast,
            &program.types,
            &self.registry,
            endian,
            Limits {
                pattern_limit: self.pattern_limit,
                recursion_limit,
            },
            Arc::clone(&self.abort),
            env_vars,
            in_vars,
        );

        let result = evaluator.evaluate(&program.roots);

        let result = match (result, entry_result) {
            (Ok(patterns), None) => Ok(patterns),
            (Ok(patterns), Some(slot)) => match evaluator.call_entry("main", 0) {
                Ok(value) => {
                    *slot = value;
                    Ok(patterns)
                }
                Err(error) => Err(error),
            },
            (Err(error), _) => Err(error),
        };

        self.out_vars = evaluator.out_variables().into_iter().collect();
        self.console = evaluator.into_console().into_entries();

        result
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}
