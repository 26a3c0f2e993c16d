//! Provider and patch-codec error types
//!
//! All failures surface as values. I/O errors from a backing store are
//! wrapped so callers can distinguish "the read was out of range" from
//! "the disk went away".

use std::io;

use thiserror::Error;

/// Errors raised by a [`Provider`](crate::Provider) or one of its backings.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// A read or write touched bytes outside the provider's valid range.
    #[error("range [{offset:#x}, {offset:#x} + {size:#x}) is outside the provider (size {provider_size:#x})")]
    OutOfRange {
        offset: u64,
        size: u64,
        provider_size: u64,
    },

    /// Write attempted on a read-only provider.
    #[error("provider '{0}' is not writable")]
    NotWritable(String),

    /// Insert/remove attempted on a fixed-size provider.
    #[error("provider '{0}' is not resizable")]
    NotResizable(String),

    /// Save attempted on a provider without a backing store.
    #[error("provider '{0}' cannot be saved")]
    NotSavable(String),

    /// The backing store failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A remote transport (SFTP session, process handle) failed.
    #[error("remote access failed: {0}")]
    Remote(String),
}

/// Errors raised by the IPS / IPS32 codec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchError {
    /// The stream does not start with a known magic.
    #[error("invalid patch header")]
    InvalidPatchHeader,

    /// A record was truncated or otherwise malformed.
    #[error("invalid patch format")]
    InvalidPatchFormat,

    /// The stream ended without its terminator.
    #[error("missing EOF marker")]
    MissingEof,

    /// A patch address exceeds what the format can express.
    #[error("patch address {0:#x} out of range for this format")]
    AddressOutOfRange(u64),

    /// A single run is longer than a record can carry.
    #[error("patch run of {0} bytes is too large")]
    PatchTooLarge(usize),
}
