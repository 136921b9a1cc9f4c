//! Error taxonomy, grounded on the `thiserror`-derived `Error` enums used
//! across the example storage engines (e.g. a Bitcask-style store's
//! `Io`/`Serialization`/`AsyncTask` variants with `#[from]` conversions).

use thiserror::Error;

/// User id of the process holding a lock, carried so a caller can decide
/// whether to retry or report who is blocking it.
pub type UserId = i16;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("invalid record id")]
    InvalidId,

    #[error("lock denied, held by user {0}")]
    LockDenied(UserId),

    #[error("lock table full")]
    LockTableFull,

    #[error("deadlock detected")]
    Deadlock,

    #[error("file is open read-only")]
    ReadOnly,

    #[error("on-disk structure is corrupt: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Driver(#[from] anyhow::Error),

    #[error("out of memory")]
    NoMemory,

    #[error("operation vetoed by trigger (action {0})")]
    Triggered(i32),

    #[error("transient condition, retry")]
    Retry,

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// True for conditions a caller is expected to retry internally rather
    /// than surface, per the propagation policy in the error-handling
    /// design: only transient lock-acquisition backoffs are handled
    /// internally, everything else (including `LockDenied`) is surfaced.
    pub fn is_internal_retry(&self) -> bool {
        matches!(self, StoreError::Retry)
    }
}
