//! The shared error type.
//!
//! Store operations roll back and surface one of these; the walker propagates
//! handler errors verbatim; the emitter surfaces the first error it meets and
//! finishes cleanup best-effort.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CifError>;

#[derive(Debug, Error)]
pub enum CifError {
    #[error("invalid argument: {0}")]
    Argument(String),

    /// Operation attempted through a handle that is stale (its target was
    /// destroyed) or belongs to a different store.
    #[error("stale or foreign handle")]
    InvalidHandle,

    /// The backing store failed to initialize or to enforce its constraints.
    #[error("storage environment failure: {0}")]
    Environment(String),

    #[error("duplicate code `{0}`")]
    DuplicateCode(String),

    #[error("no data block `{0}`")]
    NoSuchBlock(String),

    #[error("no save frame `{0}`")]
    NoSuchFrame(String),

    #[error("no data item `{0}`")]
    NoSuchItem(String),

    #[error("no matching loop for `{0}`")]
    NoSuchLoop(String),

    #[error("invalid block code `{0}`")]
    InvalidBlockCode(String),

    #[error("invalid frame code `{0}`")]
    InvalidFrameCode(String),

    #[error("invalid data name `{0}`")]
    InvalidItemName(String),

    /// The value kind cannot be expressed in the selected dialect (lists and
    /// tables in CIF 1.1 output).
    #[error("value kind not expressible in {0}")]
    DisallowedValue(&'static str),

    /// A physical line cannot be kept within the length limit because the
    /// caller forbade folding.
    #[error("line exceeds the maximum length and folding is disabled")]
    OverlengthLine,

    #[error("internal invariant violated: {0}")]
    Internal(String),

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage failure: {0}")]
    Storage(String),

    /// Parsing stopped at the caller's request after a reported error.
    #[error("parse halted: {0}")]
    Halted(String),

    /// Iterator exhaustion sentinel; not a failure.
    #[error("iteration finished")]
    Finished,
}
