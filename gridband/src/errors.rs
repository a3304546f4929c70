use std::io;
use std::result;

use thiserror::Error;

/// Errors produced while mapping an N-dimensional variable onto 2-D blocks.
///
/// Metadata anomalies (odd valid ranges, unknown storage types, ambiguous
/// dimension order) are not represented here; those are recovered in place
/// with a fallback and a warning diagnostic. Only hard failures reach the
/// caller as one of these.
///
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    IO(#[from] io::Error),

    /// A hyperslab read or write failed inside the storage backend.
    #[error("storage backend: {0}")]
    Backend(String),

    /// A pixel type reached a dispatch point it should never have reached.
    #[error("bad type: {0}")]
    BadType(String),

    /// Band indexes are 1-based and contiguous.
    #[error("band index {0} is out of range")]
    BadBandIndex(usize),

    /// The requested operation is not supported for this dataset layout.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A caller contract violation, surfaced immediately.
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// A chunk load failed while another request was waiting on it.
    #[error("failed to load chunk from storage")]
    Load,
}

pub type Result<T> = result::Result<T, Error>;
