//! Error taxonomy for the driver's hot path and for on-disk format validation.

use thiserror::Error;

/// Errors returned from the steady-state read/write path.
///
/// `NotAllocated` is not really an error: it is the sentinel a differencing
/// or dynamic disk returns for a hole. Callers are expected to match on it
/// rather than treat it as a failure.
#[derive(Debug, Error)]
pub enum VhdError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("resource busy")]
    Busy,

    #[error("out of memory")]
    OutOfMemory,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sector range not allocated")]
    NotAllocated,
}

impl VhdError {
    pub fn is_not_allocated(&self) -> bool {
        matches!(self, VhdError::NotAllocated)
    }
}

/// Errors encountered parsing or validating on-disk VHD structures.
///
/// These are raised only at open/create time, never on the hot read/write
/// path, so they carry more descriptive context than [`VhdError`].
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("bad footer cookie")]
    BadFooterCookie,

    #[error("footer checksum mismatch")]
    FooterChecksum,

    #[error("bad dynamic disk header cookie")]
    BadHeaderCookie,

    #[error("header checksum mismatch")]
    HeaderChecksum,

    #[error("unsupported dynamic disk header version {0:#x}")]
    UnsupportedHeaderVersion(u32),

    #[error("unsupported disk type {0}")]
    UnsupportedDiskType(u32),

    #[error("no parent locator found for differencing disk")]
    NoParentLocator,

    #[error("parent locator has unsupported encoding {0:#x}")]
    UnsupportedLocatorEncoding(u32),

    #[error("parent validation failed: {0}")]
    ParentMismatch(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
