#![forbid(unsafe_code)]
//! Error types for morosfs.
//!
//! [`MorosError`] is the single user-facing error type returned by the image
//! reader, the FUSE adapter, and the CLI. The on-disk format carries almost
//! no redundancy, so the taxonomy is deliberately small:
//!
//! | Variant | errno | Meaning |
//! |---------|-------|---------|
//! | `Io` | raw errno or `EIO` | Operating system I/O failure |
//! | `NotFound` | `ENOENT` | Path resolution failed at some component |
//! | `Format` | `EINVAL` | A chain pointer or read range falls outside the image |
//! | `Unsupported` | `EROFS` | A mutating operation on the read-only mount |
//!
//! Malformed on-disk structures that can be tolerated (a declared size larger
//! than the chain, a file listed as a directory) are not errors at all: the
//! reader degrades to a short read or an empty listing instead.

use thiserror::Error;

/// Unified error type for all morosfs operations.
#[derive(Debug, Error)]
pub enum MorosError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Path resolution failed: some component has no matching entry, or a
    /// matching entry's start block is the nil sentinel.
    #[error("not found: {0}")]
    NotFound(String),

    /// A block address or read range falls outside the backing image.
    ///
    /// The format has no checksums, so this is the only structural
    /// inconsistency the reader detects rather than degrades through.
    #[error("invalid on-disk structure: {0}")]
    Format(String),

    /// A mutating operation was attempted on the read-only mount.
    ///
    /// Every write-path FUSE callback funnels into this variant; the payload
    /// names the rejected operation for logging.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl MorosError {
    /// Convert this error into a POSIX errno suitable for FUSE replies.
    ///
    /// The mapping is exhaustive — adding a variant without an errno is a
    /// compile error. `Unsupported` maps to `EROFS` because the mount itself
    /// is read-only by design, not because a permission check failed.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::NotFound(_) => libc::ENOENT,
            Self::Format(_) => libc::EINVAL,
            Self::Unsupported(_) => libc::EROFS,
        }
    }
}

/// Result alias using `MorosError`.
pub type Result<T> = std::result::Result<T, MorosError>;
