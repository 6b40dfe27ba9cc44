//! Error types for the cstor-chunked library.
//!
//! All fallible operations return a [`Result<T>`], an alias for
//! `Result<T, ChunkedError>`.
//!
//! # Error Categories
//!
//! - **Malformed input**: [`Format`], [`TarSplit`]
//! - **Authentication**: [`DigestMismatch`]
//! - **Fallback-eligible**: [`TooBig`], [`BadRangeRequest`]
//! - **Cross-validation**: [`Inconsistency`]
//! - **Filesystem**: [`Fs`], [`IdMapping`], [`Io`]
//! - **Serialization**: [`Json`]
//!
//! The fallback-eligible variants signal that a partial pull is not possible
//! for this layer, and that the caller may retry with an ordinary full-blob
//! download instead of reporting a failure. Use [`ChunkedError::is_fallback`]
//! rather than matching on the variants directly.
//!
//! [`Format`]: ChunkedError::Format
//! [`TarSplit`]: ChunkedError::TarSplit
//! [`DigestMismatch`]: ChunkedError::DigestMismatch
//! [`TooBig`]: ChunkedError::TooBig
//! [`BadRangeRequest`]: ChunkedError::BadRangeRequest
//! [`Inconsistency`]: ChunkedError::Inconsistency
//! [`Fs`]: ChunkedError::Fs
//! [`IdMapping`]: ChunkedError::IdMapping
//! [`Io`]: ChunkedError::Io
//! [`Json`]: ChunkedError::Json
//!
//! # Example
//!
//! ```no_run
//! use cstor_chunked::ChunkedError;
//!
//! fn pull(res: cstor_chunked::Result<()>) -> Result<(), ChunkedError> {
//!     match res {
//!         Err(e) if e.is_fallback() => {
//!             eprintln!("partial pull not possible ({e}), downloading the full layer");
//!             Ok(())
//!         }
//!         other => other,
//!     }
//! }
//! ```

use std::path::PathBuf;

/// Result type alias for operations that may return a ChunkedError.
pub type Result<T> = std::result::Result<T, ChunkedError>;

/// Error types for chunked layer operations.
#[derive(Debug, thiserror::Error)]
pub enum ChunkedError {
    /// Malformed TOC, footer, annotation or digest string.
    #[error("invalid format: {0}")]
    Format(String),

    /// The digest of fetched or written data does not match the expected one.
    #[error("digest mismatch for {what}: expected {expected}, got {actual}")]
    DigestMismatch {
        /// What was being verified.
        what: String,
        /// The expected digest.
        expected: String,
        /// The computed digest.
        actual: String,
    },

    /// A declared manifest or tar-split size exceeds the configured limit.
    #[error("{what} too big to process in memory ({size} bytes, limit {limit})")]
    TooBig {
        /// What was too big.
        what: String,
        /// The declared size.
        size: u64,
        /// The configured limit.
        limit: u64,
    },

    /// The range transport rejected the request itself.
    #[error("bad range request (status {status})")]
    BadRangeRequest {
        /// Status reported by the transport (HTTP status code for registries).
        status: u16,
    },

    /// TOC and tar-split disagree about the layer contents.
    #[error("tar-split and TOC data is inconsistent: {0}")]
    Inconsistency(String),

    /// Error while reading tar-split metadata.
    #[error("tar-split error: {0}")]
    TarSplit(String),

    /// A syscall failed on a path inside the extraction root.
    #[error("{op} {}: {source}", path.display())]
    Fs {
        /// The failing operation.
        op: &'static str,
        /// The path relative to the extraction root.
        path: PathBuf,
        /// The underlying errno.
        #[source]
        source: rustix::io::Errno,
    },

    /// Ownership could not be applied because the IDs are not mapped.
    #[error(
        "potentially insufficient UIDs or GIDs available in the user namespace \
         (requested {uid}:{gid} for {}): Check /etc/subuid and /etc/subgid if configured \
         locally and run \"podman system migrate\": {source}",
        path.display()
    )]
    IdMapping {
        /// Requested owner.
        uid: u32,
        /// Requested group.
        gid: u32,
        /// The path relative to the extraction root.
        path: PathBuf,
        /// The underlying errno (EINVAL).
        #[source]
        source: rustix::io::Errno,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChunkedError {
    /// Shorthand for a path-annotated syscall failure.
    pub(crate) fn fs(
        op: &'static str,
        path: impl Into<PathBuf>,
        source: rustix::io::Errno,
    ) -> Self {
        ChunkedError::Fs {
            op,
            path: path.into(),
            source,
        }
    }

    /// Whether the caller may fall back to an ordinary full-blob download.
    pub fn is_fallback(&self) -> bool {
        matches!(
            self,
            ChunkedError::TooBig { .. } | ChunkedError::BadRangeRequest { .. }
        )
    }

    /// Whether, after falling back, the full blob may be converted locally.
    ///
    /// Oversized metadata would still be too big after conversion, so only
    /// transport-level failures qualify.
    pub fn can_convert(&self) -> bool {
        matches!(self, ChunkedError::BadRangeRequest { .. })
    }

    /// The errno behind a filesystem error, if any.
    pub fn errno(&self) -> Option<rustix::io::Errno> {
        match self {
            ChunkedError::Fs { source, .. } | ChunkedError::IdMapping { source, .. } => {
                Some(*source)
            }
            ChunkedError::Io(e) => e.raw_os_error().map(rustix::io::Errno::from_raw_os_error),
            _ => None,
        }
    }
}
