#![forbid(unsafe_code)]
//! Error types for the RillFS realtime allocator.
//!
//! # Error Taxonomy
//!
//! | Variant | errno | Meaning | Recoverable? |
//! |---------|-------|---------|--------------|
//! | `NoSpace` | `ENOSPC` | no free run satisfies the request constraints | yes — retry smaller, or report out-of-space |
//! | `InvalidRequest` | `EINVAL` | malformed request or geometry change (shrink, misaligned min/max) | yes — fix the request |
//! | `InvalidGeometry` | `EINVAL` | persisted or proposed geometry is out of range | no |
//! | `Unsupported` | `EOPNOTSUPP` | operation conflicts with an active feature | no |
//! | `Corruption` | `EIO` | an index invariant does not hold (summary count would go negative, unaccounted free units, double free) | no — surfaced distinctly so callers never mistake corruption for exhaustion |
//! | `Parse` | `EINVAL` | superblock decode failure at mount | no |
//! | `Io` | `EIO` | block store read/write failure; aborts the enclosing transaction | no — not retried internally |
//!
//! Propagation policy: search strategies propagate `Io` and `Corruption`
//! immediately. `NoSpace` from the near strategy is caught by the
//! allocation entry point to fall back to the by-size strategy; that
//! fallback is the only place `NoSpace` is swallowed internally.

use thiserror::Error;

/// Unified error type for all allocator operations.
#[derive(Debug, Error)]
pub enum RillError {
    /// Block store I/O failure (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No free run satisfies the request constraints.
    #[error("no space left in realtime group")]
    NoSpace,

    /// Malformed allocation or resize request, rejected before any
    /// mutation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Group geometry (persisted or proposed) is numerically invalid or
    /// outside the supported range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// The requested operation conflicts with an active feature.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// An index consistency invariant does not hold.
    ///
    /// The `block` field names the metadata block where the violation was
    /// detected (summary block for count underflow, bitmap block for a
    /// double free) for repair triage.
    #[error("corrupt allocation index at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Superblock decode failure surfaced at mount.
    #[error("parse error: {0}")]
    Parse(String),
}

impl RillError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive — every variant has an explicit arm, so
    /// adding a variant without assigning its errno is a compile error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::NoSpace => libc::ENOSPC,
            Self::InvalidRequest(_) | Self::InvalidGeometry(_) | Self::Parse(_) => libc::EINVAL,
            Self::Unsupported(_) => libc::EOPNOTSUPP,
            Self::Corruption { .. } => libc::EIO,
        }
    }

    /// Whether the error indicates exhaustion rather than a fault.
    #[must_use]
    pub fn is_no_space(&self) -> bool {
        matches!(self, Self::NoSpace)
    }
}

/// Result alias using `RillError`.
pub type Result<T> = std::result::Result<T, RillError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(RillError, libc::c_int)> = vec![
            (RillError::Io(std::io::Error::other("test")), libc::EIO),
            (RillError::NoSpace, libc::ENOSPC),
            (RillError::InvalidRequest("shrink".into()), libc::EINVAL),
            (
                RillError::InvalidGeometry("block_size=0".into()),
                libc::EINVAL,
            ),
            (
                RillError::Unsupported("reflink enabled".into()),
                libc::EOPNOTSUPP,
            ),
            (
                RillError::Corruption {
                    block: 3,
                    detail: "summary underflow".into(),
                },
                libc::EIO,
            ),
            (RillError::Parse("bad magic".into()), libc::EINVAL),
        ];

        for (error, expected) in &cases {
            assert_eq!(error.to_errno(), *expected, "wrong errno for {error:?}");
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(RillError::Io(raw).to_errno(), libc::EPERM);
    }

    #[test]
    fn corruption_is_not_exhaustion() {
        let corrupt = RillError::Corruption {
            block: 0,
            detail: "test".into(),
        };
        assert!(!corrupt.is_no_space());
        assert!(RillError::NoSpace.is_no_space());
        // ENOSPC and EIO must stay distinct so callers can tell a full
        // group from a broken one.
        assert_ne!(corrupt.to_errno(), RillError::NoSpace.to_errno());
    }

    #[test]
    fn display_formatting() {
        assert_eq!(
            RillError::NoSpace.to_string(),
            "no space left in realtime group"
        );
        let err = RillError::Corruption {
            block: 42,
            detail: "summary count would go negative".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt allocation index at block 42: summary count would go negative"
        );
    }
}
