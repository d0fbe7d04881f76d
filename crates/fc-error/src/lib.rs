#![forbid(unsafe_code)]
//! Error types for FrankenCache.
//!
//! # Error Taxonomy
//!
//! FrankenCache uses a two-layer error model:
//!
//! | Layer | Type | Purpose |
//! |-------|------|---------|
//! | Physical I/O | [`Errno`] | Completion status of a single bio; `Copy` so it can be aggregated first-error-wins from any completion context |
//! | Structural | [`FcError`] | Errors returned synchronously from create/delete/edit/quiesce and from submission paths |
//!
//! A physical error that must surface through a structural call converts via
//! `FcError::from(Errno)` into [`FcError::DeviceIo`], preserving the errno.
//!
//! ## errno Mapping
//!
//! Every `FcError` variant maps to exactly one POSIX errno via [`FcError::to_errno`].
//! The mapping is exhaustive (no wildcard arms) so adding a new variant is a
//! compile error until its errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `DeviceIo` | carried errno |
//! | `NoMemory` | `ENOMEM` |
//! | `NotFound` | `ENOENT` |
//! | `Exists` | `EEXIST` |
//! | `DeviceConflict` | `EINVAL` |
//! | `Busy` | `EBUSY` |
//! | `ShutdownInProgress` | `EBUSY` |
//! | `FailedState` | `ENODEV` |
//! | `Unsupported` | `EOPNOTSUPP` |
//! | `InvalidArgument` | `EINVAL` |
//! | `DirtyFlushIncomplete` | `EINVAL` |
//! | `Metadata` | `EIO` |
//!
//! ## Design Constraints
//!
//! - `fc-error` MUST NOT depend on any other workspace crate.
//! - All string payloads are owned (`String`) so errors can cross completion
//!   contexts and threads freely.

use std::fmt;
use thiserror::Error;

/// Completion status of one physical I/O, as a positive errno value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub i32);

impl Errno {
    pub const EIO: Self = Self(libc::EIO);
    pub const ENOMEM: Self = Self(libc::ENOMEM);
    pub const EINVAL: Self = Self(libc::EINVAL);
    pub const ENODEV: Self = Self(libc::ENODEV);
    pub const EOPNOTSUPP: Self = Self(libc::EOPNOTSUPP);

    #[must_use]
    pub fn get(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.0 {
            libc::EIO => "EIO",
            libc::ENOMEM => "ENOMEM",
            libc::EINVAL => "EINVAL",
            libc::ENODEV => "ENODEV",
            libc::EOPNOTSUPP => "EOPNOTSUPP",
            libc::EBUSY => "EBUSY",
            _ => return write!(f, "errno {}", self.0),
        };
        write!(f, "{name} ({})", self.0)
    }
}

/// Physical I/O completion status.
pub type IoStatus = std::result::Result<(), Errno>;

/// Unified error type for all FrankenCache operations.
#[derive(Debug, Error)]
pub enum FcError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A physical submission completed with an error.
    #[error("device I/O failed on {device}: {errno}")]
    DeviceIo { device: String, errno: Errno },

    /// Buffer or tracking-object exhaustion. Partially allocated resources
    /// have already been unwound when this is returned.
    #[error("out of memory: {0}")]
    NoMemory(String),

    /// Named cache or device does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A cache with the same name is already registered.
    #[error("already exists: {0}")]
    Exists(String),

    /// Whole-disk/partition exclusivity, overlap, or same-disk source/cache.
    #[error("device conflict: {0}")]
    DeviceConflict(String),

    /// Another structural operation is in progress on the instance.
    #[error("busy: {0}")]
    Busy(String),

    /// Reboot/shutdown quiesce owns the instance.
    #[error("shutdown in progress: {0}")]
    ShutdownInProgress(String),

    /// Instance is failed or degraded and refuses structural operations.
    #[error("cache in failed state: {0}")]
    FailedState(String),

    /// Operation cannot be honoured (e.g. discard straddling a cache boundary).
    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Dirty blocks remained after the flush retry budget or a shutdown pre-emption.
    #[error("failed to flush {remaining} dirty blocks for cache {name}")]
    DirtyFlushIncomplete { name: String, remaining: u64 },

    /// Metadata persistence failed.
    #[error("metadata error: {0}")]
    Metadata(String),
}

impl FcError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive: every variant has an explicit arm.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::DeviceIo { errno, .. } => errno.0,
            Self::NoMemory(_) => libc::ENOMEM,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists(_) => libc::EEXIST,
            Self::DeviceConflict(_)
            | Self::InvalidArgument(_)
            | Self::DirtyFlushIncomplete { .. } => libc::EINVAL,
            Self::Busy(_) | Self::ShutdownInProgress(_) => libc::EBUSY,
            Self::FailedState(_) => libc::ENODEV,
            Self::Unsupported(_) => libc::EOPNOTSUPP,
            Self::Metadata(_) => libc::EIO,
        }
    }

    /// The errno as a bio completion status.
    #[must_use]
    pub fn as_errno(&self) -> Errno {
        Errno(self.to_errno())
    }
}

impl From<Errno> for FcError {
    fn from(errno: Errno) -> Self {
        Self::DeviceIo {
            device: "unknown".to_owned(),
            errno,
        }
    }
}

/// Result alias using `FcError`.
pub type Result<T> = std::result::Result<T, FcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(FcError, libc::c_int)> = vec![
            (FcError::Io(std::io::Error::other("test")), libc::EIO),
            (
                FcError::DeviceIo {
                    device: "sdb".into(),
                    errno: Errno(libc::ENOSPC),
                },
                libc::ENOSPC,
            ),
            (FcError::NoMemory("pool".into()), libc::ENOMEM),
            (FcError::NotFound("c1".into()), libc::ENOENT),
            (FcError::Exists("c1".into()), libc::EEXIST),
            (FcError::DeviceConflict("sdb".into()), libc::EINVAL),
            (FcError::Busy("c1".into()), libc::EBUSY),
            (FcError::ShutdownInProgress("c1".into()), libc::EBUSY),
            (FcError::FailedState("c1".into()), libc::ENODEV),
            (FcError::Unsupported("discard".into()), libc::EOPNOTSUPP),
            (FcError::InvalidArgument("mode".into()), libc::EINVAL),
            (
                FcError::DirtyFlushIncomplete {
                    name: "c1".into(),
                    remaining: 3,
                },
                libc::EINVAL,
            ),
            (FcError::Metadata("store".into()), libc::EIO),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        let err = FcError::Io(raw);
        assert_eq!(err.to_errno(), libc::EPERM);
    }

    #[test]
    fn errno_round_trips_through_device_io() {
        let err = FcError::from(Errno::ENOMEM);
        assert_eq!(err.as_errno(), Errno::ENOMEM);
        assert!(matches!(err, FcError::DeviceIo { .. }));
    }

    #[test]
    fn display_formatting() {
        let err = FcError::DirtyFlushIncomplete {
            name: "c1".into(),
            remaining: 12,
        };
        assert_eq!(
            err.to_string(),
            "failed to flush 12 dirty blocks for cache c1"
        );
        assert_eq!(Errno::EIO.to_string(), format!("EIO ({})", libc::EIO));
        assert_eq!(Errno(4242).to_string(), "errno 4242");
    }
}
