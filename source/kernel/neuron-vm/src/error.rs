// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error types shared by every VM component.

use thiserror::Error;

use crate::hal::PmapError;

/// Result alias used throughout the VM core.
pub type VmResult<T> = Result<T, VmError>;

/// Failures reported by VM operations.
///
/// Exhaustion (`OutOfMemory`, `NoVirtualSpace`, `FetchFailed`) is kept apart
/// from policy violations so callers can decide between retry-later and
/// reject. Internal invariant violations never surface here; they panic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("no free virtual range of the requested size")]
    NoVirtualSpace,
    #[error("backing store fetch failed")]
    FetchFailed,
    #[error("access not permitted by mapping protection")]
    PermissionDenied,
    #[error("address not mapped")]
    NotMapped,
    #[error("range overlaps an existing mapping")]
    Overlap,
    #[error("address, size or offset not page aligned")]
    Misaligned,
    #[error("range outside the map bounds")]
    OutOfBounds,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("page table: {0}")]
    Pmap(#[from] PmapError),
}

impl VmError {
    /// Resource ran out; the same request may succeed later.
    pub const fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            Self::OutOfMemory
                | Self::NoVirtualSpace
                | Self::FetchFailed
                | Self::Pmap(PmapError::NoMemory)
        )
    }

    /// Request was rejected by policy; retrying it unchanged never helps.
    pub const fn is_policy(&self) -> bool {
        !self.is_exhaustion()
    }
}

/// Failures reported by a [`crate::object::FileServer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum IoError {
    #[error("file server unreachable")]
    Unreachable,
    #[error("no such file")]
    NoSuchFile,
    #[error("read beyond end of file")]
    EndOfFile,
}

impl From<IoError> for VmError {
    fn from(_: IoError) -> Self {
        Self::FetchFailed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_disjoint() {
        let all = [
            VmError::OutOfMemory,
            VmError::NoVirtualSpace,
            VmError::FetchFailed,
            VmError::PermissionDenied,
            VmError::NotMapped,
            VmError::Overlap,
            VmError::Misaligned,
            VmError::OutOfBounds,
            VmError::InvalidArgument,
            VmError::Pmap(PmapError::NoMemory),
            VmError::Pmap(PmapError::Overlap),
        ];
        for err in all {
            assert_ne!(err.is_exhaustion(), err.is_policy(), "{err:?}");
        }
        assert!(VmError::Pmap(PmapError::NoMemory).is_exhaustion());
        assert!(VmError::NotMapped.is_policy());
    }

    #[test]
    fn io_errors_surface_as_fetch_failures() {
        assert_eq!(VmError::from(IoError::EndOfFile), VmError::FetchFailed);
        assert_eq!(VmError::OutOfMemory.to_string(), "out of physical memory");
    }
}
