//! Kernel Return Codes
//!
//! Based on Mach4 mach/kern_return.h
//!
//! Map operations report failures through [`KernError`]; the numeric Mach
//! codes survive only at the `vm_user` boundary, where [`kern_return`]
//! folds a result back into a `kern_return_t` style integer.

use thiserror::Error;

/// Mach `kern_return_t`
pub type KernReturn = i32;

pub const KERN_SUCCESS: KernReturn = 0;
pub const KERN_INVALID_ADDRESS: KernReturn = 1;
pub const KERN_PROTECTION_FAILURE: KernReturn = 2;
pub const KERN_NO_SPACE: KernReturn = 3;
pub const KERN_INVALID_ARGUMENT: KernReturn = 4;
pub const KERN_FAILURE: KernReturn = 5;
pub const KERN_RESOURCE_SHORTAGE: KernReturn = 6;
pub const KERN_MEMORY_ERROR: KernReturn = 10;
pub const KERN_WRITE_PROTECTION_FAILURE: KernReturn = 24;

/// Failure kinds of the VM map layer
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernError {
    /// Lookup failed, or a range is unmapped or has a hole
    #[error("invalid address")]
    InvalidAddress,

    /// Bad alignment, malformed size, or a sub-map where a leaf was required
    #[error("invalid argument")]
    InvalidArgument,

    /// No free region large enough, or the range exceeds the map bounds
    #[error("no space available in map")]
    NoSpace,

    /// Requested access exceeds the entry protection
    #[error("protection failure")]
    ProtectionFailure,

    /// Write attempted on an entry that only carries the notify right
    #[error("write protection failure")]
    WriteProtectionFailure,

    /// Generic failure (wiring validation, forbidden overwrite, failed fork copy)
    #[error("operation failed")]
    Failure,

    /// The backing object reported an unrecoverable error
    #[error("memory error")]
    MemoryError,

    /// Physical pages or zone elements ran out
    #[error("resource shortage")]
    ResourceShortage,
}

impl KernError {
    /// Mach numeric code for this error
    pub const fn code(self) -> KernReturn {
        match self {
            KernError::InvalidAddress => KERN_INVALID_ADDRESS,
            KernError::InvalidArgument => KERN_INVALID_ARGUMENT,
            KernError::NoSpace => KERN_NO_SPACE,
            KernError::ProtectionFailure => KERN_PROTECTION_FAILURE,
            KernError::WriteProtectionFailure => KERN_WRITE_PROTECTION_FAILURE,
            KernError::Failure => KERN_FAILURE,
            KernError::MemoryError => KERN_MEMORY_ERROR,
            KernError::ResourceShortage => KERN_RESOURCE_SHORTAGE,
        }
    }

    /// Inverse of [`KernError::code`]; `None` for success and unknown codes
    pub const fn from_code(code: KernReturn) -> Option<Self> {
        match code {
            KERN_INVALID_ADDRESS => Some(KernError::InvalidAddress),
            KERN_INVALID_ARGUMENT => Some(KernError::InvalidArgument),
            KERN_NO_SPACE => Some(KernError::NoSpace),
            KERN_PROTECTION_FAILURE => Some(KernError::ProtectionFailure),
            KERN_WRITE_PROTECTION_FAILURE => Some(KernError::WriteProtectionFailure),
            KERN_FAILURE => Some(KernError::Failure),
            KERN_MEMORY_ERROR => Some(KernError::MemoryError),
            KERN_RESOURCE_SHORTAGE => Some(KernError::ResourceShortage),
            _ => None,
        }
    }
}

/// Result type used throughout the map layer
pub type KernResult<T> = Result<T, KernError>;

/// Fold a result into a Mach return code
pub fn kern_return<T>(result: &KernResult<T>) -> KernReturn {
    match result {
        Ok(_) => KERN_SUCCESS,
        Err(err) => err.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip() {
        let all = [
            KernError::InvalidAddress,
            KernError::InvalidArgument,
            KernError::NoSpace,
            KernError::ProtectionFailure,
            KernError::WriteProtectionFailure,
            KernError::Failure,
            KernError::MemoryError,
            KernError::ResourceShortage,
        ];
        for err in all {
            assert_eq!(KernError::from_code(err.code()), Some(err));
        }
        assert_eq!(KernError::from_code(KERN_SUCCESS), None);
    }

    #[test]
    fn test_kern_return() {
        assert_eq!(kern_return(&Ok::<u64, KernError>(7)), KERN_SUCCESS);
        assert_eq!(kern_return::<()>(&Err(KernError::NoSpace)), KERN_NO_SPACE);
    }
}
