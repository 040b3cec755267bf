//! Error type of the emulation core.

use sbi_spec::binary;

/// Failure of an emulation entry point.
///
/// `NotSupported` is the common case: the access was not one the emulation
/// layer claims, and the firmware should redirect the original trap as an
/// illegal-instruction exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HextError {
    /// Not implemented, not enabled, or trapped from the wrong mode.
    NotSupported,
    /// Hypervisor instruction from U-mode without `hstatus.HU`.
    Denied,
    /// Required device (main memory node, cpus node) not found.
    NoDevice,
    /// Malformed input at initialization time.
    Failed,
    /// Not enough room for shadow page tables or device tree growth.
    NoMemory,
}

impl HextError {
    /// SBI error code for this error.
    #[must_use]
    pub const fn code(self) -> usize {
        match self {
            HextError::NotSupported => binary::RET_ERR_NOT_SUPPORTED,
            HextError::Denied => binary::RET_ERR_DENIED,
            // SBI has no NODEV/NOMEM counterparts; both degrade to FAILED.
            HextError::NoDevice | HextError::Failed | HextError::NoMemory => {
                binary::RET_ERR_FAILED
            }
        }
    }
}

/// Result alias for the emulation core.
pub type Result<T> = core::result::Result<T, HextError>;
