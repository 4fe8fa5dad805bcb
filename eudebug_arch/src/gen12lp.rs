//! Implementation for Gen12 low-power (Tiger Lake, DG1 and relatives).

use eudebug::arch::Arch;

/// Gen12 low-power devices.
///
/// Thread control on these parts applies a resume to both halves of each
/// dword pair of the attention bitmask, and version 1 firmware expects a
/// resume bit in the saved thread state.
pub enum Gen12Lp {}

impl Arch for Gen12Lp {
    const RESUME_WA_REQUIRED: bool = true;
}
