//! Deciding whether a stopped thread should be reported.
//!
//! A device-wide interrupt stops every thread on the device, including
//! threads nobody asked to stop. Such threads are resumed silently instead
//! of being reported to the debugger. The predicate deciding this is a
//! firmware convention and is injected through
//! [`DebugSessionBuilder::stop_classifier`].
//!
//! [`DebugSessionBuilder::stop_classifier`]: super::DebugSessionBuilder::stop_classifier

use crate::sip::SipVersion;

/// Bits of `cr0.1` describing why a thread entered the system routine.
pub const EXCEPTION_MASK: u32 = 0xFC00_0000;
/// Set in `cr0.1` when the thread was stopped by a forced exception.
pub const FORCED_EXCEPTION: u32 = 0x0400_0000;
/// Set in `cr0.1` when the thread was halted externally.
pub const FORCED_EXTERNAL_HALT: u32 = 0x4000_0000;
/// Set in `cr0.1` when the thread hit a breakpoint.
pub const BREAKPOINT: u32 = 0x8000_0000;

/// Saved condition state of a stopped thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadStopState {
    /// `cr0.1`.
    pub exception_bits: u32,
    /// `cr0.2`, the instruction pointer the thread stopped at.
    pub ip: u32,
    /// `dbg0.0`, the instruction pointer the thread started at. `None` when
    /// the firmware does not save the debug registers.
    pub start_ip: Option<u32>,
}

impl ThreadStopState {
    /// Whether the only recorded stop causes are a forced exception and/or
    /// an external halt.
    pub fn is_forced_exception_only(&self) -> bool {
        let reasons = self.exception_bits & EXCEPTION_MASK;
        reasons != 0 && reasons & !(FORCED_EXCEPTION | FORCED_EXTERNAL_HALT) == 0
    }
}

/// Decides whether a stop is an artifact of a broadcast interrupt.
pub trait StopClassifier: Send + Sync {
    /// Return `true` to resume the thread without reporting it.
    fn is_accidental_stop(&self, version: SipVersion, state: &ThreadStopState) -> bool;
}

impl<F> StopClassifier for F
where
    F: Fn(SipVersion, &ThreadStopState) -> bool + Send + Sync,
{
    fn is_accidental_stop(&self, version: SipVersion, state: &ThreadStopState) -> bool {
        self(version, state)
    }
}

/// The default classifier: a thread stopped only by a forced exception that
/// has not executed a single instruction was caught by an interrupt meant
/// for someone else.
#[derive(Debug, Default, Clone, Copy)]
pub struct ForcedExceptionAtStartIp;

impl StopClassifier for ForcedExceptionAtStartIp {
    fn is_accidental_stop(&self, _version: SipVersion, state: &ThreadStopState) -> bool {
        state.is_forced_exception_only() && state.start_ip == Some(state.ip)
    }
}
