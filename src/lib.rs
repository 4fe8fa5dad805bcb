//! An engine for debugging threads running on GPU execution units.
//!
//! `eudebug` sits between a debugger front-end and the kernel driver's debug
//! interface. It keeps track of every hardware thread of the device,
//! interrupts and resumes them, reads and writes their registers through the
//! firmware's state save area, reaches shared local memory through the
//! system routine (SIP), and turns raw driver notifications into
//! [`DebugEvent`](session::DebugEvent)s.
//!
//! ## Getting started
//!
//! 1. Implement [`Transport`](transport::Transport) for your driver
//!    interface, choosing an [`Arch`](arch::Arch) for the device (see the
//!    companion `eudebug_arch` crate).
//! 2. Attach with [`DebugSessionBuilder`](session::DebugSessionBuilder).
//! 3. Poll [`DebugSession::read_event`](session::DebugSession::read_event)
//!    and act on the events.
//!
//! ```rust,ignore
//! let session = DebugSessionBuilder::new(transport)
//!     .interrupt_timeout(Duration::from_secs(1))
//!     .build()?;
//!
//! session.interrupt(DeviceThread::ALL)?;
//! loop {
//!     match session.read_event(Duration::from_millis(100)) {
//!         Ok(event) => handle(event),
//!         Err(DebugError::NotReady) => continue,
//!         Err(e) => break,
//!     }
//! }
//! ```
//!
//! ## Feature flags
//!
//! - `trace-bitmask` (default): log attention bitmasks at `trace` level.

pub mod arch;
pub mod common;
pub mod session;
pub mod sip;
pub mod transport;

mod util;

#[cfg(test)]
mod test_util;

pub use session::{DebugError, DebugSession, DebugSessionBuilder, TileSession};
