//! The kernel-driver capability consumed by a debug session.
//!
//! A [`Transport`] hides the OS-specific channel to the kernel driver
//! (ioctls on one platform, escape calls on another). The engine only needs
//! GPU memory access, EU thread control, and a stream of typed driver
//! events.
//!
//! Backends are selected when the session is built. Any
//! `Box<dyn Transport<Arch = A>>` or `Arc<T>` is itself a `Transport`, so a
//! backend can be chosen at runtime or shared with other owners.

use core::fmt::{self, Display};
use core::time::Duration;

use crate::arch::Arch;
use crate::common::{MemoryHandle, Topology};

mod event;
mod impls;

pub use event::*;

/// Commands for the EU thread control interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EuControlCmd {
    /// Interrupt every thread of the tile.
    InterruptAll,
    /// Resume the threads selected by the bitmask.
    Resume,
    /// Fill the bitmask with the threads currently stopped.
    Stopped,
}

/// A thread control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EuControl {
    pub client: u64,
    pub tile: u32,
    pub cmd: EuControlCmd,
}

/// An error reported by a transport backend.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportError {
    /// The driver is busy with another request.
    Busy,
    /// The device does not support debugging.
    NoDevice,
    /// The caller lacks permission to debug the target.
    PermissionDenied,
    /// The driver rejected the request's arguments.
    InvalidArgument,
    /// The referenced object no longer exists.
    NotFound,
    /// The debug connection was closed by the driver. Permanent.
    Disconnected,
    /// The operation is not implemented by this backend.
    Unsupported,
    /// Any other OS error, carrying the raw error code.
    Os(i32),
}

impl Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::TransportError::*;
        match self {
            Busy => write!(f, "driver busy"),
            NoDevice => write!(f, "device does not support debugging"),
            PermissionDenied => write!(f, "permission denied"),
            InvalidArgument => write!(f, "invalid argument"),
            NotFound => write!(f, "object not found"),
            Disconnected => write!(f, "debug connection closed"),
            Unsupported => write!(f, "operation not supported by transport"),
            Os(code) => write!(f, "os error {}", code),
        }
    }
}

impl std::error::Error for TransportError {}

/// Access to the kernel driver's debug interface.
pub trait Transport: Send + Sync + 'static {
    /// Attention bitmask and resume conventions of the device.
    type Arch: Arch;

    /// Thread and tile topology of the device. Queried once on attach.
    fn topology(&self) -> Topology;

    /// Read GPU virtual memory of address space `vm`.
    fn read_gpu_memory(
        &self,
        vm: MemoryHandle,
        gpu_va: u64,
        buf: &mut [u8],
    ) -> Result<(), TransportError>;

    /// Write GPU virtual memory of address space `vm`.
    fn write_gpu_memory(
        &self,
        vm: MemoryHandle,
        gpu_va: u64,
        buf: &[u8],
    ) -> Result<(), TransportError>;

    /// Issue a thread control request.
    ///
    /// `bitmask` is laid out per [`Arch::attention_bitmask`]; it is read for
    /// [`EuControlCmd::Resume`] and filled in for [`EuControlCmd::Stopped`].
    /// Returns the driver sequence number assigned to the request.
    fn eu_control(&self, request: EuControl, bitmask: &mut [u8]) -> Result<u64, TransportError>;

    /// Wait up to `timeout` for the next driver event.
    ///
    /// `Ok(None)` on timeout. [`TransportError::Disconnected`] signals the
    /// connection is gone for good.
    fn read_event(&self, timeout: Duration) -> Result<Option<DriverEvent>, TransportError>;

    /// Acknowledge a driver event that was flagged [`EventFlags::NEED_ACK`].
    fn ack_event(&self, ack: EventAck) -> Result<(), TransportError>;
}
