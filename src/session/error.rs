use core::fmt::{self, Display};

use crate::transport::TransportError;

/// An error returned by a debug session operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum DebugError {
    /// The device or firmware does not implement the operation.
    UnsupportedFeature,
    /// The firmware is too old for the operation (e.g: shared local memory
    /// access before SIP 2.1).
    UnsupportedVersion,
    /// The hardware did not respond, or the thread is not in the state the
    /// operation requires. The caller may retry.
    NotAvailable,
    /// Nothing to report yet (e.g: no event arrived before the timeout, or an
    /// interrupt for the same threads is still in flight).
    NotReady,
    /// Information the operation needs has not been published by the driver.
    Uninitialized,
    /// Malformed thread, register or memory descriptor.
    InvalidArgument,
    /// The thread coordinate does not exist on this device.
    NotFound,
    /// The debug connection was closed.
    DeviceLost,
    /// The caller is not permitted to debug the target.
    InsufficientPermissions,
    /// An error that maps to none of the above.
    Unknown,
}

impl From<TransportError> for DebugError {
    fn from(e: TransportError) -> Self {
        use crate::transport::TransportError::*;
        match e {
            Busy => DebugError::NotAvailable,
            NoDevice | Unsupported => DebugError::UnsupportedFeature,
            PermissionDenied => DebugError::InsufficientPermissions,
            InvalidArgument => DebugError::InvalidArgument,
            NotFound => DebugError::NotFound,
            Disconnected => DebugError::DeviceLost,
            Os(_) => DebugError::Unknown,
        }
    }
}

impl Display for DebugError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::DebugError::*;
        match self {
            UnsupportedFeature => write!(f, "operation not supported by the device"),
            UnsupportedVersion => write!(f, "operation not supported by this SIP version"),
            NotAvailable => write!(f, "hardware or thread not available for the operation"),
            NotReady => write!(f, "not ready"),
            Uninitialized => write!(f, "required debug state has not been published yet"),
            InvalidArgument => write!(f, "invalid argument"),
            NotFound => write!(f, "thread not found"),
            DeviceLost => write!(f, "debug connection lost"),
            InsufficientPermissions => write!(f, "insufficient permissions"),
            Unknown => write!(f, "unknown error"),
        }
    }
}

impl std::error::Error for DebugError {}
