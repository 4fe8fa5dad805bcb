//! Debugger-visible events and the queue that delivers them.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use bitflags::bitflags;

use crate::common::DeviceThread;
use crate::util::lock;

bitflags! {
    /// Flags attached to a [`DebugEvent`].
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct DebugEventFlags: u32 {
        /// The event must be passed to `acknowledge_event`.
        const NEED_ACK = 1 << 0;
    }
}

/// Why a session detached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum DetachReason {
    /// The debug connection became invalid.
    Invalid,
    /// The debugged process exited.
    HostExit,
}

/// Why a page fault was reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum PageFaultReason {
    /// The address has no mapping.
    MappingError,
    /// The mapping forbids the access.
    PermissionError,
}

/// A module loaded or unloaded on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleEvent {
    /// Start of the module's ELF image, readable with `read_memory`.
    pub module_begin: u64,
    /// End of the module's ELF image.
    pub module_end: u64,
    /// GPU address the module was loaded at.
    pub load: u64,
}

/// The payload of a [`DebugEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum DebugEventKind {
    /// The session is gone. No further events follow.
    Detached { reason: DetachReason },
    /// The debugged process started using the device.
    ProcessEntry,
    /// The debugged process stopped using the device.
    ProcessExit,
    ModuleLoad(ModuleEvent),
    ModuleUnload(ModuleEvent),
    /// The thread (or group) stopped and can be inspected.
    ThreadStopped(DeviceThread),
    /// The thread (or group) could not be stopped in time.
    ThreadUnavailable(DeviceThread),
    /// A thread faulted on `address`.
    PageFault {
        address: u64,
        mask: u64,
        reason: PageFaultReason,
    },
}

/// An event delivered to the debugger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugEvent {
    pub kind: DebugEventKind,
    pub flags: DebugEventFlags,
}

impl DebugEvent {
    pub fn new(kind: DebugEventKind) -> DebugEvent {
        DebugEvent {
            kind,
            flags: DebugEventFlags::empty(),
        }
    }

    pub fn with_flags(kind: DebugEventKind, flags: DebugEventFlags) -> DebugEvent {
        DebugEvent { kind, flags }
    }

    pub fn needs_ack(&self) -> bool {
        self.flags.contains(DebugEventFlags::NEED_ACK)
    }
}

impl From<DebugEventKind> for DebugEvent {
    fn from(kind: DebugEventKind) -> Self {
        DebugEvent::new(kind)
    }
}

/// FIFO of events awaiting the debugger.
///
/// Producers push from the session worker or from synchronous calls; the
/// consumer blocks in [`EventQueue::pop`] until an event arrives or the
/// timeout elapses.
#[derive(Debug, Default)]
pub(crate) struct EventQueue {
    events: Mutex<VecDeque<DebugEvent>>,
    ready: Condvar,
}

impl EventQueue {
    pub fn new() -> EventQueue {
        EventQueue::default()
    }

    pub fn push(&self, event: DebugEvent) {
        log::debug!("event queued: {:?}", event.kind);
        lock(&self.events).push_back(event);
        self.ready.notify_all();
    }

    /// Pop the oldest event, waiting up to `timeout` for one to arrive.
    pub fn pop(&self, timeout: Duration) -> Option<DebugEvent> {
        let guard = lock(&self.events);
        let (mut events, _) = self
            .ready
            .wait_timeout_while(guard, timeout, |events| events.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        events.pop_front()
    }

    /// Drop every queued event.
    pub fn clear(&self) {
        lock(&self.events).clear();
    }

    /// Wake every waiter without queueing anything.
    pub fn wake(&self) {
        self.ready.notify_all();
    }
}
