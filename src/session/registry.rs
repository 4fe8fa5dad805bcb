//! Per-thread run state.

use std::collections::BTreeMap;

use crate::common::{MemoryHandle, ThreadId, INVALID_HANDLE};

use super::DebugError;

/// Run state of a hardware thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Not observed since the session attached.
    Unknown,
    Running,
    Stopped,
}

/// Debugger-side record of one hardware thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EuThread {
    id: ThreadId,
    state: ThreadState,
    memory_handle: MemoryHandle,
    page_fault: bool,
    reported: bool,
    sr_counter: u8,
}

impl EuThread {
    pub(crate) fn new(id: ThreadId) -> EuThread {
        EuThread {
            id,
            state: ThreadState::Running,
            memory_handle: INVALID_HANDLE,
            page_fault: false,
            reported: false,
            sr_counter: 0,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn is_stopped(&self) -> bool {
        self.state == ThreadState::Stopped
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.state == ThreadState::Running
    }

    /// Address space the thread last stopped in.
    pub fn memory_handle(&self) -> MemoryHandle {
        self.memory_handle
    }

    #[cfg(test)]
    pub fn page_fault(&self) -> bool {
        self.page_fault
    }

    /// Whether the current stop was delivered to the debugger.
    pub fn reported(&self) -> bool {
        self.reported
    }

    fn transition(&mut self, next: ThreadState) {
        if self.state != next {
            log::trace!("{}: {:?} --> {:?}", self.id, self.state, next);
        }
        self.state = next;
    }

    /// Record that the thread stopped in address space `vm`. Returns
    /// `false` if it was already stopped.
    pub(crate) fn stop_thread(&mut self, vm: MemoryHandle) -> bool {
        self.memory_handle = vm;
        if self.state == ThreadState::Stopped {
            return false;
        }
        self.reported = false;
        self.transition(ThreadState::Stopped);
        true
    }

    /// Check a freshly read system-routine counter. Returns whether it
    /// shows the thread parked in SIP.
    pub(crate) fn verify_stopped(&mut self, counter: u8) -> bool {
        self.sr_counter = counter;
        if counter % 2 == 1 {
            return true;
        }

        if self.state == ThreadState::Stopped {
            log::warn!("{}: stopped but counter {} shows it running", self.id, counter);
            self.transition(ThreadState::Running);
        }
        false
    }

    /// Whether `counter` shows the thread left SIP since the last check.
    pub(crate) fn is_resumed(&self, counter: u8) -> bool {
        counter != self.sr_counter
    }

    /// Record that the thread was resumed. Returns `false` if it was not
    /// stopped.
    pub(crate) fn resume_thread(&mut self) -> bool {
        if self.state != ThreadState::Stopped {
            return false;
        }
        self.memory_handle = INVALID_HANDLE;
        self.page_fault = false;
        self.reported = false;
        self.transition(ThreadState::Running);
        true
    }

    pub(crate) fn report_as_stopped(&mut self) {
        self.reported = true;
    }

    pub(crate) fn set_page_fault(&mut self, fault: bool) {
        self.page_fault = fault;
    }
}

/// Every thread of a session, keyed by coordinate.
#[derive(Debug, Default)]
pub(crate) struct ThreadRegistry {
    threads: BTreeMap<ThreadId, EuThread>,
}

impl ThreadRegistry {
    pub fn new(ids: impl IntoIterator<Item = ThreadId>) -> ThreadRegistry {
        ThreadRegistry {
            threads: ids.into_iter().map(|id| (id, EuThread::new(id))).collect(),
        }
    }

    pub fn lookup(&self, id: &ThreadId) -> Result<&EuThread, DebugError> {
        self.threads.get(id).ok_or(DebugError::NotFound)
    }

    pub fn lookup_mut(&mut self, id: &ThreadId) -> Result<&mut EuThread, DebugError> {
        self.threads.get_mut(id).ok_or(DebugError::NotFound)
    }

    /// Threads that last stopped in address space `vm`.
    #[cfg(test)]
    pub fn all_handles_for_context(&self, vm: MemoryHandle) -> std::collections::BTreeSet<ThreadId> {
        self.threads
            .values()
            .filter(|t| t.memory_handle == vm)
            .map(|t| t.id)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EuThread> {
        self.threads.values()
    }

    /// Threads of `threads` that are not currently stopped. Unknown
    /// coordinates are skipped.
    pub fn not_stopped(&self, threads: &[ThreadId]) -> Vec<ThreadId> {
        threads
            .iter()
            .filter(|id| matches!(self.threads.get(id), Some(t) if !t.is_stopped()))
            .copied()
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.threads.len()
    }
}
