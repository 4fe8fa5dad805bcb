//! The debug session engine.
//!
//! A [`DebugSession`] is created with a [`DebugSessionBuilder`] over a
//! [`Transport`]. Once attached, a background worker consumes driver
//! events, turns raised attention into thread stops, and queues
//! [`DebugEvent`]s for the debugger to collect with
//! [`DebugSession::read_event`].
//!
//! With [`DebugSessionBuilder::tile_attach`] enabled, each tile of the
//! device gets its own event queue and thread registry, reachable through
//! [`DebugSession::attach_tile`]. The root session then only reports
//! `Detached` itself, while its thread operations are routed to the tile
//! owning the selected threads.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use crate::common::{DeviceThread, MemorySpaceDesc};
use crate::sip::regset::RegsetProperties;
use crate::sip::RegsetType;
use crate::transport::Transport;

mod builder;
mod classify;
mod core_impl;
mod error;
mod events;
mod registry;
mod sip_channel;
mod state_save;
mod worker;

pub use builder::{DebugSessionBuilder, DebugSessionBuilderError};
pub use classify::{
    ForcedExceptionAtStartIp, StopClassifier, ThreadStopState, BREAKPOINT, EXCEPTION_MASK,
    FORCED_EXCEPTION, FORCED_EXTERNAL_HALT,
};
pub use error::DebugError;
pub use events::{
    DebugEvent, DebugEventFlags, DebugEventKind, DetachReason, ModuleEvent, PageFaultReason,
};
pub use registry::ThreadState;

use self::core_impl::SessionCore;
use self::worker::Worker;

/// State shared between a session and its tile handles. Workers stop when
/// the last handle goes away.
struct SessionShared<T: Transport> {
    workers: Vec<Worker>,
    core: Arc<SessionCore<T>>,
}

impl<T: Transport> Drop for SessionShared<T> {
    fn drop(&mut self) {
        log::debug!("stopping {} session worker(s)", self.workers.len());
        for worker in &mut self.workers {
            worker.stop();
        }
    }
}

/// An attached debug session.
///
/// Every method may be called from any thread.
pub struct DebugSession<T: Transport> {
    shared: Arc<SessionShared<T>>,
}

impl<T: Transport> DebugSession<T> {
    /// Spawn the workers of an attached root core.
    fn start(core: Arc<SessionCore<T>>) -> std::io::Result<DebugSession<T>> {
        let mut workers = Vec::with_capacity(1 + core.tiles().len());

        let root = Arc::clone(&core);
        workers.push(Worker::spawn("eudebug-root", move |token| {
            worker::root_cycle(&root, token)
        })?);

        for (index, tile) in core.tiles().iter().enumerate() {
            let tile = Arc::clone(tile);
            workers.push(Worker::spawn(format!("eudebug-tile{}", index), move |token| {
                if tile.is_detached() {
                    return ControlFlow::Break(());
                }
                worker::tile_cycle(&tile, token)
            })?);
        }

        Ok(DebugSession {
            shared: Arc::new(SessionShared { workers, core }),
        })
    }

    fn core(&self) -> &SessionCore<T> {
        &self.shared.core
    }

    /// Request an interrupt of `thread`.
    ///
    /// The request is sent to the hardware by the session worker. Its
    /// outcome arrives as a `ThreadStopped` or `ThreadUnavailable` event.
    pub fn interrupt(&self, thread: DeviceThread) -> Result<(), DebugError> {
        self.core().fan_out(thread, |core, thread| core.interrupt(thread))
    }

    /// Resume the stopped threads selected by `thread`.
    pub fn resume(&self, thread: DeviceThread) -> Result<(), DebugError> {
        self.core().fan_out(thread, |core, thread| core.resume(thread))
    }

    /// Read registers `start..start + count` of set `ty` of a stopped thread.
    pub fn read_registers(
        &self,
        thread: DeviceThread,
        ty: RegsetType,
        start: u32,
        count: u32,
        buf: &mut [u8],
    ) -> Result<(), DebugError> {
        self.core().fan_out(thread, |core, thread| {
            core.read_registers(thread, ty, start, count, &mut *buf)
        })
    }

    /// Write registers `start..start + count` of set `ty` of a stopped
    /// thread.
    pub fn write_registers(
        &self,
        thread: DeviceThread,
        ty: RegsetType,
        start: u32,
        count: u32,
        buf: &[u8],
    ) -> Result<(), DebugError> {
        self.core()
            .fan_out(thread, |core, thread| core.write_registers(thread, ty, start, count, buf))
    }

    /// Read device memory on behalf of `thread`, or of any thread when
    /// `thread` is [`DeviceThread::ALL`].
    pub fn read_memory(
        &self,
        thread: DeviceThread,
        desc: &MemorySpaceDesc,
        buf: &mut [u8],
    ) -> Result<(), DebugError> {
        if thread.is_all() {
            return self.core().read_memory(thread, desc, buf);
        }
        self.core()
            .fan_out(thread, |core, thread| core.read_memory(thread, desc, &mut *buf))
    }

    /// Write device memory on behalf of `thread`, or of any thread when
    /// `thread` is [`DeviceThread::ALL`].
    pub fn write_memory(
        &self,
        thread: DeviceThread,
        desc: &MemorySpaceDesc,
        buf: &[u8],
    ) -> Result<(), DebugError> {
        if thread.is_all() {
            return self.core().write_memory(thread, desc, buf);
        }
        self.core()
            .fan_out(thread, |core, thread| core.write_memory(thread, desc, buf))
    }

    /// Wait up to `timeout` for the next event.
    ///
    /// Fails with [`DebugError::NotReady`] on timeout, and with
    /// [`DebugError::DeviceLost`] once the session detached and every event
    /// has been read.
    pub fn read_event(&self, timeout: Duration) -> Result<DebugEvent, DebugError> {
        read_event(self.core(), timeout)
    }

    /// Acknowledge an event flagged [`DebugEventFlags::NEED_ACK`].
    pub fn acknowledge_event(&self, event: &DebugEvent) -> Result<(), DebugError> {
        self.core().acknowledge_event(None, event)
    }

    /// Properties of every register set of the device's threads.
    pub fn register_set_properties(&self) -> Result<Vec<RegsetProperties>, DebugError> {
        self.core().register_set_properties()
    }

    /// Run state of a single thread.
    pub fn thread_state(&self, thread: DeviceThread) -> Result<ThreadState, DebugError> {
        self.core()
            .fan_out(thread, |core, thread| core.thread_state(&thread))
    }

    /// Number of tiles of the device.
    pub fn tile_count(&self) -> u32 {
        self.core().topology().tile_count()
    }

    /// Attach a debugger to tile `index`.
    ///
    /// Requires [`DebugSessionBuilder::tile_attach`]. Fails with
    /// [`DebugError::NotAvailable`] while another handle to the tile is
    /// alive.
    pub fn attach_tile(&self, index: u32) -> Result<TileSession<T>, DebugError> {
        if !self.core().has_tiles() {
            return Err(DebugError::UnsupportedFeature);
        }
        if index >= self.tile_count() {
            return Err(DebugError::InvalidArgument);
        }
        let core = self
            .core()
            .attach_tile(index)
            .ok_or(DebugError::NotAvailable)?;
        Ok(TileSession {
            shared: Arc::clone(&self.shared),
            core,
            index,
        })
    }

    /// Whether a [`TileSession`] for tile `index` is alive.
    pub fn is_tile_attached(&self, index: u32) -> bool {
        self.core().is_tile_attached(index)
    }

    /// Whether no [`TileSession`] is alive.
    pub fn are_all_tiles_detached(&self) -> bool {
        self.core().are_all_tiles_detached()
    }

    /// Whether the session lost its connection to the device.
    pub fn is_detached(&self) -> bool {
        self.core().is_detached()
    }
}

/// A debugger attached to one tile of a [`DebugSession`].
///
/// Thread coordinates are tile-local: `slice` counts the enabled slices of
/// this tile only. Dropping the handle detaches the tile and acknowledges
/// any module binds held for it.
pub struct TileSession<T: Transport> {
    shared: Arc<SessionShared<T>>,
    core: Arc<SessionCore<T>>,
    index: u32,
}

impl<T: Transport> TileSession<T> {
    /// Index of the tile.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn interrupt(&self, thread: DeviceThread) -> Result<(), DebugError> {
        self.core.interrupt(thread)
    }

    pub fn resume(&self, thread: DeviceThread) -> Result<(), DebugError> {
        self.core.resume(thread)
    }

    pub fn read_registers(
        &self,
        thread: DeviceThread,
        ty: RegsetType,
        start: u32,
        count: u32,
        buf: &mut [u8],
    ) -> Result<(), DebugError> {
        self.core.read_registers(thread, ty, start, count, buf)
    }

    pub fn write_registers(
        &self,
        thread: DeviceThread,
        ty: RegsetType,
        start: u32,
        count: u32,
        buf: &[u8],
    ) -> Result<(), DebugError> {
        self.core.write_registers(thread, ty, start, count, buf)
    }

    pub fn read_memory(
        &self,
        thread: DeviceThread,
        desc: &MemorySpaceDesc,
        buf: &mut [u8],
    ) -> Result<(), DebugError> {
        self.core.read_memory(thread, desc, buf)
    }

    pub fn write_memory(
        &self,
        thread: DeviceThread,
        desc: &MemorySpaceDesc,
        buf: &[u8],
    ) -> Result<(), DebugError> {
        self.core.write_memory(thread, desc, buf)
    }

    /// See [`DebugSession::read_event`].
    pub fn read_event(&self, timeout: Duration) -> Result<DebugEvent, DebugError> {
        read_event(&self.core, timeout)
    }

    pub fn acknowledge_event(&self, event: &DebugEvent) -> Result<(), DebugError> {
        self.shared.core.acknowledge_event(Some(self.index), event)
    }

    pub fn register_set_properties(&self) -> Result<Vec<RegsetProperties>, DebugError> {
        self.core.register_set_properties()
    }

    pub fn thread_state(&self, thread: DeviceThread) -> Result<ThreadState, DebugError> {
        self.core.thread_state(&thread)
    }
}

impl<T: Transport> Drop for TileSession<T> {
    fn drop(&mut self) {
        self.shared.core.detach_tile(self.index);
    }
}

fn read_event<T: Transport>(core: &SessionCore<T>, timeout: Duration) -> Result<DebugEvent, DebugError> {
    match core.events().pop(timeout) {
        Some(event) => Ok(event),
        None if core.is_detached() => Err(DebugError::DeviceLost),
        None => Err(DebugError::NotReady),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{FakeTransport, Scenario};

    fn session(scenario: Scenario, tile_attach: bool) -> DebugSession<FakeTransport> {
        let _ = pretty_env_logger::try_init();
        let transport = FakeTransport::new(scenario);
        transport.push_attach_events();
        DebugSessionBuilder::new(transport)
            .tile_attach(tile_attach)
            .event_poll_timeout(Duration::from_millis(5))
            .build()
            .unwrap()
    }

    #[test]
    fn disconnect_detaches_then_reports_device_lost() {
        let session = session(Scenario::default(), false);
        assert_eq!(
            session.read_event(Duration::from_millis(1)),
            Err(DebugError::NotReady)
        );

        session.core().transport().disconnect();
        let event = session.read_event(Duration::from_secs(10)).unwrap();
        assert_eq!(
            event.kind,
            DebugEventKind::Detached {
                reason: DetachReason::Invalid
            }
        );
        assert!(session.is_detached());
        assert_eq!(
            session.read_event(Duration::from_millis(1)),
            Err(DebugError::DeviceLost)
        );
    }

    #[test]
    fn attach_tile_checks_mode_and_index() {
        let flat = session(Scenario::default(), false);
        assert!(matches!(flat.attach_tile(0), Err(DebugError::UnsupportedFeature)));

        let tiled = session(Scenario { tiles: 2, ..Scenario::default() }, true);
        assert_eq!(tiled.tile_count(), 2);
        assert!(matches!(tiled.attach_tile(2), Err(DebugError::InvalidArgument)));

        let tile = tiled.attach_tile(1).unwrap();
        assert_eq!(tile.index(), 1);
        assert!(!tiled.are_all_tiles_detached());
        assert!(tiled.is_tile_attached(1));
        assert!(!tiled.is_tile_attached(0));
        assert!(matches!(tiled.attach_tile(1), Err(DebugError::NotAvailable)));

        drop(tile);
        assert!(tiled.are_all_tiles_detached());
        assert!(!tiled.is_tile_attached(1));
        assert!(tiled.attach_tile(1).is_ok());
    }

    #[test]
    fn tile_session_outlives_root_handle() {
        let tiled = session(Scenario { tiles: 2, ..Scenario::default() }, true);
        let tile = tiled.attach_tile(0).unwrap();
        drop(tiled);

        assert_eq!(
            tile.thread_state(DeviceThread::new(0, 0, 0, 0)),
            Ok(ThreadState::Running)
        );
        assert!(tile.register_set_properties().is_ok());
    }
}
