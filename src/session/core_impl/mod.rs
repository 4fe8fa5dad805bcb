//! The shared state of a debug session and the operations on it.
//!
//! A [`SessionCore`] is either the root of a session, which owns the driver
//! connection and hardware control, or one of its tile sub-sessions. Tile
//! cores hold a weak back-reference to the root and forward hardware
//! requests to it.
//!
//! Locks are always taken in the order `threads` → `interrupts` →
//! `attention`. A tile core may take the root's connection or hardware lock
//! while holding its own `threads` lock. The connection lock is never held
//! while taking a `threads` lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use crate::arch::Arch;
use crate::common::{DeviceThread, MemoryHandle, ThreadId, Topology};
use crate::transport::Transport;
use crate::util::lock;

use super::builder::SessionConfig;
use super::events::EventQueue;
use super::registry::{ThreadRegistry, ThreadState};
use super::state_save::StateSaveArea;
use super::DebugError;

use self::connection::{BindInfo, Connection};

mod access;
mod attention;
pub(crate) mod connection;
mod driver_events;
mod generate;
mod interrupt;
mod resume;
mod tile;


/// Thread registry plus the buffer save areas are read into.
#[derive(Debug, Default)]
pub(crate) struct ThreadsState {
    pub registry: ThreadRegistry,
    pub scratch: Vec<u8>,
}

/// An interrupt request still waiting for its stop (or timeout).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingInterrupt {
    pub thread: DeviceThread,
    pub stopped: bool,
}

#[derive(Debug, Default)]
pub(crate) struct InterruptState {
    /// Requests not yet sent to the hardware.
    pub requests: Vec<DeviceThread>,
    /// Requests sent, awaiting a stop.
    pub pending: Vec<PendingInterrupt>,
}

/// A thread observed stopping since the last event generation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NewlyStopped {
    pub id: ThreadId,
    /// Reported through a pending interrupt instead of on its own.
    pub interrupted: bool,
    /// Stopped by a broadcast interrupt meant for other threads.
    pub accidental: bool,
}

#[derive(Debug, Default)]
pub(crate) struct AttentionState {
    pub expected_attention_events: u32,
    pub newly_stopped: Vec<NewlyStopped>,
    pub trigger_events: bool,
    pub interrupt_sent: bool,
    pub interrupt_time: Option<Instant>,
}

/// Hardware control bookkeeping, owned by the root.
#[derive(Debug)]
pub(crate) struct HwControl {
    /// Sequence number of the last interrupt sent to each tile.
    pub interrupt_seqno: Vec<u64>,
    /// Last tile interrupted and not resumed since.
    pub interrupted_device: Option<u32>,
    /// Tiles resumed since their last interrupt.
    pub resumed_devices: Vec<u32>,
}

impl HwControl {
    fn new(tile_count: u32) -> HwControl {
        HwControl {
            interrupt_seqno: vec![0; tile_count as usize],
            interrupted_device: None,
            resumed_devices: Vec::new(),
        }
    }
}

pub(crate) struct RootState<T: Transport> {
    /// Tile sub-sessions. Empty unless tile attach is enabled.
    pub tiles: Vec<Arc<SessionCore<T>>>,
    pub attached: Mutex<Vec<bool>>,
    pub connection: Mutex<Connection>,
    pub hw: Mutex<HwControl>,
}

pub(crate) enum TileRole<T: Transport> {
    Root(Box<RootState<T>>),
    Tile {
        index: u32,
        root: Weak<SessionCore<T>>,
    },
}

pub(crate) struct SessionCore<T: Transport> {
    transport: Arc<T>,
    config: Arc<SessionConfig>,
    topology: Arc<Topology>,
    role: TileRole<T>,
    threads: Mutex<ThreadsState>,
    interrupts: Mutex<InterruptState>,
    attention: Mutex<AttentionState>,
    state_save: StateSaveArea,
    events: EventQueue,
    process_entry: AtomicBool,
    last_fifo_poll: Mutex<Option<Instant>>,
    detached: AtomicBool,
}

impl<T: Transport> SessionCore<T> {
    fn with_registry(
        transport: Arc<T>,
        config: Arc<SessionConfig>,
        topology: Arc<Topology>,
        role: TileRole<T>,
        registry: ThreadRegistry,
    ) -> SessionCore<T> {
        SessionCore {
            transport,
            config,
            topology,
            role,
            threads: Mutex::new(ThreadsState {
                registry,
                scratch: Vec::new(),
            }),
            interrupts: Mutex::new(InterruptState::default()),
            attention: Mutex::new(AttentionState::default()),
            state_save: StateSaveArea::new(),
            events: EventQueue::new(),
            process_entry: AtomicBool::new(false),
            last_fifo_poll: Mutex::new(None),
            detached: AtomicBool::new(false),
        }
    }

    /// Create the root of a session, with one tile core per tile when
    /// tile attach is enabled.
    pub fn new_root(transport: T, config: SessionConfig) -> Arc<SessionCore<T>> {
        let transport = Arc::new(transport);
        let topology = Arc::new(transport.topology());
        let config = Arc::new(config);
        let tile_count = topology.tile_count();

        Arc::new_cyclic(|root: &Weak<SessionCore<T>>| {
            let tiles: Vec<_> = if config.tile_attach {
                (0..tile_count)
                    .map(|index| {
                        Arc::new(SessionCore::with_registry(
                            Arc::clone(&transport),
                            Arc::clone(&config),
                            Arc::clone(&topology),
                            TileRole::Tile {
                                index,
                                root: Weak::clone(root),
                            },
                            ThreadRegistry::new(topology.tile_threads(index)),
                        ))
                    })
                    .collect()
            } else {
                Vec::new()
            };

            let registry = if tiles.is_empty() {
                ThreadRegistry::new((0..tile_count).flat_map(|t| topology.tile_threads(t)))
            } else {
                ThreadRegistry::default()
            };

            let role = TileRole::Root(Box::new(RootState {
                tiles,
                attached: Mutex::new(vec![false; tile_count as usize]),
                connection: Mutex::new(Connection::new(tile_count)),
                hw: Mutex::new(HwControl::new(tile_count)),
            }));

            SessionCore::with_registry(transport, config, topology, role, registry)
        })
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    /// Tile this core is scoped to. `None` for the root.
    pub fn scope(&self) -> Option<u32> {
        match &self.role {
            TileRole::Root(_) => None,
            TileRole::Tile { index, .. } => Some(*index),
        }
    }

    pub fn root_state(&self) -> Option<&RootState<T>> {
        match &self.role {
            TileRole::Root(root) => Some(root),
            TileRole::Tile { .. } => None,
        }
    }

    /// Tile cores of a root with tile attach enabled.
    pub fn tiles(&self) -> &[Arc<SessionCore<T>>] {
        match &self.role {
            TileRole::Root(root) => &root.tiles,
            TileRole::Tile { .. } => &[],
        }
    }

    pub fn has_tiles(&self) -> bool {
        !self.tiles().is_empty()
    }

    /// Run `f` against the root core and its state.
    ///
    /// Fails with [`DebugError::Uninitialized`] if the root is gone.
    pub(crate) fn with_root<R>(
        &self,
        f: impl FnOnce(&SessionCore<T>, &RootState<T>) -> R,
    ) -> Result<R, DebugError> {
        match &self.role {
            TileRole::Root(root) => Ok(f(self, root)),
            TileRole::Tile { root, .. } => {
                let core = root.upgrade().ok_or(DebugError::Uninitialized)?;
                let state = core.root_state().ok_or(DebugError::Uninitialized)?;
                Ok(f(&core, state))
            }
        }
    }

    fn connection(&self) -> Option<MutexGuard<'_, Connection>> {
        self.root_state().map(|root| lock(&root.connection))
    }

    /// The core tracking the threads of `tile`.
    fn core_for_tile(&self, tile: u32) -> Option<&SessionCore<T>> {
        match &self.role {
            TileRole::Root(root) if root.tiles.is_empty() => {
                if tile < self.topology.tile_count() {
                    Some(self)
                } else {
                    None
                }
            }
            TileRole::Root(root) => root.tiles.get(tile as usize).map(|t| &**t),
            TileRole::Tile { .. } => None,
        }
    }

    fn threads(&self) -> MutexGuard<'_, ThreadsState> {
        lock(&self.threads)
    }

    fn interrupts(&self) -> MutexGuard<'_, InterruptState> {
        lock(&self.interrupts)
    }

    fn attention(&self) -> MutexGuard<'_, AttentionState> {
        lock(&self.attention)
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    fn check_attached(&self) -> Result<(), DebugError> {
        if self.is_detached() {
            return Err(DebugError::DeviceLost);
        }
        Ok(())
    }

    /// Debugger-facing coordinate of `id`.
    fn to_device_thread(&self, id: &ThreadId) -> DeviceThread {
        self.topology
            .to_device_thread(self.scope(), id)
            .unwrap_or_else(|| DeviceThread::new(id.slice, id.subslice, id.eu, id.thread))
    }

    /// Resolve a single-thread coordinate.
    fn resolve_single(&self, thread: &DeviceThread) -> Result<ThreadId, DebugError> {
        if !thread.is_single() {
            return Err(DebugError::InvalidArgument);
        }
        let (tile, slice) = self
            .topology
            .resolve_slice(self.scope(), thread.slice)
            .ok_or(DebugError::NotFound)?;
        let id = ThreadId::new(tile, slice, thread.subslice, thread.eu, thread.thread);
        self.threads().registry.lookup(&id)?;
        Ok(id)
    }

    /// Every tracked thread of `tile` selected by `thread`.
    fn select_threads(&self, registry: &ThreadRegistry, tile: u32, thread: &DeviceThread) -> Vec<ThreadId> {
        registry
            .iter()
            .map(|t| t.id())
            .filter(|id| id.tile == tile)
            .filter(|id| thread.contains(&self.to_device_thread(id)))
            .collect()
    }

    /// A single thread that is currently stopped.
    fn single_stopped_thread(&self, thread: &DeviceThread) -> Result<ThreadId, DebugError> {
        if !thread.is_single() {
            return Err(DebugError::NotAvailable);
        }
        let id = self.resolve_single(thread).map_err(|_| DebugError::NotAvailable)?;
        if !self.threads().registry.lookup(&id)?.is_stopped() {
            return Err(DebugError::NotAvailable);
        }
        Ok(id)
    }

    /// Run state of a single thread.
    pub fn thread_state(&self, thread: &DeviceThread) -> Result<ThreadState, DebugError> {
        let id = self.resolve_single(thread)?;
        Ok(self.threads().registry.lookup(&id)?.state())
    }

    fn client_handle(&self) -> Result<u64, DebugError> {
        self.with_root(|_, root| lock(&root.connection).client)?
            .ok_or(DebugError::Uninitialized)
    }

    fn context_save_area(&self, vm: MemoryHandle) -> Option<BindInfo> {
        self.with_root(|_, root| lock(&root.connection).context_save_areas.get(&vm).copied())
            .ok()
            .flatten()
    }

    /// Context save areas of the address spaces executing on this core's
    /// tiles.
    fn context_save_areas(&self) -> Vec<(MemoryHandle, BindInfo, u32)> {
        let scope = self.scope();
        self.with_root(|_, root| {
            let connection = lock(&root.connection);
            connection
                .context_save_areas
                .iter()
                .map(|(vm, bind)| (*vm, *bind, connection.vm_tile(*vm)))
                .filter(|(_, _, tile)| scope.map_or(true, |s| s == *tile))
                .collect()
        })
        .unwrap_or_default()
    }

    fn geometry_bitmask(&self, threads: &[ThreadId]) -> Vec<u8> {
        let mut bitmask = T::Arch::attention_bitmask(&self.topology.geometry, threads);
        T::Arch::apply_resume_wa(&mut bitmask);
        bitmask
    }

    /// Mark the session lost and wake every reader.
    pub fn detach_with(&self, event: super::events::DebugEvent) {
        self.detached.store(true, Ordering::SeqCst);
        self.events.push(event);
    }
}
