//! Tile sub-sessions.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::common::DeviceThread;
use crate::transport::Transport;
use crate::util::lock;

use super::connection::Outcome;
use super::SessionCore;
use crate::session::events::{DebugEvent, DebugEventFlags, DebugEventKind, DetachReason};
use crate::session::DebugError;

impl<T: Transport> SessionCore<T> {
    /// Attach to tile `index`. Returns its core, or `None` if the tile is
    /// unknown or already attached.
    pub fn attach_tile(&self, index: u32) -> Option<Arc<SessionCore<T>>> {
        let root = self.root_state()?;
        let tile = root.tiles.get(index as usize)?;

        {
            let mut attached = lock(&root.attached);
            let slot = attached.get_mut(index as usize)?;
            if *slot {
                return None;
            }
            *slot = true;
        }

        tile.events.clear();
        let entered = tile.process_entry.load(Ordering::SeqCst);
        if self.is_detached() && !entered {
            tile.events.push(DebugEvent::new(DebugEventKind::Detached {
                reason: DetachReason::Invalid,
            }));
            return Some(Arc::clone(tile));
        }

        if entered {
            tile.events.push(DebugEvent::new(DebugEventKind::ProcessEntry));
            let (loaded, held) = {
                let connection = lock(&root.connection);
                let held: Vec<_> = connection
                    .events_to_ack
                    .iter()
                    .filter(|(t, _, _)| *t == Some(index))
                    .map(|(_, e, _)| *e)
                    .collect();
                (connection.loaded_modules(index), held)
            };
            for module in loaded {
                let kind = DebugEventKind::ModuleLoad(module);
                let needs_ack = held.iter().any(|e| e.kind == kind);
                let flags = if needs_ack {
                    DebugEventFlags::NEED_ACK
                } else {
                    DebugEventFlags::empty()
                };
                tile.events.push(DebugEvent::with_flags(kind, flags));
            }
        }

        log::debug!("tile {} attached", index);
        Some(Arc::clone(tile))
    }

    /// Detach from tile `index`, releasing its held module binds.
    pub fn detach_tile(&self, index: u32) {
        let root = match self.root_state() {
            Some(root) => root,
            None => return,
        };

        let mut out = Outcome::default();
        lock(&root.connection).ack_tile_modules(index, &mut out);
        for ack in out.acks {
            if let Err(e) = self.transport.ack_event(ack) {
                log::warn!("acking driver event {} failed: {}", ack.seqno, e);
            }
        }

        if let Some(slot) = lock(&root.attached).get_mut(index as usize) {
            *slot = false;
        }
        if let Some(tile) = root.tiles.get(index as usize) {
            tile.events.wake();
        }
        log::debug!("tile {} detached", index);
    }

    pub fn is_tile_attached(&self, index: u32) -> bool {
        self.root_state()
            .and_then(|root| lock(&root.attached).get(index as usize).copied())
            .unwrap_or(false)
    }

    pub fn are_all_tiles_detached(&self) -> bool {
        self.root_state()
            .map_or(true, |root| lock(&root.attached).iter().all(|a| !a))
    }

    /// Run `f` on every core owning threads selected by `thread`, with the
    /// coordinate translated to that core's scope.
    ///
    /// Succeeds if any core succeeded, otherwise returns the first error.
    /// Without tile sessions this is `f(self, thread)`.
    pub fn fan_out<R>(
        &self,
        thread: DeviceThread,
        mut f: impl FnMut(&SessionCore<T>, DeviceThread) -> Result<R, DebugError>,
    ) -> Result<R, DebugError> {
        if !self.has_tiles() {
            return f(self, thread);
        }

        let mut result = None;
        let mut first_err = None;
        for tile in self.topology.tiles_for(None, &thread) {
            let core = match self.core_for_tile(tile) {
                Some(core) => core,
                None => continue,
            };
            let local = if thread.slice == DeviceThread::ALL_INDICES {
                thread
            } else {
                let slice = self
                    .topology
                    .resolve_slice(None, thread.slice)
                    .and_then(|(tile, slice)| self.topology.api_slice(Some(tile), tile, slice))
                    .ok_or(DebugError::InvalidArgument)?;
                DeviceThread { slice, ..thread }
            };

            match f(core, local) {
                Ok(r) => {
                    result.get_or_insert(r);
                }
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }

        match (result, first_err) {
            (Some(r), _) => Ok(r),
            (None, Some(e)) => Err(e),
            (None, None) => Err(DebugError::InvalidArgument),
        }
    }
}
