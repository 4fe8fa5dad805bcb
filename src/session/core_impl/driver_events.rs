//! The driver event pipeline. Runs on the root only.

use std::sync::atomic::Ordering;

use crate::sip::debug_area::ModuleDebugArea;
use crate::transport::{DriverEvent, EventAck, Resource, ResourceClass, Transport, VmBind};
use crate::util::{decanonize, lock};

use super::connection::{BindInfo, ContextInfo, Connection, DebugAreaState, Outcome};
use super::SessionCore;
use crate::session::events::{DebugEvent, DebugEventKind, DetachReason};
use crate::session::DebugError;

impl<T: Transport> SessionCore<T> {
    /// Apply one driver event.
    pub fn handle_event(&self, event: DriverEvent) {
        let root = match self.root_state() {
            Some(root) => root,
            None => return,
        };
        log::trace!("driver event {:?}", event.header());

        let mut out = Outcome::default();
        match event {
            DriverEvent::EuAttention(event) => return self.handle_attention_event(&event),
            DriverEvent::PageFault(event) => return self.handle_page_fault(&event),
            DriverEvent::Client { header, handle } => {
                let mut connection = lock(&root.connection);
                if header.is_create() {
                    log::debug!("client {} attached", handle);
                    connection.client = Some(handle);
                    connection.client_closed = false;
                } else if header.is_destroy() && connection.client == Some(handle) {
                    log::debug!("client {} closed", handle);
                    connection.client_closed = true;
                    out.host_exit = true;
                }
                out.acks.extend(header.needs_ack().then(|| header.ack()));
            }
            DriverEvent::Context { header, handle, .. } => {
                let mut connection = lock(&root.connection);
                if header.is_create() {
                    connection.contexts.insert(handle, ContextInfo::default());
                } else if header.is_destroy() {
                    connection.contexts.remove(&handle);
                    connection.lrc_to_context.retain(|_, c| *c != handle);
                }
                out.acks.extend(header.needs_ack().then(|| header.ack()));
            }
            DriverEvent::ContextParam { header, context, vm, .. } => {
                let mut connection = lock(&root.connection);
                connection.contexts.entry(context).or_default().vm = Some(vm);
                out.acks.extend(header.needs_ack().then(|| header.ack()));
            }
            DriverEvent::Engines {
                header,
                context,
                tile,
                lrcs,
                ..
            } => {
                let mut connection = lock(&root.connection);
                if header.is_destroy() {
                    for lrc in &lrcs {
                        connection.lrc_to_context.remove(lrc);
                    }
                } else {
                    connection.contexts.entry(context).or_default().tile = Some(tile);
                    for lrc in lrcs {
                        connection.lrc_to_context.insert(lrc, context);
                    }
                }
                out.acks.extend(header.needs_ack().then(|| header.ack()));
            }
            DriverEvent::Vm { header, handle, .. } => {
                let mut connection = lock(&root.connection);
                if header.is_create() {
                    connection.vms.insert(handle);
                } else if header.is_destroy() {
                    connection.vms.remove(&handle);
                    connection.context_save_areas.remove(&handle);
                    connection.sba_buffers.remove(&handle);
                }
                out.acks.extend(header.needs_ack().then(|| header.ack()));
            }
            DriverEvent::Resource(resource) => {
                let mut connection = lock(&root.connection);
                self.handle_resource(&mut connection, resource, &mut out);
            }
            DriverEvent::VmBind(bind) => {
                let mut connection = lock(&root.connection);
                self.handle_vm_bind(&mut connection, bind, &mut out);
            }
        }

        self.apply(out);
    }

    fn handle_resource(&self, connection: &mut Connection, resource: Resource, out: &mut Outcome) {
        let header = resource.header;
        if let ResourceClass::CommandQueue { tile } = resource.class {
            let scope = self.has_tiles().then_some(tile);
            let on_scope = |c: &Connection| {
                c.command_queues
                    .values()
                    .any(|t| scope.map_or(true, |s| s == *t))
            };

            if header.is_create() {
                let first = !on_scope(connection);
                connection.command_queues.insert(resource.handle, tile);
                if first {
                    out.process.push((scope, true));
                }
            } else if header.is_destroy()
                && connection.command_queues.remove(&resource.handle).is_some()
                && !on_scope(connection)
            {
                out.process.push((scope, false));
            }
        }

        if header.is_create() {
            connection.resources.insert(resource.handle, resource);
        } else if header.is_destroy() {
            connection.resources.remove(&resource.handle);
        }
        out.acks.extend(header.needs_ack().then(|| header.ack()));
    }

    fn handle_vm_bind(&self, connection: &mut Connection, bind: VmBind, out: &mut Outcome) {
        let header = bind.header;
        let range = BindInfo {
            va: decanonize(bind.va_start),
            len: bind.va_length,
        };
        let tile = connection.vm_tile(bind.vm);
        let ack = header.needs_ack().then(|| header.ack());
        let block_on_fence = self.config.block_on_fence;

        let classes: Vec<(u64, ResourceClass)> = bind
            .resources
            .iter()
            .filter_map(|h| connection.resources.get(h).map(|r| (*h, r.class)))
            .collect();
        let elf = classes
            .iter()
            .find(|(_, c)| matches!(c, ResourceClass::Elf { .. }))
            .map(|(h, _)| *h);
        let module = classes
            .iter()
            .find(|(_, c)| matches!(c, ResourceClass::ZebinModule { .. }))
            .map(|(h, _)| *h);
        let is_isa = classes.iter().any(|(_, c)| *c == ResourceClass::Isa);

        for (_, class) in &classes {
            match class {
                ResourceClass::ContextSaveArea => {
                    if header.is_create() {
                        log::debug!("context save area of vm {:#x} at {:#x}", bind.vm, range.va);
                        connection.context_save_areas.insert(bind.vm, range);
                    } else if header.is_destroy() {
                        connection.context_save_areas.remove(&bind.vm);
                    }
                }
                ResourceClass::SbaTrackingBuffer => {
                    if header.is_create() {
                        connection.sba_buffers.insert(bind.vm, range);
                    } else if header.is_destroy() {
                        connection.sba_buffers.remove(&bind.vm);
                    }
                }
                ResourceClass::ModuleDebugArea => {
                    if header.is_create() {
                        connection.debug_area_bind = Some((bind.vm, range));
                        out.read_debug_area = true;
                    }
                }
                _ => {}
            }
        }

        match (is_isa, module) {
            (true, Some(module)) if header.is_create() => {
                connection.bind_module_segment(module, elf, tile, range.va, ack, block_on_fence, out)
            }
            (true, Some(module)) if header.is_destroy() => {
                connection.unbind_module_segment(module, tile, range.va, ack, out)
            }
            (true, None) if header.is_create() => {
                connection.bind_isa(tile, bind.vm, range, elf, ack, block_on_fence, out)
            }
            (true, None) if header.is_destroy() => connection.unbind_isa(tile, range.va, ack, out),
            _ => out.acks.extend(ack),
        }
    }

    /// Deliver the side effects of a driver event.
    fn apply(&self, out: Outcome) {
        if out.read_debug_area {
            self.read_module_debug_area();
        }

        for ack in out.acks {
            self.ack_driver_event(ack);
        }

        for (tile, entered) in out.process {
            let target = match tile {
                Some(tile) => self.core_for_tile(tile),
                None => Some(self),
            };
            if let Some(target) = target {
                target.process_entry.store(entered, Ordering::SeqCst);
                let kind = if entered {
                    DebugEventKind::ProcessEntry
                } else {
                    DebugEventKind::ProcessExit
                };
                target.events.push(DebugEvent::new(kind));
            }
        }

        for (tile, event) in out.events {
            let target = match tile {
                Some(tile) if self.has_tiles() => self.core_for_tile(tile),
                _ => Some(self),
            };
            if let Some(target) = target {
                target.events.push(event);
            }
        }

        if out.host_exit {
            let event = DebugEvent::new(DebugEventKind::Detached {
                reason: DetachReason::HostExit,
            });
            for tile in self.tiles() {
                tile.detach_with(event);
            }
            self.detach_with(event);
        }
    }

    fn ack_driver_event(&self, ack: EventAck) {
        log::trace!("acking driver event {}", ack.seqno);
        if let Err(e) = self.transport.ack_event(ack) {
            log::warn!("acking driver event {} failed: {}", ack.seqno, e);
        }
    }

    fn read_module_debug_area(&self) {
        let root = match self.root_state() {
            Some(root) => root,
            None => return,
        };
        let (vm, bind) = match lock(&root.connection).debug_area_bind {
            Some(bind) => bind,
            None => return,
        };

        let mut raw = [0; ModuleDebugArea::SIZE];
        let state = match self.transport.read_gpu_memory(vm, bind.va, &mut raw) {
            Ok(()) => match ModuleDebugArea::parse(&raw) {
                Some(area) => {
                    log::debug!("module debug area v{} (bindless scratch: {})", area.version, area.scratch_bindless);
                    DebugAreaState::Valid(area)
                }
                None => {
                    log::warn!("module debug area at {:#x} has no magic", bind.va);
                    DebugAreaState::Invalid
                }
            },
            Err(e) => {
                log::warn!("reading module debug area failed: {}", e);
                DebugAreaState::Invalid
            }
        };
        lock(&root.connection).debug_area = state;
    }

    /// Acknowledge a debugger event on behalf of `tile` (the root when
    /// `None`).
    pub(crate) fn acknowledge_event(&self, tile: Option<u32>, event: &DebugEvent) -> Result<(), DebugError> {
        let root = self.root_state().ok_or(DebugError::Uninitialized)?;
        let mut out = Outcome::default();
        {
            let mut connection = lock(&root.connection);
            let index = connection
                .events_to_ack
                .iter()
                .position(|(t, e, _)| e == event && (tile.is_none() || *t == tile));

            if let Some(index) = index {
                let (_, _, ack) = connection.events_to_ack.remove(index);
                out.acks.push(ack);
                if let DebugEventKind::ModuleLoad(module) = event.kind {
                    connection.ack_module_load(tile, module.load, &mut out);
                }
            } else if let DebugEventKind::ModuleLoad(module) = event.kind {
                if !connection.ack_module_load(tile, module.load, &mut out) {
                    return Err(DebugError::Uninitialized);
                }
            } else {
                return Err(DebugError::Uninitialized);
            }
        }

        for ack in out.acks {
            self.ack_driver_event(ack);
        }
        Ok(())
    }

    /// The connection is gone for good: detach every session.
    pub fn handle_fatal(&self) {
        log::error!("debug connection lost, detaching");
        let event = DebugEvent::new(DebugEventKind::Detached {
            reason: DetachReason::Invalid,
        });
        for tile in self.tiles() {
            tile.detach_with(event);
        }
        self.detach_with(event);
    }

    /// Whether the attach handshake has seen everything it needs.
    ///
    /// `Err(Unknown)` once the module debug area turned out invalid.
    pub fn attach_ready(&self) -> Result<bool, DebugError> {
        let root = self.root_state().ok_or(DebugError::Uninitialized)?;
        let connection = lock(&root.connection);
        if connection.debug_area == DebugAreaState::Invalid {
            return Err(DebugError::Unknown);
        }
        Ok(connection.client_ready())
    }
}
