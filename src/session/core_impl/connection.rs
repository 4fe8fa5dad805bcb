//! Bookkeeping of the objects the kernel driver reported for the debugged
//! client.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::common::MemoryHandle;
use crate::sip::debug_area::ModuleDebugArea;
use crate::transport::{EventAck, Resource, ResourceClass};

use crate::session::events::{DebugEvent, DebugEventFlags, DebugEventKind, ModuleEvent};

/// A bound GPU address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BindInfo {
    pub va: u64,
    pub len: u64,
}

impl BindInfo {
    pub fn contains(&self, address: u64, size: u64) -> bool {
        address >= self.va && address.saturating_add(size) <= self.va.saturating_add(self.len)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ContextInfo {
    pub vm: Option<MemoryHandle>,
    pub tile: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DebugAreaState {
    Unbound,
    Valid(ModuleDebugArea),
    Invalid,
}

/// A kernel allocation bound outside of any zebin module.
#[derive(Debug)]
pub(crate) struct IsaAllocation {
    pub vm: MemoryHandle,
    pub bind: BindInfo,
    pub elf: Option<u64>,
    pub bind_count: u32,
    /// Binds held until the debugger acknowledges the module load.
    pub held_acks: Vec<EventAck>,
    pub load_acked: bool,
}

#[derive(Debug, Default)]
pub(crate) struct ModuleTile {
    pub segments: BTreeSet<u64>,
    pub loaded: bool,
    pub load_address: u64,
    pub load_acked: bool,
    pub held_acks: Vec<EventAck>,
}

/// A zebin module, loaded per tile once all of its segments are bound.
#[derive(Debug)]
pub(crate) struct Module {
    pub segment_count: u32,
    pub elf: Option<u64>,
    pub tiles: Vec<ModuleTile>,
}

/// An event to deliver, addressed to a tile (or the root when `None`).
pub(crate) type Routed = (Option<u32>, DebugEvent);

/// Side effects of processing one driver event, applied once the
/// connection lock is released.
#[derive(Debug, Default)]
pub(crate) struct Outcome {
    pub events: Vec<Routed>,
    pub acks: Vec<EventAck>,
    /// Tiles whose process entered (`true`) or exited (`false`).
    pub process: Vec<(Option<u32>, bool)>,
    /// A module debug area was bound and needs to be read.
    pub read_debug_area: bool,
    /// The debugged client closed the device.
    pub host_exit: bool,
}

#[derive(Debug)]
pub(crate) struct Connection {
    pub client: Option<u64>,
    pub client_closed: bool,
    pub contexts: HashMap<u64, ContextInfo>,
    pub lrc_to_context: HashMap<u64, u64>,
    pub vms: BTreeSet<MemoryHandle>,
    pub context_save_areas: BTreeMap<MemoryHandle, BindInfo>,
    pub sba_buffers: HashMap<MemoryHandle, BindInfo>,
    pub debug_area_bind: Option<(MemoryHandle, BindInfo)>,
    pub debug_area: DebugAreaState,
    pub resources: HashMap<u64, Resource>,
    pub isa: BTreeMap<(u32, u64), IsaAllocation>,
    pub modules: HashMap<u64, Module>,
    pub command_queues: HashMap<u64, u32>,
    /// Events the debugger must acknowledge, with the driver event each
    /// acknowledgement releases.
    pub events_to_ack: Vec<(Option<u32>, DebugEvent, EventAck)>,
    tile_count: u32,
}

impl Connection {
    pub fn new(tile_count: u32) -> Connection {
        Connection {
            client: None,
            client_closed: false,
            contexts: HashMap::new(),
            lrc_to_context: HashMap::new(),
            vms: BTreeSet::new(),
            context_save_areas: BTreeMap::new(),
            sba_buffers: HashMap::new(),
            debug_area_bind: None,
            debug_area: DebugAreaState::Unbound,
            resources: HashMap::new(),
            isa: BTreeMap::new(),
            modules: HashMap::new(),
            command_queues: HashMap::new(),
            events_to_ack: Vec::new(),
            tile_count,
        }
    }

    /// Address space of the context owning `lrc` (or `context`).
    pub fn resolve_vm(&self, context: u64, lrc: u64) -> Option<MemoryHandle> {
        let context = if self.contexts.contains_key(&context) {
            context
        } else {
            *self.lrc_to_context.get(&lrc)?
        };
        self.contexts.get(&context)?.vm
    }

    /// Tile an address space executes on. Defaults to tile 0 until an
    /// engine configuration says otherwise.
    pub fn vm_tile(&self, vm: MemoryHandle) -> u32 {
        self.contexts
            .values()
            .find(|c| c.vm == Some(vm))
            .and_then(|c| c.tile)
            .unwrap_or(0)
    }

    pub fn client_ready(&self) -> bool {
        self.client.is_some() && self.debug_area != DebugAreaState::Unbound
    }

    fn module_event(&self, elf: Option<u64>, load: u64) -> ModuleEvent {
        let (module_begin, module_end) = elf
            .and_then(|h| self.resources.get(&h))
            .and_then(|r| match r.class {
                ResourceClass::Elf { address } => {
                    Some((address, address + r.payload.len() as u64))
                }
                _ => None,
            })
            .unwrap_or((0, 0));

        ModuleEvent {
            module_begin,
            module_end,
            load,
        }
    }

    /// ELF image covering `[address, address + size)`, with the offset of
    /// `address` within it.
    pub fn elf_covering(&self, address: u64, size: u64) -> Option<(&[u8], usize)> {
        self.resources.values().find_map(|r| match r.class {
            ResourceClass::Elf { address: base } => {
                let range = BindInfo {
                    va: base,
                    len: r.payload.len() as u64,
                };
                if range.contains(address, size) {
                    Some((&r.payload[..], (address - base) as usize))
                } else {
                    None
                }
            }
            _ => None,
        })
    }

    /// Address space of the kernel allocation covering the range.
    pub fn isa_vm_covering(&self, address: u64, size: u64) -> Option<MemoryHandle> {
        self.isa
            .values()
            .find(|isa| isa.bind.contains(address, size))
            .map(|isa| isa.vm)
    }

    /// Handle a bind of a kernel allocation.
    #[allow(clippy::too_many_arguments)]
    pub fn bind_isa(
        &mut self,
        tile: u32,
        vm: MemoryHandle,
        bind: BindInfo,
        elf: Option<u64>,
        ack: Option<EventAck>,
        block_on_fence: bool,
        out: &mut Outcome,
    ) {
        let isa = self
            .isa
            .entry((tile, bind.va))
            .or_insert_with(|| IsaAllocation {
                vm,
                bind,
                elf,
                bind_count: 0,
                held_acks: Vec::new(),
                load_acked: false,
            });
        isa.bind_count += 1;

        if isa.bind_count != 1 {
            if let Some(ack) = ack {
                if block_on_fence && !isa.load_acked {
                    isa.held_acks.push(ack);
                } else {
                    out.acks.push(ack);
                }
            }
            return;
        }

        let elf = isa.elf;
        let kind = DebugEventKind::ModuleLoad(self.module_event(elf, bind.va));
        match ack {
            Some(ack) => {
                let event = DebugEvent::with_flags(kind, DebugEventFlags::NEED_ACK);
                self.events_to_ack.push((Some(tile), event, ack));
                out.events.push((Some(tile), event));
            }
            None => out.events.push((Some(tile), DebugEvent::new(kind))),
        }
    }

    /// Handle an unbind of a kernel allocation.
    pub fn unbind_isa(&mut self, tile: u32, va: u64, ack: Option<EventAck>, out: &mut Outcome) {
        out.acks.extend(ack);

        let isa = match self.isa.get_mut(&(tile, va)) {
            Some(isa) => isa,
            None => {
                log::warn!("unbind of unknown kernel allocation {:#x} on tile {}", va, tile);
                return;
            }
        };
        isa.bind_count = isa.bind_count.saturating_sub(1);
        if isa.bind_count != 0 {
            return;
        }

        if let Some(isa) = self.isa.remove(&(tile, va)) {
            out.acks.extend(isa.held_acks);
            self.events_to_ack.retain(|(t, e, _)| {
                !(*t == Some(tile)
                    && matches!(e.kind, DebugEventKind::ModuleLoad(m) if m.load == va))
            });
            let kind = DebugEventKind::ModuleUnload(self.module_event(isa.elf, va));
            out.events.push((Some(tile), DebugEvent::new(kind)));
        }
    }

    /// Handle a bind of one segment of a zebin module.
    #[allow(clippy::too_many_arguments)]
    pub fn bind_module_segment(
        &mut self,
        module: u64,
        elf: Option<u64>,
        tile: u32,
        va: u64,
        ack: Option<EventAck>,
        block_on_fence: bool,
        out: &mut Outcome,
    ) {
        let segment_count = match self.resources.get(&module).map(|r| r.class) {
            Some(ResourceClass::ZebinModule { segment_count }) => segment_count,
            _ => return,
        };
        let tile_count = self.tile_count as usize;
        let entry = self.modules.entry(module).or_insert_with(|| Module {
            segment_count,
            elf: None,
            tiles: (0..tile_count.max(1)).map(|_| ModuleTile::default()).collect(),
        });
        if entry.elf.is_none() {
            entry.elf = elf;
        }
        let state = match entry.tiles.get_mut(tile as usize) {
            Some(state) => state,
            None => return,
        };
        state.segments.insert(va);

        let completes = !state.loaded && state.segments.len() as u32 >= entry.segment_count;
        let mut load_ack = None;
        if let Some(ack) = ack {
            if block_on_fence && !state.load_acked {
                state.held_acks.push(ack);
            } else if completes {
                load_ack = Some(ack);
            } else {
                out.acks.push(ack);
            }
        }

        if !completes {
            return;
        }

        state.loaded = true;
        state.load_address = state.segments.iter().next().copied().unwrap_or(va);
        let load = state.load_address;
        let needs_ack = load_ack.is_some() || !state.held_acks.is_empty();
        let elf = entry.elf;

        let kind = DebugEventKind::ModuleLoad(self.module_event(elf, load));
        if needs_ack {
            let event = DebugEvent::with_flags(kind, DebugEventFlags::NEED_ACK);
            if let Some(ack) = load_ack {
                self.events_to_ack.push((Some(tile), event, ack));
            }
            out.events.push((Some(tile), event));
        } else {
            out.events.push((Some(tile), DebugEvent::new(kind)));
        }
    }

    /// Handle an unbind of one segment of a zebin module.
    pub fn unbind_module_segment(
        &mut self,
        module: u64,
        tile: u32,
        va: u64,
        ack: Option<EventAck>,
        out: &mut Outcome,
    ) {
        out.acks.extend(ack);

        let entry = match self.modules.get_mut(&module) {
            Some(entry) => entry,
            None => return,
        };
        let elf = entry.elf;
        let state = match entry.tiles.get_mut(tile as usize) {
            Some(state) => state,
            None => return,
        };
        state.segments.remove(&va);
        if !state.loaded || !state.segments.is_empty() {
            return;
        }

        state.loaded = false;
        state.load_acked = false;
        out.acks.append(&mut state.held_acks);
        let load = state.load_address;

        self.events_to_ack.retain(|(t, e, _)| {
            !(*t == Some(tile) && matches!(e.kind, DebugEventKind::ModuleLoad(m) if m.load == load))
        });
        let kind = DebugEventKind::ModuleUnload(self.module_event(elf, load));
        out.events.push((Some(tile), DebugEvent::new(kind)));
    }

    /// Release every bind held for the module loaded at `load` on `tile`
    /// (any tile when `None`). Returns whether such a module exists.
    pub fn ack_module_load(&mut self, tile: Option<u32>, load: u64, out: &mut Outcome) -> bool {
        let mut found = false;

        for ((isa_tile, va), isa) in self.isa.iter_mut() {
            if *va == load && tile.map_or(true, |t| t == *isa_tile) {
                found = true;
                isa.load_acked = true;
                out.acks.append(&mut isa.held_acks);
            }
        }

        for module in self.modules.values_mut() {
            for (i, state) in module.tiles.iter_mut().enumerate() {
                if state.loaded
                    && state.load_address == load
                    && tile.map_or(true, |t| t == i as u32)
                {
                    found = true;
                    state.load_acked = true;
                    out.acks.append(&mut state.held_acks);
                }
            }
        }

        found
    }

    /// Release every bind held for modules on `tile`.
    pub fn ack_tile_modules(&mut self, tile: u32, out: &mut Outcome) {
        for ((isa_tile, _), isa) in self.isa.iter_mut() {
            if *isa_tile == tile {
                out.acks.append(&mut isa.held_acks);
            }
        }
        for module in self.modules.values_mut() {
            if let Some(state) = module.tiles.get_mut(tile as usize) {
                out.acks.append(&mut state.held_acks);
            }
        }

        let mut i = 0;
        while i < self.events_to_ack.len() {
            if self.events_to_ack[i].0 == Some(tile) {
                let (_, _, ack) = self.events_to_ack.remove(i);
                out.acks.push(ack);
            } else {
                i += 1;
            }
        }
    }

    /// Module loads currently in effect on `tile`, in load address order.
    pub fn loaded_modules(&self, tile: u32) -> Vec<ModuleEvent> {
        let mut loads: Vec<ModuleEvent> = self
            .isa
            .iter()
            .filter(|((t, _), isa)| *t == tile && isa.bind_count > 0)
            .map(|((_, va), isa)| self.module_event(isa.elf, *va))
            .collect();

        for module in self.modules.values() {
            if let Some(state) = module.tiles.get(tile as usize) {
                if state.loaded {
                    loads.push(self.module_event(module.elf, state.load_address));
                }
            }
        }

        loads.sort_by_key(|m| m.load);
        loads
    }
}
