//! An in-memory transport with a minimal SIP firmware simulation.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::marker::PhantomData;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::arch::Arch;
use crate::common::{Geometry, MemoryHandle, ThreadId, Topology};
use crate::session::{FORCED_EXCEPTION, FORCED_EXTERNAL_HALT};
use crate::sip::command::{SipCommand, SipCommandKind, SLM_SEND_BYTES};
use crate::sip::debug_area::ModuleDebugArea;
use crate::sip::fifo::{FifoControl, FifoNode};
use crate::sip::header::tests::sample_header;
use crate::sip::header::FifoDesc;
use crate::sip::{SrIdent, StateSaveAreaHeader};
use crate::transport::{
    AttentionEvent, DriverEvent, EuControl, EuControlCmd, EventAck, EventFlags, EventHeader,
    PageFaultEvent, Resource, ResourceClass, Transport, TransportError, VmBind,
};
use crate::util::lock;

pub(crate) enum TestArch {}
impl Arch for TestArch {}

pub(crate) enum TestArchWa {}
impl Arch for TestArchWa {
    const RESUME_WA_REQUIRED: bool = true;
}

pub(crate) const CLIENT: u64 = 1;
pub(crate) const CSA_RESOURCE: u64 = 0x500;
pub(crate) const SBA_RESOURCE: u64 = 0x501;
pub(crate) const DEBUG_AREA_RESOURCE: u64 = 0x502;
pub(crate) const DEBUG_AREA_VA: u64 = 0x9000;
pub(crate) const SBA_VA: u64 = 0x8000;
pub(crate) const FIFO_CAPACITY: u32 = 8;
pub(crate) const SLM_SIZE: usize = 0x400;
pub(crate) const START_IP: u32 = 0x100;

pub(crate) fn context(tile: u32) -> u64 {
    0x10 + tile as u64
}

pub(crate) fn lrc(tile: u32) -> u64 {
    0x20 + tile as u64
}

pub(crate) fn vm(tile: u32) -> MemoryHandle {
    0x100 + tile as u64
}

pub(crate) fn csa_va(tile: u32) -> u64 {
    0x10_0000 * (tile as u64 + 1)
}

pub(crate) fn queue(tile: u32) -> u64 {
    0x600 + tile as u64
}

/// Shape of the simulated device.
#[derive(Debug, Clone)]
pub(crate) struct Scenario {
    pub tiles: u32,
    pub sip_major: u8,
}

impl Default for Scenario {
    fn default() -> Scenario {
        Scenario {
            tiles: 1,
            sip_major: 2,
        }
    }
}

#[derive(Debug)]
struct Region {
    base: u64,
    bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct FakeState {
    memory: HashMap<MemoryHandle, Vec<Region>>,
    events: VecDeque<DriverEvent>,
    disconnected: bool,
    seqno: u64,
    controls: Vec<(EuControl, Vec<ThreadId>)>,
    acks: Vec<EventAck>,
    slm: Vec<u8>,
    sip_stuck: bool,
    /// Number of upcoming reads of a whole context save area that fail.
    failing_area_reads: u32,
    /// Threads executing when an interrupt arrives, with their start IP.
    live: BTreeMap<ThreadId, u32>,
}

impl FakeState {
    fn next_seqno(&mut self) -> u64 {
        self.seqno += 1;
        self.seqno
    }

    fn region(&mut self, vm: MemoryHandle, va: u64, len: usize) -> Option<&mut [u8]> {
        self.memory.get_mut(&vm)?.iter_mut().find_map(|r| {
            let start = va.checked_sub(r.base)? as usize;
            r.bytes.get_mut(start..start + len)
        })
    }

    fn read(&mut self, vm: MemoryHandle, va: u64, buf: &mut [u8]) -> Result<(), TransportError> {
        let src = self.region(vm, va, buf.len()).ok_or(TransportError::InvalidArgument)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write(&mut self, vm: MemoryHandle, va: u64, buf: &[u8]) -> Result<(), TransportError> {
        let dst = self.region(vm, va, buf.len()).ok_or(TransportError::InvalidArgument)?;
        dst.copy_from_slice(buf);
        Ok(())
    }
}

/// A [`Transport`] backed by plain memory.
///
/// Each tile runs one context with its own address space and context save
/// area. Interrupts park every live thread of the tile in SIP and queue an
/// attention event for them. Resumes move parked threads out of SIP after
/// servicing any command left in their `cmd` window.
pub(crate) struct FakeTransport<A: Arch = TestArch> {
    scenario: Scenario,
    header: StateSaveAreaHeader,
    state: Mutex<FakeState>,
    event_ready: Condvar,
    _arch: PhantomData<fn() -> A>,
}

impl FakeTransport<TestArch> {
    pub fn new(scenario: Scenario) -> FakeTransport<TestArch> {
        FakeTransport::with_arch(scenario)
    }
}

impl<A: Arch> FakeTransport<A> {
    pub fn with_arch(scenario: Scenario) -> FakeTransport<A> {
        let mut header = sample_header(scenario.sip_major);
        if header.fifo.is_some() {
            header.fifo = Some(FifoDesc {
                offset: crate::util::align_up(header.area_size() as u32, 16),
                size: FifoControl::SIZE as u32 + FIFO_CAPACITY * FifoNode::SIZE as u32,
                head: 0,
                tail: 0,
            });
        }

        let transport = FakeTransport {
            scenario,
            header,
            state: Mutex::new(FakeState {
                slm: vec![0; SLM_SIZE],
                ..FakeState::default()
            }),
            event_ready: Condvar::new(),
            _arch: PhantomData,
        };
        for tile in 0..transport.scenario.tiles {
            transport.map_tile(tile);
        }
        transport
    }

    fn map_tile(&self, tile: u32) {
        let header_bytes = self.header.to_bytes().unwrap();
        let mut csa = vec![0; self.csa_len()];
        csa[..header_bytes.len()].copy_from_slice(&header_bytes);

        let ident = SrIdent {
            count: 0,
            version: self.header.version,
        };
        for id in self.topology().tile_threads(tile) {
            let at = self.header.sr_ident_offset(&id);
            csa[at..at + SrIdent::SIZE].copy_from_slice(&ident.to_bytes());
            if let Some(cmd) = self.header.command_window() {
                let at = self.header.thread_slot_offset(&id) + cmd.offset as usize;
                let ready = SipCommand::new(SipCommandKind::Ready, 0, 0).encode(cmd.bytes as usize);
                csa[at..at + ready.len()].copy_from_slice(&ready);
            }
        }
        if let Some(fifo) = self.header.fifo {
            let at = fifo.offset as usize;
            csa[at + 8..at + 12].copy_from_slice(&FIFO_CAPACITY.to_le_bytes());
        }

        self.map(vm(tile), csa_va(tile), csa);
        self.map(vm(tile), SBA_VA, vec![0; 0x100]);
        if tile == 0 {
            let area = ModuleDebugArea {
                version: 1,
                pgsize: 12,
                scratch_bindless: false,
            };
            self.map(vm(0), DEBUG_AREA_VA, area.to_bytes().to_vec());
        }
    }

    pub fn header(&self) -> &StateSaveAreaHeader {
        &self.header
    }

    pub fn csa_len(&self) -> usize {
        match self.header.fifo {
            Some(fifo) => (fifo.offset + fifo.size) as usize,
            None => self.header.area_size(),
        }
    }

    /// Map `bytes` at `base` in address space `vm`.
    pub fn map(&self, vm: MemoryHandle, base: u64, bytes: Vec<u8>) {
        lock(&self.state)
            .memory
            .entry(vm)
            .or_default()
            .push(Region { base, bytes });
    }

    pub fn peek(&self, vm: MemoryHandle, va: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        lock(&self.state).read(vm, va, &mut buf).unwrap();
        buf
    }

    pub fn poke(&self, vm: MemoryHandle, va: u64, bytes: &[u8]) {
        lock(&self.state).write(vm, va, bytes).unwrap();
    }

    pub fn next_seqno(&self) -> u64 {
        lock(&self.state).next_seqno()
    }

    pub fn push_event(&self, event: DriverEvent) {
        lock(&self.state).events.push_back(event);
        self.event_ready.notify_all();
    }

    pub fn header_of(&self, flags: EventFlags) -> EventHeader {
        EventHeader::new(self.next_seqno(), flags)
    }

    pub fn resource(&self, handle: u64, class: ResourceClass, payload: Vec<u8>) -> DriverEvent {
        DriverEvent::Resource(Resource {
            header: self.header_of(EventFlags::CREATE),
            client: CLIENT,
            handle,
            class,
            payload,
        })
    }

    pub fn bind(
        &self,
        flags: EventFlags,
        vm: MemoryHandle,
        va: u64,
        len: u64,
        resources: Vec<u64>,
    ) -> DriverEvent {
        DriverEvent::VmBind(VmBind {
            header: self.header_of(flags),
            client: CLIENT,
            vm,
            va_start: va,
            va_length: len,
            resources,
        })
    }

    /// Queue what the driver reports for a client that already created one
    /// context per tile. The module debug area binds last.
    pub fn push_attach_events(&self) {
        let create = EventFlags::CREATE;
        self.push_event(DriverEvent::Client {
            header: self.header_of(create),
            handle: CLIENT,
        });
        for tile in 0..self.scenario.tiles {
            self.push_event(DriverEvent::Vm {
                header: self.header_of(create),
                client: CLIENT,
                handle: vm(tile),
            });
            self.push_event(DriverEvent::Context {
                header: self.header_of(create),
                client: CLIENT,
                handle: context(tile),
            });
            self.push_event(DriverEvent::ContextParam {
                header: self.header_of(EventFlags::STATE_CHANGE),
                client: CLIENT,
                context: context(tile),
                vm: vm(tile),
            });
            self.push_event(DriverEvent::Engines {
                header: self.header_of(create),
                client: CLIENT,
                context: context(tile),
                tile,
                lrcs: vec![lrc(tile)],
            });
        }

        self.push_event(self.resource(CSA_RESOURCE, ResourceClass::ContextSaveArea, Vec::new()));
        self.push_event(self.resource(SBA_RESOURCE, ResourceClass::SbaTrackingBuffer, Vec::new()));
        self.push_event(self.resource(DEBUG_AREA_RESOURCE, ResourceClass::ModuleDebugArea, Vec::new()));
        for tile in 0..self.scenario.tiles {
            let csa_len = self.csa_len() as u64;
            self.push_event(self.bind(create, vm(tile), csa_va(tile), csa_len, vec![CSA_RESOURCE]));
            self.push_event(self.bind(create, vm(tile), SBA_VA, 0x100, vec![SBA_RESOURCE]));
        }
        self.push_event(self.bind(
            create,
            vm(0),
            DEBUG_AREA_VA,
            ModuleDebugArea::SIZE as u64,
            vec![DEBUG_AREA_RESOURCE],
        ));
    }

    /// Queue the creation of a command queue on `tile`.
    pub fn push_command_queue(&self, tile: u32) {
        self.push_event(self.resource(queue(tile), ResourceClass::CommandQueue { tile }, Vec::new()));
    }

    pub fn corrupt_debug_area(&self) {
        self.poke(vm(0), DEBUG_AREA_VA, b"garbage!");
    }

    pub fn disconnect(&self) {
        lock(&self.state).disconnected = true;
        self.event_ready.notify_all();
    }

    pub fn set_sip_stuck(&self, stuck: bool) {
        lock(&self.state).sip_stuck = stuck;
    }

    /// Fail the next `count` reads that cover a full context save area.
    pub fn fail_area_reads(&self, count: u32) {
        lock(&self.state).failing_area_reads = count;
    }

    /// Threads that get parked by the next interrupt of their tile.
    pub fn set_live(&self, threads: &[ThreadId]) {
        let mut state = lock(&self.state);
        state.live = threads.iter().map(|id| (*id, START_IP)).collect();
    }

    pub fn acks(&self) -> Vec<u64> {
        lock(&self.state).acks.iter().map(|a| a.seqno).collect()
    }

    /// Every thread control request, with the threads of its bitmask.
    pub fn controls(&self) -> Vec<(EuControlCmd, u32, Vec<ThreadId>)> {
        lock(&self.state)
            .controls
            .iter()
            .map(|(c, threads)| (c.cmd, c.tile, threads.clone()))
            .collect()
    }

    pub fn slm(&self) -> Vec<u8> {
        lock(&self.state).slm.clone()
    }

    pub fn set_slm(&self, bytes: &[u8]) {
        lock(&self.state).slm[..bytes.len()].copy_from_slice(bytes);
    }

    pub fn sr_count(&self, id: &ThreadId) -> u8 {
        let raw = self.peek(vm(id.tile), csa_va(id.tile) + self.header.sr_ident_offset(id) as u64, SrIdent::SIZE);
        SrIdent::parse(&raw).map_or(0, |ident| ident.count)
    }

    /// Write a register of `id`'s save slot.
    pub fn poke_register(&self, id: &ThreadId, offset_in_slot: usize, bytes: &[u8]) {
        let va = csa_va(id.tile) + (self.header.thread_slot_offset(id) + offset_in_slot) as u64;
        self.poke(vm(id.tile), va, bytes);
    }

    pub fn peek_register(&self, id: &ThreadId, offset_in_slot: usize, len: usize) -> Vec<u8> {
        let va = csa_va(id.tile) + (self.header.thread_slot_offset(id) + offset_in_slot) as u64;
        self.peek(vm(id.tile), va, len)
    }

    /// Park `id` in SIP with the given `cr0` exception bits, instruction
    /// pointer and start IP.
    pub fn park(&self, id: &ThreadId, exception_bits: u32, ip: u32, start_ip: u32) {
        let mut state = lock(&self.state);
        self.park_locked(&mut state, id, exception_bits, ip, start_ip);
    }

    fn park_locked(&self, state: &mut FakeState, id: &ThreadId, exception_bits: u32, ip: u32, start_ip: u32) {
        let base = csa_va(id.tile) + self.header.thread_slot_offset(id) as u64;
        let vm = vm(id.tile);

        let ident_va = csa_va(id.tile) + self.header.sr_ident_offset(id) as u64;
        let mut raw = [0; SrIdent::SIZE];
        let _ = state.read(vm, ident_va, &mut raw);
        if let Some(mut ident) = SrIdent::parse(&raw) {
            if !ident.in_system_routine() {
                ident.count = ident.count.wrapping_add(1);
            }
            let _ = state.write(vm, ident_va, &ident.to_bytes());
        }

        let cr0 = base + self.header.regsets.cr.offset as u64;
        let _ = state.write(vm, cr0 + 4, &exception_bits.to_le_bytes());
        let _ = state.write(vm, cr0 + 8, &ip.to_le_bytes());
        let dbg0 = base + self.header.regsets.dbg.offset as u64;
        let _ = state.write(vm, dbg0, &start_ip.to_le_bytes());
    }

    /// An attention event for `threads`, all on `tile`.
    pub fn attention(&self, tile: u32, threads: &[ThreadId]) -> DriverEvent {
        DriverEvent::EuAttention(AttentionEvent {
            header: self.header_of(EventFlags::STATE_CHANGE),
            client: CLIENT,
            context: context(tile),
            lrc: lrc(tile),
            tile,
            bitmask: A::attention_bitmask(&self.header.geometry(), threads),
        })
    }

    pub fn page_fault(&self, tile: u32, address: u64, threads: &[ThreadId]) -> DriverEvent {
        DriverEvent::PageFault(PageFaultEvent {
            header: self.header_of(EventFlags::STATE_CHANGE),
            client: CLIENT,
            context: context(tile),
            lrc: lrc(tile),
            tile,
            address,
            bitmask: A::attention_bitmask(&self.header.geometry(), threads),
        })
    }

    /// Publish FIFO nodes for `nodes` on `tile`, advancing `head`.
    pub fn fifo_push(&self, tile: u32, nodes: &[FifoNode]) {
        let fifo = self.header.fifo.unwrap();
        let base = csa_va(tile) + fifo.offset as u64;
        let control = FifoControl::parse(&self.peek(vm(tile), base, FifoControl::SIZE)).unwrap();

        let mut head = control.head;
        for node in nodes {
            let at = base + FifoControl::SIZE as u64 + head as u64 * FifoNode::SIZE as u64;
            self.poke(vm(tile), at, &node.to_bytes());
            head = (head + 1) % control.capacity;
        }
        self.poke(vm(tile), base, &head.to_le_bytes());
    }

    pub fn fifo_control(&self, tile: u32) -> FifoControl {
        let fifo = self.header.fifo.unwrap();
        let base = csa_va(tile) + fifo.offset as u64;
        FifoControl::parse(&self.peek(vm(tile), base, FifoControl::SIZE)).unwrap()
    }

    /// Execute the command in `id`'s window, if any. Returns whether the
    /// thread re-enters SIP afterwards.
    fn service_command(&self, state: &mut FakeState, id: &ThreadId) -> bool {
        let desc = match self.header.command_window() {
            Some(desc) => *desc,
            None => return false,
        };
        let va = csa_va(id.tile) + (self.header.thread_slot_offset(id) + desc.offset as usize) as u64;
        let mut raw = vec![0; desc.bytes as usize];
        if state.read(vm(id.tile), va, &mut raw).is_err() {
            return false;
        }
        let cmd = match SipCommand::decode(&raw) {
            Ok(cmd) => cmd,
            Err(_) => return false,
        };

        let mut reply = SipCommand::new(SipCommandKind::Ready, 0, 0);
        let len = cmd.size as usize * SLM_SEND_BYTES;
        let offset = cmd.offset as usize;
        let reenter = match cmd.kind() {
            Some(SipCommandKind::SlmRead) => {
                reply.buffer = state.slm[offset..offset + len].to_vec();
                true
            }
            Some(SipCommandKind::SlmWrite) => {
                state.slm[offset..offset + len].copy_from_slice(&cmd.buffer[..len]);
                true
            }
            _ => false,
        };
        if !state.sip_stuck {
            let _ = state.write(vm(id.tile), va, &reply.encode(desc.bytes as usize));
        }
        reenter
    }
}

impl<A: Arch> Transport for FakeTransport<A> {
    type Arch = A;

    fn topology(&self) -> Topology {
        Topology::uniform(self.header.geometry(), self.scenario.tiles)
    }

    fn read_gpu_memory(&self, vm: MemoryHandle, gpu_va: u64, buf: &mut [u8]) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.failing_area_reads > 0 && buf.len() >= self.csa_len() {
            state.failing_area_reads -= 1;
            return Err(TransportError::Busy);
        }
        state.read(vm, gpu_va, buf)
    }

    fn write_gpu_memory(&self, vm: MemoryHandle, gpu_va: u64, buf: &[u8]) -> Result<(), TransportError> {
        lock(&self.state).write(vm, gpu_va, buf)
    }

    fn eu_control(&self, request: EuControl, bitmask: &mut [u8]) -> Result<u64, TransportError> {
        let geometry: Geometry = self.header.geometry();
        let mut state = lock(&self.state);
        let seqno = state.next_seqno();

        match request.cmd {
            EuControlCmd::InterruptAll => {
                let parked: Vec<(ThreadId, u32)> = state
                    .live
                    .iter()
                    .filter(|(id, _)| id.tile == request.tile)
                    .map(|(id, ip)| (*id, *ip))
                    .collect();
                for (id, start_ip) in &parked {
                    self.park_locked(
                        &mut state,
                        id,
                        FORCED_EXCEPTION | FORCED_EXTERNAL_HALT,
                        *start_ip,
                        *start_ip,
                    );
                    state.live.remove(id);
                }
                state.controls.push((request, Vec::new()));

                if !parked.is_empty() {
                    let ids: Vec<_> = parked.iter().map(|(id, _)| *id).collect();
                    let event = DriverEvent::EuAttention(AttentionEvent {
                        header: EventHeader::new(state.next_seqno(), EventFlags::STATE_CHANGE),
                        client: CLIENT,
                        context: context(request.tile),
                        lrc: lrc(request.tile),
                        tile: request.tile,
                        bitmask: A::attention_bitmask(&geometry, &ids),
                    });
                    state.events.push_back(event);
                    self.event_ready.notify_all();
                }
            }
            EuControlCmd::Resume => {
                let threads = A::threads_from_attention_bitmask(&geometry, request.tile, bitmask);
                for id in &threads {
                    let ident_va = csa_va(id.tile) + self.header.sr_ident_offset(id) as u64;
                    let mut raw = [0; SrIdent::SIZE];
                    if state.read(vm(id.tile), ident_va, &mut raw).is_err() {
                        continue;
                    }
                    let mut ident = match SrIdent::parse(&raw) {
                        Some(ident) if ident.in_system_routine() => ident,
                        _ => continue,
                    };
                    let reenter = self.service_command(&mut state, id);
                    ident.count = ident.count.wrapping_add(if reenter { 2 } else { 1 });
                    let _ = state.write(vm(id.tile), ident_va, &ident.to_bytes());
                }
                state.controls.push((request, threads));
            }
            EuControlCmd::Stopped => {
                let ids: Vec<ThreadId> = self
                    .topology()
                    .tile_threads(request.tile)
                    .filter(|id| {
                        let ident_va = csa_va(id.tile) + self.header.sr_ident_offset(id) as u64;
                        let mut raw = [0; SrIdent::SIZE];
                        state.read(vm(id.tile), ident_va, &mut raw).is_ok()
                            && SrIdent::parse(&raw).map_or(false, |i| i.in_system_routine())
                    })
                    .collect();
                let filled = A::attention_bitmask(&geometry, &ids);
                let n = filled.len().min(bitmask.len());
                bitmask[..n].copy_from_slice(&filled[..n]);
                state.controls.push((request, ids));
            }
        }
        Ok(seqno)
    }

    fn read_event(&self, timeout: Duration) -> Result<Option<DriverEvent>, TransportError> {
        let guard = lock(&self.state);
        let (mut state, _) = self
            .event_ready
            .wait_timeout_while(guard, timeout, |s| s.events.is_empty() && !s.disconnected)
            .unwrap_or_else(PoisonError::into_inner);
        match state.events.pop_front() {
            Some(event) => Ok(Some(event)),
            None if state.disconnected => Err(TransportError::Disconnected),
            None => Ok(None),
        }
    }

    fn ack_event(&self, ack: EventAck) -> Result<(), TransportError> {
        lock(&self.state).acks.push(ack);
        Ok(())
    }
}
