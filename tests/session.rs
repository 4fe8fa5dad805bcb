//! Drives a session end to end over an in-memory driver.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use eudebug::arch::Arch;
use eudebug::common::{DeviceThread, MemoryHandle, MemorySpaceDesc, ThreadId, Topology};
use eudebug::session::{
    DebugEventKind, DetachReason, ThreadState, FORCED_EXCEPTION, FORCED_EXTERNAL_HALT,
};
use eudebug::sip::debug_area::ModuleDebugArea;
use eudebug::sip::header::SlotLayout;
use eudebug::sip::regset::RegsetTable;
use eudebug::sip::{RegsetDesc, RegsetType, SipVersion, SrIdent, StateSaveAreaHeader};
use eudebug::transport::{
    AttentionEvent, DriverEvent, EuControl, EuControlCmd, EventAck, EventFlags, EventHeader,
    Resource, ResourceClass, Transport, TransportError, VmBind,
};
use eudebug::{DebugError, DebugSessionBuilder};
use eudebug_arch::Gen12Lp;

const CLIENT: u64 = 7;
const CONTEXT: u64 = 8;
const LRC: u64 = 9;
const VM: MemoryHandle = 10;
const CSA_VA: u64 = 0x10_0000;
const SBA_VA: u64 = 0x20_0000;
const DEBUG_AREA_VA: u64 = 0x30_0000;

fn header() -> StateSaveAreaHeader {
    let desc = |offset, num, bytes: u16| RegsetDesc {
        offset,
        num,
        bits: bytes * 8,
        bytes,
    };
    StateSaveAreaHeader {
        version: SipVersion::new(2, 1, 0),
        layout: SlotLayout {
            num_slices: 1,
            num_subslices_per_slice: 1,
            num_eus_per_subslice: 2,
            num_threads_per_eu: 4,
            state_area_offset: 0,
            state_save_size: 0x400,
            sr_magic_offset: 0x3e0,
            ..SlotLayout::default()
        },
        fifo: None,
        regsets: RegsetTable {
            grf: desc(0, 16, 32),
            cr: desc(0x240, 1, 16),
            cmd: desc(0x300, 1, 64),
            dbg: desc(0x340, 1, 8),
            ..RegsetTable::default()
        },
    }
}

#[derive(Default)]
struct State {
    regions: Vec<(u64, Vec<u8>)>,
    events: VecDeque<DriverEvent>,
    seqno: u64,
}

impl State {
    fn region(&mut self, va: u64, len: usize) -> Result<&mut [u8], TransportError> {
        self.regions
            .iter_mut()
            .find_map(|(base, bytes)| {
                let start = va.checked_sub(*base)? as usize;
                bytes.get_mut(start..start + len)
            })
            .ok_or(TransportError::InvalidArgument)
    }

    fn header(&mut self, flags: EventFlags) -> EventHeader {
        self.seqno += 1;
        EventHeader::new(self.seqno, flags)
    }
}

/// A single-tile device whose threads all run until interrupted.
struct Device {
    header: StateSaveAreaHeader,
    state: Mutex<State>,
    ready: Condvar,
}

impl Device {
    fn new() -> Device {
        let header = header();
        let mut csa = vec![0; header.area_size()];
        let raw = header.to_bytes().unwrap();
        csa[..raw.len()].copy_from_slice(&raw);
        let ident = SrIdent {
            count: 0,
            version: header.version,
        };
        for id in Topology::uniform(header.geometry(), 1).tile_threads(0) {
            let at = header.sr_ident_offset(&id);
            csa[at..at + SrIdent::SIZE].copy_from_slice(&ident.to_bytes());
        }
        let debug_area = ModuleDebugArea {
            version: 1,
            pgsize: 12,
            scratch_bindless: false,
        };

        let state = State {
            regions: vec![
                (CSA_VA, csa),
                (SBA_VA, vec![0; 0x40]),
                (DEBUG_AREA_VA, debug_area.to_bytes().to_vec()),
            ],
            ..State::default()
        };
        let device = Device {
            header,
            state: Mutex::new(state),
            ready: Condvar::new(),
        };
        device.push_attach_events();
        device
    }

    fn push(&self, make: impl FnOnce(&mut State) -> DriverEvent) {
        let mut state = self.state.lock().unwrap();
        let event = make(&mut state);
        state.events.push_back(event);
        self.ready.notify_all();
    }

    fn push_attach_events(&self) {
        let create = EventFlags::CREATE;
        self.push(|s| DriverEvent::Client {
            header: s.header(create),
            handle: CLIENT,
        });
        self.push(|s| DriverEvent::Vm {
            header: s.header(create),
            client: CLIENT,
            handle: VM,
        });
        self.push(|s| DriverEvent::Context {
            header: s.header(create),
            client: CLIENT,
            handle: CONTEXT,
        });
        self.push(|s| DriverEvent::ContextParam {
            header: s.header(EventFlags::STATE_CHANGE),
            client: CLIENT,
            context: CONTEXT,
            vm: VM,
        });
        self.push(|s| DriverEvent::Engines {
            header: s.header(create),
            client: CLIENT,
            context: CONTEXT,
            tile: 0,
            lrcs: vec![LRC],
        });

        let binds = [
            (100, ResourceClass::ContextSaveArea, CSA_VA, self.header.area_size() as u64),
            (101, ResourceClass::SbaTrackingBuffer, SBA_VA, 0x40),
            (102, ResourceClass::ModuleDebugArea, DEBUG_AREA_VA, ModuleDebugArea::SIZE as u64),
        ];
        for (handle, class, va, len) in binds {
            self.push(|s| {
                DriverEvent::Resource(Resource {
                    header: s.header(create),
                    client: CLIENT,
                    handle,
                    class,
                    payload: Vec::new(),
                })
            });
            self.push(|s| {
                DriverEvent::VmBind(VmBind {
                    header: s.header(create),
                    client: CLIENT,
                    vm: VM,
                    va_start: va,
                    va_length: len,
                    resources: vec![handle],
                })
            });
        }
    }

    fn ident_va(&self, id: &ThreadId) -> u64 {
        CSA_VA + self.header.sr_ident_offset(id) as u64
    }

    fn threads(&self) -> Vec<ThreadId> {
        Topology::uniform(self.header.geometry(), 1)
            .tile_threads(0)
            .collect()
    }
}

impl Transport for Device {
    type Arch = Gen12Lp;

    fn topology(&self) -> Topology {
        Topology::uniform(self.header.geometry(), 1)
    }

    fn read_gpu_memory(&self, vm: MemoryHandle, gpu_va: u64, buf: &mut [u8]) -> Result<(), TransportError> {
        if vm != VM {
            return Err(TransportError::NotFound);
        }
        let mut state = self.state.lock().unwrap();
        buf.copy_from_slice(state.region(gpu_va, buf.len())?);
        Ok(())
    }

    fn write_gpu_memory(&self, vm: MemoryHandle, gpu_va: u64, buf: &[u8]) -> Result<(), TransportError> {
        if vm != VM {
            return Err(TransportError::NotFound);
        }
        let mut state = self.state.lock().unwrap();
        state.region(gpu_va, buf.len())?.copy_from_slice(buf);
        Ok(())
    }

    fn eu_control(&self, request: EuControl, bitmask: &mut [u8]) -> Result<u64, TransportError> {
        let geometry = self.header.geometry();
        let mut state = self.state.lock().unwrap();
        state.seqno += 1;
        let seqno = state.seqno;

        match request.cmd {
            EuControlCmd::InterruptAll => {
                let threads = self.threads();
                for id in &threads {
                    let ident = state.region(self.ident_va(id), SrIdent::SIZE)?;
                    let mut sr = SrIdent::parse(ident).ok_or(TransportError::InvalidArgument)?;
                    sr.count = sr.count.wrapping_add(1);
                    ident.copy_from_slice(&sr.to_bytes());

                    let slot = CSA_VA + self.header.thread_slot_offset(id) as u64;
                    let cr0 = slot + self.header.regsets.cr.offset as u64;
                    let bits = FORCED_EXCEPTION | FORCED_EXTERNAL_HALT;
                    state.region(cr0 + 4, 4)?.copy_from_slice(&bits.to_le_bytes());
                }
                let header = state.header(EventFlags::STATE_CHANGE);
                state.events.push_back(DriverEvent::EuAttention(AttentionEvent {
                    header,
                    client: CLIENT,
                    context: CONTEXT,
                    lrc: LRC,
                    tile: 0,
                    bitmask: Gen12Lp::attention_bitmask(&geometry, &threads),
                }));
                self.ready.notify_all();
            }
            EuControlCmd::Resume => {
                for id in Gen12Lp::threads_from_attention_bitmask(&geometry, 0, bitmask) {
                    let ident = state.region(self.ident_va(&id), SrIdent::SIZE)?;
                    let mut sr = SrIdent::parse(ident).ok_or(TransportError::InvalidArgument)?;
                    if sr.in_system_routine() {
                        sr.count = sr.count.wrapping_add(1);
                        ident.copy_from_slice(&sr.to_bytes());
                    }
                }
            }
            EuControlCmd::Stopped => return Err(TransportError::Unsupported),
        }
        Ok(seqno)
    }

    fn read_event(&self, timeout: Duration) -> Result<Option<DriverEvent>, TransportError> {
        let guard = self.state.lock().unwrap();
        let (mut state, _) = self
            .ready
            .wait_timeout_while(guard, timeout, |s| s.events.is_empty())
            .unwrap();
        Ok(state.events.pop_front())
    }

    fn ack_event(&self, _ack: EventAck) -> Result<(), TransportError> {
        Ok(())
    }
}

#[test]
fn interrupt_inspect_resume_detach() {
    let _ = pretty_env_logger::try_init();

    let device = Arc::new(Device::new());
    let session = DebugSessionBuilder::new(Arc::clone(&device))
        .interrupt_timeout(Duration::from_secs(5))
        .event_poll_timeout(Duration::from_millis(5))
        .sip_retry_backoff(Duration::from_micros(10))
        .build()
        .unwrap();
    assert_eq!(session.tile_count(), 1);

    let thread = DeviceThread::new(0, 0, 1, 3);
    assert_eq!(session.thread_state(thread), Ok(ThreadState::Running));

    session.interrupt(DeviceThread::ALL).unwrap();
    let event = session.read_event(Duration::from_secs(10)).unwrap();
    assert_eq!(event.kind, DebugEventKind::ThreadStopped(DeviceThread::ALL));
    assert_eq!(session.thread_state(thread), Ok(ThreadState::Stopped));

    session
        .write_registers(thread, RegsetType::Grf, 4, 1, &[0x42; 32])
        .unwrap();
    let mut grf = [0; 32];
    session
        .read_registers(thread, RegsetType::Grf, 4, 1, &mut grf)
        .unwrap();
    assert_eq!(grf, [0x42; 32]);

    let props = session.register_set_properties().unwrap();
    assert!(props.iter().any(|p| p.ty == RegsetType::Cr && p.count == 1));

    let mut sba = [0; 8];
    session
        .read_memory(DeviceThread::ALL, &MemorySpaceDesc::default_space(SBA_VA), &mut sba)
        .unwrap();

    session.resume(DeviceThread::ALL).unwrap();
    assert_eq!(session.thread_state(thread), Ok(ThreadState::Running));
    assert_eq!(
        session.read_registers(thread, RegsetType::Grf, 4, 1, &mut grf),
        Err(DebugError::NotAvailable)
    );

    device.push(|s| DriverEvent::Client {
        header: s.header(EventFlags::DESTROY),
        handle: CLIENT,
    });
    let event = session.read_event(Duration::from_secs(10)).unwrap();
    assert_eq!(
        event.kind,
        DebugEventKind::Detached {
            reason: DetachReason::HostExit
        }
    );
    assert_eq!(
        session.read_event(Duration::from_millis(1)),
        Err(DebugError::DeviceLost)
    );
}
