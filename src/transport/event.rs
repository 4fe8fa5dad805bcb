use bitflags::bitflags;

use crate::common::MemoryHandle;

bitflags! {
    /// Flags carried by every driver event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventFlags: u32 {
        const CREATE = 1 << 0;
        const DESTROY = 1 << 1;
        const STATE_CHANGE = 1 << 2;
        /// The driver blocks the producer until the event is acknowledged.
        const NEED_ACK = 1 << 3;
    }
}

/// Common prefix of every driver event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    pub seqno: u64,
    pub flags: EventFlags,
}

impl EventHeader {
    pub fn new(seqno: u64, flags: EventFlags) -> EventHeader {
        EventHeader { seqno, flags }
    }

    pub fn is_create(&self) -> bool {
        self.flags.contains(EventFlags::CREATE)
    }

    pub fn is_destroy(&self) -> bool {
        self.flags.contains(EventFlags::DESTROY)
    }

    pub fn needs_ack(&self) -> bool {
        self.flags.contains(EventFlags::NEED_ACK)
    }

    /// Acknowledgement token for this event.
    pub fn ack(&self) -> EventAck {
        EventAck { seqno: self.seqno }
    }
}

/// Acknowledgement of a driver event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventAck {
    pub seqno: u64,
}

/// Kind of an opaque resource registered by the runtime with the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceClass {
    /// A kernel ELF image, readable by the debugger at `address`.
    Elf { address: u64 },
    /// Kernel instruction bytes.
    Isa,
    /// A module made of `segment_count` separately bound segments.
    ZebinModule { segment_count: u32 },
    /// The per-context SIP state save area.
    ContextSaveArea,
    /// The buffer tracking state base addresses.
    SbaTrackingBuffer,
    /// The module debug area.
    ModuleDebugArea,
    /// A runtime command queue created on `tile`.
    CommandQueue { tile: u32 },
    /// Anything the engine does not track.
    Other,
}

/// A resource create or destroy notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub header: EventHeader,
    pub client: u64,
    pub handle: u64,
    pub class: ResourceClass,
    /// Resource contents. Holds the ELF image for [`ResourceClass::Elf`].
    pub payload: Vec<u8>,
}

/// A VM bind or unbind of a GPU address range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmBind {
    pub header: EventHeader,
    pub client: u64,
    pub vm: MemoryHandle,
    pub va_start: u64,
    pub va_length: u64,
    /// Handles of the resources attached to the range.
    pub resources: Vec<u64>,
}

/// Threads raised attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttentionEvent {
    pub header: EventHeader,
    pub client: u64,
    pub context: u64,
    pub lrc: u64,
    pub tile: u32,
    /// Threads with attention, packed per the device's `Arch`.
    pub bitmask: Vec<u8>,
}

/// Threads faulted on a GPU page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFaultEvent {
    pub header: EventHeader,
    pub client: u64,
    pub context: u64,
    pub lrc: u64,
    pub tile: u32,
    pub address: u64,
    /// Faulting threads, packed per the device's `Arch`.
    pub bitmask: Vec<u8>,
}

/// A typed notification from the kernel driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// A client (process) opened or closed the device.
    Client { header: EventHeader, handle: u64 },
    /// A context was created or destroyed.
    Context {
        header: EventHeader,
        client: u64,
        handle: u64,
    },
    /// A context was assigned an address space.
    ContextParam {
        header: EventHeader,
        client: u64,
        context: u64,
        vm: MemoryHandle,
    },
    /// A context's engines were configured on `tile`.
    Engines {
        header: EventHeader,
        client: u64,
        context: u64,
        tile: u32,
        lrcs: Vec<u64>,
    },
    /// An address space was created or destroyed.
    Vm {
        header: EventHeader,
        client: u64,
        handle: MemoryHandle,
    },
    Resource(Resource),
    VmBind(VmBind),
    EuAttention(AttentionEvent),
    PageFault(PageFaultEvent),
}

impl DriverEvent {
    pub fn header(&self) -> &EventHeader {
        match self {
            DriverEvent::Client { header, .. }
            | DriverEvent::Context { header, .. }
            | DriverEvent::ContextParam { header, .. }
            | DriverEvent::Engines { header, .. }
            | DriverEvent::Vm { header, .. } => header,
            DriverEvent::Resource(e) => &e.header,
            DriverEvent::VmBind(e) => &e.header,
            DriverEvent::EuAttention(e) => &e.header,
            DriverEvent::PageFault(e) => &e.header,
        }
    }
}
