//! Register-set descriptors.

use bitflags::bitflags;
use scroll::{Pread, Pwrite};

/// Location of one register set within a thread's save slot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pread, Pwrite)]
pub struct RegsetDesc {
    /// Byte offset of the first element within the slot.
    pub offset: u32,
    /// Number of elements.
    pub num: u16,
    /// Width of an element, in bits.
    pub bits: u16,
    /// Width of an element, in bytes.
    pub bytes: u16,
}

impl RegsetDesc {
    pub const SIZE: usize = 10;
}

/// Descriptor table of every register set stored in the save area, in
/// firmware order.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pread, Pwrite)]
pub struct RegsetTable {
    pub grf: RegsetDesc,
    pub addr: RegsetDesc,
    pub flag: RegsetDesc,
    pub emask: RegsetDesc,
    pub sr: RegsetDesc,
    pub cr: RegsetDesc,
    pub notification: RegsetDesc,
    pub tdr: RegsetDesc,
    pub acc: RegsetDesc,
    pub mme: RegsetDesc,
    pub ctrl: RegsetDesc,
    pub sp: RegsetDesc,
    /// SIP command window. Empty before version 2.
    pub cmd: RegsetDesc,
    pub dbg: RegsetDesc,
    pub fc: RegsetDesc,
}

impl RegsetTable {
    pub const SIZE: usize = 15 * RegsetDesc::SIZE;

    /// Descriptor of an API register set. `None` for sets not stored in the
    /// save area.
    pub fn get(&self, ty: RegsetType) -> Option<&RegsetDesc> {
        use self::RegsetType::*;
        let desc = match ty {
            Grf => &self.grf,
            Addr => &self.addr,
            Flag => &self.flag,
            Ce => &self.emask,
            Sr => &self.sr,
            Cr => &self.cr,
            Tdr => &self.tdr,
            Acc => &self.acc,
            Mme => &self.mme,
            Sp => &self.sp,
            Dbg => &self.dbg,
            Fc => &self.fc,
            Sba => return None,
        };
        Some(desc)
    }
}

/// Register sets exposed to debuggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum RegsetType {
    /// General register file.
    Grf,
    /// Address register.
    Addr,
    /// Flag registers.
    Flag,
    /// Channel enable (execution mask).
    Ce,
    /// State registers.
    Sr,
    /// Control registers. `cr0` carries the exception bits and the
    /// instruction pointer.
    Cr,
    /// Thread dependency registers.
    Tdr,
    /// Accumulators.
    Acc,
    /// Math macro extended accumulators.
    Mme,
    /// Stack pointer.
    Sp,
    /// State base addresses, computed from the SBA tracking buffer.
    Sba,
    /// Debug registers. `dbg0` carries the thread's start instruction
    /// pointer.
    Dbg,
    /// Flow control registers.
    Fc,
}

bitflags! {
    /// Access permitted on a register set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegsetFlags: u32 {
        const READABLE = 1 << 0;
        const WRITEABLE = 1 << 1;
    }
}

impl RegsetType {
    /// Every register set, in reporting order.
    pub const ALL: [RegsetType; 13] = [
        RegsetType::Grf,
        RegsetType::Addr,
        RegsetType::Flag,
        RegsetType::Ce,
        RegsetType::Sr,
        RegsetType::Cr,
        RegsetType::Tdr,
        RegsetType::Acc,
        RegsetType::Mme,
        RegsetType::Sp,
        RegsetType::Sba,
        RegsetType::Dbg,
        RegsetType::Fc,
    ];

    pub fn flags(self) -> RegsetFlags {
        match self {
            RegsetType::Ce | RegsetType::Tdr | RegsetType::Sba => RegsetFlags::READABLE,
            _ => RegsetFlags::READABLE | RegsetFlags::WRITEABLE,
        }
    }
}

/// Layout of the virtual SBA register set.
pub const SBA_REGSET: RegsetDesc = RegsetDesc {
    offset: 0,
    num: 9,
    bits: 64,
    bytes: 8,
};

/// Element indices of the SBA register set.
pub mod sba {
    pub const GENERAL_STATE_BASE: usize = 0;
    pub const SURFACE_STATE_BASE: usize = 1;
    pub const DYNAMIC_STATE_BASE: usize = 2;
    pub const INDIRECT_OBJECT_BASE: usize = 3;
    pub const INSTRUCTION_BASE: usize = 4;
    pub const BINDLESS_SURFACE_STATE_BASE: usize = 5;
    pub const BINDLESS_SAMPLER_STATE_BASE: usize = 6;
    pub const BINDING_TABLE: usize = 7;
    pub const SCRATCH_SPACE: usize = 8;
}

/// State base addresses recorded by the runtime in the SBA tracking
/// buffer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pread, Pwrite)]
pub struct SbaTrackingBuffer {
    pub general_state_base: u64,
    pub surface_state_base: u64,
    pub dynamic_state_base: u64,
    pub indirect_object_base: u64,
    pub instruction_base: u64,
    pub bindless_surface_state_base: u64,
    pub bindless_sampler_state_base: u64,
}

impl SbaTrackingBuffer {
    pub const SIZE: usize = 7 * 8;

    pub fn parse(bytes: &[u8]) -> Result<SbaTrackingBuffer, scroll::Error> {
        bytes.pread_with(0, scroll::LE)
    }
}

/// Properties of one register set, as reported to debuggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegsetProperties {
    pub ty: RegsetType,
    pub version: u32,
    pub flags: RegsetFlags,
    pub count: u32,
    pub bits: u32,
    pub bytes: u32,
}

impl RegsetProperties {
    pub(crate) fn new(ty: RegsetType, desc: &RegsetDesc) -> RegsetProperties {
        RegsetProperties {
            ty,
            version: 0,
            flags: ty.flags(),
            count: desc.num as u32,
            bits: desc.bits as u32,
            bytes: desc.bytes as u32,
        }
    }
}
