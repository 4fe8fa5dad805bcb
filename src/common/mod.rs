//! Common types and definitions used across `eudebug`.

mod thread_id;
mod topology;

pub use thread_id::{DeviceThread, ThreadId};
pub use topology::{Geometry, TileTopology, Topology};

/// Handle to a GPU virtual address space, as reported by the kernel driver.
pub type MemoryHandle = u64;

/// Memory handle of a thread that has never executed in any address space.
pub const INVALID_HANDLE: MemoryHandle = u64::MAX;

/// Address space targeted by a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySpace {
    /// GPU virtual memory of the thread's (or any) address space.
    Default,
    /// Shared local memory of the thread's workgroup. Requires SIP firmware
    /// support.
    Slm,
}

/// Describes where a memory access should land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySpaceDesc {
    /// Address space.
    pub space: MemorySpace,
    /// Address within `space`.
    pub address: u64,
}

impl MemorySpaceDesc {
    /// A GPU virtual address.
    pub fn default_space(address: u64) -> MemorySpaceDesc {
        MemorySpaceDesc {
            space: MemorySpace::Default,
            address,
        }
    }

    /// An offset into shared local memory.
    pub fn slm(address: u64) -> MemorySpaceDesc {
        MemorySpaceDesc {
            space: MemorySpace::Slm,
            address,
        }
    }
}
