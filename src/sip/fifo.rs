//! The attention FIFO published by version 3 firmware.
//!
//! A control block at [`FifoDesc::offset`] holds the producer (`head`) and
//! consumer (`tail`) indices followed by `capacity` fixed-size nodes.
//! Firmware fills nodes and advances `head`; the host consumes nodes from
//! `tail`, zeroes them, and publishes the new `tail`.
//!
//! [`FifoDesc::offset`]: super::header::FifoDesc::offset

use scroll::{Pread, Pwrite, LE};

use crate::common::ThreadId;

/// FIFO control block.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pread, Pwrite)]
pub struct FifoControl {
    pub head: u32,
    pub tail: u32,
    pub capacity: u32,
    pub reserved: u32,
}

impl FifoControl {
    pub const SIZE: usize = 16;

    /// Byte offset of the `tail` field within the control block.
    pub const TAIL_OFFSET: usize = 4;

    pub fn parse(bytes: &[u8]) -> Result<FifoControl, scroll::Error> {
        bytes.pread_with(0, LE)
    }

    /// Nodes produced but not yet consumed.
    pub fn pending(&self) -> u32 {
        if self.capacity == 0 {
            return 0;
        }
        let capacity = self.capacity as u64;
        let head = self.head as u64 % capacity;
        let tail = self.tail as u64 % capacity;
        ((head + capacity - tail) % capacity) as u32
    }
}

/// One attention record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FifoNode {
    raw: [u8; FifoNode::SIZE],
}

impl FifoNode {
    pub const SIZE: usize = 4;

    pub fn new(valid: bool, slice: u8, subslice: u8, eu: u8, thread: u8) -> FifoNode {
        FifoNode {
            raw: [(thread << 1) | valid as u8, eu, subslice, slice],
        }
    }

    pub fn from_bytes(raw: [u8; FifoNode::SIZE]) -> FifoNode {
        FifoNode { raw }
    }

    pub fn to_bytes(&self) -> [u8; FifoNode::SIZE] {
        self.raw
    }

    /// Whether firmware finished writing this node.
    pub fn is_valid(&self) -> bool {
        self.raw[0] & 1 != 0
    }

    pub fn thread_id(&self, tile: u32) -> ThreadId {
        ThreadId::new(
            tile,
            self.raw[3] as u32,
            self.raw[2] as u32,
            self.raw[1] as u32,
            (self.raw[0] >> 1) as u32,
        )
    }
}
