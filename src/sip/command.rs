//! The SIP command record exchanged through the `cmd` register window.

use scroll::{Pread, Pwrite, LE};

/// Granularity of shared local memory transfers.
pub const SLM_SEND_BYTES: usize = 16;

/// Bits of an SLM address that form the offset; the rest tag the space.
pub const SLM_ADDRESS_SPACE_TAG_BITS: u32 = 28;

/// Opcodes understood by SIP firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SipCommandKind {
    /// Leave the system routine.
    Resume = 0,
    /// Written back by firmware once a command has completed.
    Ready = 1,
    SlmRead = 2,
    SlmWrite = 3,
}

impl SipCommandKind {
    pub fn from_raw(raw: u32) -> Option<SipCommandKind> {
        Some(match raw {
            0 => SipCommandKind::Resume,
            1 => SipCommandKind::Ready,
            2 => SipCommandKind::SlmRead,
            3 => SipCommandKind::SlmWrite,
            _ => return None,
        })
    }
}

#[derive(Debug, Default, Clone, Copy, Pread, Pwrite)]
struct RawHeader {
    command: u32,
    size: u32,
    offset: u64,
}

/// A decoded command record.
///
/// `size` counts [`SLM_SEND_BYTES`] units and `offset` is a byte offset into
/// shared local memory. `buffer` carries the inline payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipCommand {
    pub command: u32,
    pub size: u32,
    pub offset: u64,
    pub buffer: Vec<u8>,
}

impl SipCommand {
    /// Bytes preceding the inline buffer.
    pub const HEADER_SIZE: usize = 16;

    pub fn new(kind: SipCommandKind, size: u32, offset: u64) -> SipCommand {
        SipCommand {
            command: kind as u32,
            size,
            offset,
            buffer: Vec::new(),
        }
    }

    /// Inline buffer capacity of a command window `window` bytes wide.
    pub fn buffer_capacity(window: usize) -> usize {
        window.saturating_sub(Self::HEADER_SIZE)
    }

    pub fn kind(&self) -> Option<SipCommandKind> {
        SipCommandKind::from_raw(self.command)
    }

    /// Encode into a register window of `window` bytes. The buffer is
    /// truncated or zero-padded to fit.
    pub fn encode(&self, window: usize) -> Vec<u8> {
        let mut raw = vec![0; window.max(Self::HEADER_SIZE)];
        let header = RawHeader {
            command: self.command,
            size: self.size,
            offset: self.offset,
        };
        // the window is at least HEADER_SIZE bytes long
        let _ = raw.pwrite_with(header, 0, LE);

        let n = self.buffer.len().min(Self::buffer_capacity(window));
        raw[Self::HEADER_SIZE..Self::HEADER_SIZE + n].copy_from_slice(&self.buffer[..n]);
        raw
    }

    /// Decode a register window.
    pub fn decode(raw: &[u8]) -> Result<SipCommand, scroll::Error> {
        let header: RawHeader = raw.pread_with(0, LE)?;
        Ok(SipCommand {
            command: header.command,
            size: header.size,
            offset: header.offset,
            buffer: raw[Self::HEADER_SIZE..].to_vec(),
        })
    }
}
