//! The module debug area, bound once per client by the runtime.

use scroll::{Pread, LE};

/// Magic string opening the module debug area.
pub const DBGAREA_MAGIC: [u8; 8] = *b"dbgarea\0";

#[derive(Debug, Default, Clone, Copy, Pread)]
struct RawDebugArea {
    _reserved: u64,
    version: u16,
    pgsize: u8,
    scratch_bindless: u8,
}

/// Decoded module debug area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleDebugArea {
    pub version: u16,
    pub pgsize: u8,
    /// Whether scratch space is addressed bindlessly. Selects where the
    /// version 1 resume bit lives.
    pub scratch_bindless: bool,
}

impl ModuleDebugArea {
    pub const SIZE: usize = 24;

    /// Decode the area. `None` when the magic is missing.
    pub fn parse(bytes: &[u8]) -> Option<ModuleDebugArea> {
        if bytes.len() < Self::SIZE || bytes[..DBGAREA_MAGIC.len()] != DBGAREA_MAGIC {
            return None;
        }
        let raw: RawDebugArea = bytes.pread_with(DBGAREA_MAGIC.len(), LE).ok()?;
        Some(ModuleDebugArea {
            version: raw.version,
            pgsize: raw.pgsize,
            scratch_bindless: raw.scratch_bindless != 0,
        })
    }

    pub fn to_bytes(&self) -> [u8; ModuleDebugArea::SIZE] {
        let mut bytes = [0; ModuleDebugArea::SIZE];
        bytes[..8].copy_from_slice(&DBGAREA_MAGIC);
        bytes[16..18].copy_from_slice(&self.version.to_le_bytes());
        bytes[18] = self.pgsize;
        bytes[19] = self.scratch_bindless as u8;
        bytes
    }
}
