//! Cached state-save-area header and helpers to interpret save-area bytes.

use std::sync::{Arc, Mutex};

use crate::common::ThreadId;
use crate::sip::{RegsetDesc, RegsetType, SrIdent, StateSaveAreaHeader};
use crate::util::lock;

use super::classify::ThreadStopState;
use super::DebugError;

#[derive(Debug, Clone)]
struct Cached {
    raw: Arc<[u8]>,
    header: Arc<StateSaveAreaHeader>,
}

/// The header of a context's state save area.
///
/// Fetched lazily and cached once it validates. A header that fails
/// validation is not cached, and is fetched again on the next request.
#[derive(Debug, Default)]
pub(crate) struct StateSaveArea {
    cached: Mutex<Option<Cached>>,
}

impl StateSaveArea {
    pub fn new() -> StateSaveArea {
        StateSaveArea::default()
    }

    /// The cached header, if any.
    pub fn header(&self) -> Option<Arc<StateSaveAreaHeader>> {
        lock(&self.cached).as_ref().map(|c| Arc::clone(&c.header))
    }

    /// The cached header bytes, if any.
    pub fn raw(&self) -> Option<Arc<[u8]>> {
        lock(&self.cached).as_ref().map(|c| Arc::clone(&c.raw))
    }

    /// Validate `raw` and cache it on success.
    pub fn load(&self, raw: &[u8]) -> Option<Arc<StateSaveAreaHeader>> {
        match StateSaveAreaHeader::parse(raw) {
            Ok(header) => {
                let size = header.size().unwrap_or(raw.len()).min(raw.len());
                log::debug!(
                    "state save area header v{}, slm {}",
                    header.version,
                    if header.supports_slm() { "supported" } else { "unsupported" }
                );
                let header = Arc::new(header);
                *lock(&self.cached) = Some(Cached {
                    raw: Arc::from(&raw[..size]),
                    header: Arc::clone(&header),
                });
                Some(header)
            }
            Err(e) => {
                log::warn!("rejecting state save area header: {}", e);
                None
            }
        }
    }

    /// The cached header, fetching it with `fetch` if nothing is cached.
    pub fn get_or_fetch(
        &self,
        fetch: impl FnOnce() -> Result<Vec<u8>, DebugError>,
    ) -> Option<Arc<StateSaveAreaHeader>> {
        if let Some(header) = self.header() {
            return Some(header);
        }

        match fetch() {
            Ok(raw) => self.load(&raw),
            Err(e) => {
                log::debug!("state save area header unavailable: {}", e);
                None
            }
        }
    }
}

/// Descriptor of a register set stored in the save area.
pub(crate) fn regset_descriptor(
    header: &StateSaveAreaHeader,
    ty: RegsetType,
) -> Result<RegsetDesc, DebugError> {
    header.regset(ty).copied().ok_or(DebugError::UnsupportedFeature)
}

/// The system-routine ident of `id` within a full save-area image.
pub(crate) fn sr_ident(header: &StateSaveAreaHeader, area: &[u8], id: &ThreadId) -> Option<SrIdent> {
    let offset = header.sr_ident_offset(id);
    SrIdent::parse(area.get(offset..offset + SrIdent::SIZE)?)
}

fn read_dword(area: &[u8], offset: usize) -> Option<u32> {
    let bytes = area.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Saved condition state of `id` within a full save-area image.
pub(crate) fn thread_stop_state(
    header: &StateSaveAreaHeader,
    area: &[u8],
    id: &ThreadId,
) -> Option<ThreadStopState> {
    let slot = header.thread_slot_offset(id);

    let cr = header.regset(RegsetType::Cr)?;
    let cr0 = slot + StateSaveAreaHeader::register_offset_in_slot(cr, 0);
    let exception_bits = read_dword(area, cr0 + 4)?;
    let ip = read_dword(area, cr0 + 8)?;

    let start_ip = header.regset(RegsetType::Dbg).and_then(|dbg| {
        read_dword(area, slot + StateSaveAreaHeader::register_offset_in_slot(dbg, 0))
    });

    Some(ThreadStopState {
        exception_bits,
        ip,
        start_ip,
    })
}
