//! The state-save-area header and system-routine identification record.

use core::fmt::{self, Display};

use scroll::{Pread, Pwrite, LE};

use super::regset::{RegsetDesc, RegsetTable, RegsetType};
use crate::common::{Geometry, ThreadId};

/// Magic string opening the state-save-area header.
pub const TSSAREA_MAGIC: [u8; 8] = *b"tssarea\0";
/// Magic string opening each thread's system-routine identification record.
pub const SRMAGIC: [u8; 8] = *b"srmagic\0";

/// Size of the version header that starts every state-save-area header.
pub const VERSION_HEADER_SIZE: usize = 16;

const SLOT_LAYOUT_SIZE: usize = 40;
const FIFO_DESC_SIZE: usize = 16;

/// Oldest firmware able to service shared local memory commands.
pub const MIN_SLM_SIP_VERSION: SipVersion = SipVersion {
    major: 2,
    minor: 1,
    patch: 0,
};

/// Version of the SIP firmware that published a header.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Pread, Pwrite)]
pub struct SipVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl SipVersion {
    pub const fn new(major: u8, minor: u8, patch: u8) -> SipVersion {
        SipVersion {
            major,
            minor,
            patch,
        }
    }
}

impl Display for SipVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Geometry constants and per-thread slot layout.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pread, Pwrite)]
pub struct SlotLayout {
    pub num_slices: u32,
    pub num_subslices_per_slice: u32,
    pub num_eus_per_subslice: u32,
    pub num_threads_per_eu: u32,
    /// Offset of the first thread slot, relative to the end of the header.
    pub state_area_offset: u32,
    /// Size of one thread slot.
    pub state_save_size: u32,
    pub slm_area_offset: u32,
    pub slm_bank_size: u32,
    pub slm_bank_valid: u32,
    /// Offset of the [`SrIdent`] within a thread slot.
    pub sr_magic_offset: u32,
}

/// Location of the attention FIFO within the context save area.
/// Published starting with version 3.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pread, Pwrite)]
pub struct FifoDesc {
    pub offset: u32,
    pub size: u32,
    pub head: u32,
    pub tail: u32,
}

/// An error encountered while validating a state-save-area header.
#[derive(Debug)]
pub enum HeaderError {
    /// Fewer bytes than the header declares.
    TooShort,
    /// The `tssarea` magic is missing.
    BadMagic,
    /// The major version has no known layout.
    UnsupportedVersion(SipVersion),
    /// The declared size does not match the layout of the declared version.
    SizeMismatch { expected: usize, found: usize },
    /// A field could not be decoded.
    Parse(scroll::Error),
}

impl From<scroll::Error> for HeaderError {
    fn from(e: scroll::Error) -> Self {
        HeaderError::Parse(e)
    }
}

impl Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::HeaderError::*;
        match self {
            TooShort => write!(f, "state save area header is truncated"),
            BadMagic => write!(f, "state save area header has no `tssarea` magic"),
            UnsupportedVersion(v) => write!(f, "unsupported state save area version {}", v),
            SizeMismatch { expected, found } => write!(
                f,
                "state save area header size mismatch: expected {} bytes, found {}",
                expected, found
            ),
            Parse(e) => write!(f, "malformed state save area header: {}", e),
        }
    }
}

impl std::error::Error for HeaderError {}

/// A validated state-save-area header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSaveAreaHeader {
    pub version: SipVersion,
    pub layout: SlotLayout,
    pub fifo: Option<FifoDesc>,
    pub regsets: RegsetTable,
}

impl StateSaveAreaHeader {
    /// Upper bound on the size of any known header version.
    pub const MAX_SIZE: usize = 224;

    /// Encoded size of a header of the given major version, padded to a
    /// multiple of eight bytes.
    pub fn encoded_size(major: u8) -> Option<usize> {
        let fifo = match major {
            1 | 2 => 0,
            3 => FIFO_DESC_SIZE,
            _ => return None,
        };
        let raw = VERSION_HEADER_SIZE + SLOT_LAYOUT_SIZE + fifo + RegsetTable::SIZE;
        Some(crate::util::align_up(raw, 8))
    }

    /// Parse and validate a header.
    ///
    /// `bytes` may extend past the header.
    pub fn parse(bytes: &[u8]) -> Result<StateSaveAreaHeader, HeaderError> {
        if bytes.len() < VERSION_HEADER_SIZE {
            return Err(HeaderError::TooShort);
        }
        if bytes[..TSSAREA_MAGIC.len()] != TSSAREA_MAGIC {
            return Err(HeaderError::BadMagic);
        }

        let mut offset = TSSAREA_MAGIC.len() + 4;
        let version: SipVersion = bytes.gread_with(&mut offset, LE)?;
        let size: u8 = bytes.gread(&mut offset)?;

        let expected =
            Self::encoded_size(version.major).ok_or(HeaderError::UnsupportedVersion(version))?;
        let found = size as usize * 8;
        if found != expected {
            return Err(HeaderError::SizeMismatch { expected, found });
        }
        if bytes.len() < expected {
            return Err(HeaderError::TooShort);
        }

        let mut offset = VERSION_HEADER_SIZE;
        let layout: SlotLayout = bytes.gread_with(&mut offset, LE)?;
        let fifo = if version.major >= 3 {
            Some(bytes.gread_with::<FifoDesc>(&mut offset, LE)?)
        } else {
            None
        };
        let regsets: RegsetTable = bytes.gread_with(&mut offset, LE)?;

        Ok(StateSaveAreaHeader {
            version,
            layout,
            fifo,
            regsets,
        })
    }

    /// Serialize the header in firmware layout.
    pub fn to_bytes(&self) -> Result<Vec<u8>, HeaderError> {
        let size = self.size()?;
        let mut bytes = vec![0; size];

        bytes[..TSSAREA_MAGIC.len()].copy_from_slice(&TSSAREA_MAGIC);
        let mut offset = TSSAREA_MAGIC.len() + 4;
        bytes.gwrite_with(self.version, &mut offset, LE)?;
        bytes.gwrite((size / 8) as u8, &mut offset)?;

        let mut offset = VERSION_HEADER_SIZE;
        bytes.gwrite_with(self.layout, &mut offset, LE)?;
        if self.version.major >= 3 {
            bytes.gwrite_with(self.fifo.unwrap_or_default(), &mut offset, LE)?;
        }
        bytes.gwrite_with(self.regsets, &mut offset, LE)?;
        Ok(bytes)
    }

    /// Encoded size of this header.
    pub fn size(&self) -> Result<usize, HeaderError> {
        Self::encoded_size(self.version.major).ok_or(HeaderError::UnsupportedVersion(self.version))
    }

    /// Thread geometry the firmware laid the save area out for.
    pub fn geometry(&self) -> Geometry {
        Geometry {
            slices: self.layout.num_slices,
            subslices_per_slice: self.layout.num_subslices_per_slice,
            eus_per_subslice: self.layout.num_eus_per_subslice,
            threads_per_eu: self.layout.num_threads_per_eu,
        }
    }

    /// Byte offset of the save slot of `id`, relative to the start of the
    /// context save area.
    ///
    /// Slots are laid out row-major by (slice, subslice, eu, thread). The
    /// tile index does not participate: each tile has its own save area.
    pub fn thread_slot_offset(&self, id: &ThreadId) -> usize {
        let l = &self.layout;
        let index = ((id.slice as usize * l.num_subslices_per_slice as usize
            + id.subslice as usize)
            * l.num_eus_per_subslice as usize
            + id.eu as usize)
            * l.num_threads_per_eu as usize
            + id.thread as usize;

        self.size_or_zero() + l.state_area_offset as usize + index * l.state_save_size as usize
    }

    /// Byte offset of register `start` of `desc` within a thread slot.
    pub fn register_offset_in_slot(desc: &RegsetDesc, start: u32) -> usize {
        desc.offset as usize + desc.bytes as usize * start as usize
    }

    /// Byte offset of the [`SrIdent`] of `id`.
    pub fn sr_ident_offset(&self, id: &ThreadId) -> usize {
        self.thread_slot_offset(id) + self.layout.sr_magic_offset as usize
    }

    /// Total bytes spanned by the header and every thread slot.
    pub fn area_size(&self) -> usize {
        self.size_or_zero()
            + self.layout.state_area_offset as usize
            + self.geometry().threads_per_tile() * self.layout.state_save_size as usize
    }

    /// Descriptor of a register set stored in the save area. `None` when
    /// this version does not publish the set.
    pub fn regset(&self, ty: RegsetType) -> Option<&RegsetDesc> {
        self.regsets.get(ty).filter(|desc| desc.num != 0)
    }

    /// Descriptor of the SIP command window.
    pub fn command_window(&self) -> Option<&RegsetDesc> {
        Some(&self.regsets.cmd).filter(|desc| desc.num != 0 && self.version.major >= 2)
    }

    /// Whether the firmware services shared local memory commands.
    pub fn supports_slm(&self) -> bool {
        self.version >= MIN_SLM_SIP_VERSION && self.command_window().is_some()
    }

    fn size_or_zero(&self) -> usize {
        self.size().unwrap_or(0)
    }
}

/// System-routine identification record, stored in every thread slot.
///
/// `count` is bumped by firmware on every entry to and exit from the
/// system routine: odd while the thread is parked in SIP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrIdent {
    pub count: u8,
    pub version: SipVersion,
}

impl SrIdent {
    pub const SIZE: usize = 16;

    /// Decode a record. `None` when the `srmagic` marker is missing.
    pub fn parse(bytes: &[u8]) -> Option<SrIdent> {
        if bytes.len() < Self::SIZE || bytes[..SRMAGIC.len()] != SRMAGIC {
            return None;
        }
        let mut offset = SRMAGIC.len();
        let count: u8 = bytes.gread(&mut offset).ok()?;
        let version: SipVersion = bytes.gread_with(&mut offset, LE).ok()?;
        Some(SrIdent { count, version })
    }

    pub fn to_bytes(&self) -> [u8; SrIdent::SIZE] {
        let mut bytes = [0; SrIdent::SIZE];
        bytes[..SRMAGIC.len()].copy_from_slice(&SRMAGIC);
        bytes[SRMAGIC.len()] = self.count;
        bytes[SRMAGIC.len() + 1] = self.version.major;
        bytes[SRMAGIC.len() + 2] = self.version.minor;
        bytes[SRMAGIC.len() + 3] = self.version.patch;
        bytes
    }

    /// Whether the thread is currently executing the system routine.
    pub fn in_system_routine(&self) -> bool {
        self.count % 2 == 1
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_header(major: u8) -> StateSaveAreaHeader {
        let desc = |offset: u32, num: u16, bytes: u16| RegsetDesc {
            offset,
            num,
            bits: bytes * 8,
            bytes,
        };

        StateSaveAreaHeader {
            version: SipVersion::new(major, 1, 0),
            layout: SlotLayout {
                num_slices: 2,
                num_subslices_per_slice: 2,
                num_eus_per_subslice: 2,
                num_threads_per_eu: 3,
                state_area_offset: 0x40,
                state_save_size: 0x400,
                slm_area_offset: 0,
                slm_bank_size: 0,
                slm_bank_valid: 0,
                sr_magic_offset: 0x3e0,
            },
            fifo: if major >= 3 {
                Some(FifoDesc {
                    offset: 0x20,
                    size: 0x20,
                    head: 0,
                    tail: 0,
                })
            } else {
                None
            },
            regsets: RegsetTable {
                grf: desc(0x0, 16, 32),
                addr: desc(0x200, 1, 16),
                flag: desc(0x210, 2, 4),
                emask: desc(0x218, 1, 4),
                sr: desc(0x220, 2, 16),
                cr: desc(0x240, 1, 16),
                notification: RegsetDesc::default(),
                tdr: desc(0x250, 1, 16),
                acc: desc(0x260, 2, 32),
                mme: desc(0x2a0, 2, 32),
                ctrl: RegsetDesc::default(),
                sp: desc(0x2e0, 1, 16),
                cmd: if major >= 2 { desc(0x300, 1, 64) } else { RegsetDesc::default() },
                dbg: desc(0x340, 1, 8),
                fc: desc(0x348, 1, 4),
            },
        }
    }

    #[test]
    fn header_sizes_are_multiples_of_eight() {
        assert_eq!(StateSaveAreaHeader::encoded_size(1), Some(208));
        assert_eq!(StateSaveAreaHeader::encoded_size(2), Some(208));
        assert_eq!(StateSaveAreaHeader::encoded_size(3), Some(StateSaveAreaHeader::MAX_SIZE));
        assert_eq!(StateSaveAreaHeader::encoded_size(4), None);
    }

    #[test]
    fn header_parses_what_it_serializes() {
        for major in 1..=3 {
            let header = sample_header(major);
            let bytes = header.to_bytes().unwrap();
            assert_eq!(&bytes[..8], b"tssarea\0");
            assert_eq!(StateSaveAreaHeader::parse(&bytes).unwrap(), header);
        }
    }

    #[test]
    fn header_rejects_bad_magic_and_size() {
        let mut bytes = sample_header(2).to_bytes().unwrap();
        bytes[0] = b'x';
        assert!(matches!(
            StateSaveAreaHeader::parse(&bytes),
            Err(HeaderError::BadMagic)
        ));

        let mut bytes = sample_header(2).to_bytes().unwrap();
        bytes[15] += 1;
        assert!(matches!(
            StateSaveAreaHeader::parse(&bytes),
            Err(HeaderError::SizeMismatch { expected: 208, .. })
        ));

        let bytes = sample_header(3).to_bytes().unwrap();
        assert!(matches!(
            StateSaveAreaHeader::parse(&bytes[..100]),
            Err(HeaderError::TooShort)
        ));
    }

    #[test]
    fn thread_slots_are_row_major_and_disjoint() {
        let header = sample_header(2);
        let g = header.geometry();

        let mut previous: Option<usize> = None;
        for slice in 0..g.slices {
            for subslice in 0..g.subslices_per_slice {
                for eu in 0..g.eus_per_subslice {
                    for thread in 0..g.threads_per_eu {
                        let id = ThreadId::new(0, slice, subslice, eu, thread);
                        let offset = header.thread_slot_offset(&id);
                        if let Some(prev) = previous {
                            assert!(offset >= prev + header.layout.state_save_size as usize);
                        }
                        previous = Some(offset);
                    }
                }
            }
        }

        assert_eq!(
            header.thread_slot_offset(&ThreadId::new(0, 0, 0, 0, 0)),
            208 + 0x40
        );
        assert_eq!(
            header.thread_slot_offset(&ThreadId::new(0, 1, 0, 1, 2)),
            208 + 0x40 + (12 + 3 + 2) * 0x400
        );
        assert_eq!(previous.unwrap() + 0x400, header.area_size());
    }

    #[test]
    fn register_offsets_step_by_element_size() {
        let header = sample_header(2);
        let grf = header.regset(RegsetType::Grf).unwrap();
        assert_eq!(StateSaveAreaHeader::register_offset_in_slot(grf, 0), 0);
        assert_eq!(StateSaveAreaHeader::register_offset_in_slot(grf, 3), 96);
        assert!(header.regset(RegsetType::Sba).is_none());
    }

    #[test]
    fn slm_support_follows_version() {
        assert!(!sample_header(1).supports_slm());
        assert!(sample_header(2).supports_slm());

        let mut old = sample_header(2);
        old.version = SipVersion::new(2, 0, 5);
        assert!(!old.supports_slm());
    }

    #[test]
    fn sr_ident_parity() {
        let ident = SrIdent {
            count: 3,
            version: SipVersion::new(2, 0, 0),
        };
        let bytes = ident.to_bytes();
        assert_eq!(SrIdent::parse(&bytes), Some(ident));
        assert!(ident.in_system_routine());

        let mut bad = bytes;
        bad[1] = 0;
        assert_eq!(SrIdent::parse(&bad), None);
    }
}
