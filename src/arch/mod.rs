//! Traits to encode architecture-specific debug conventions.
//!
//! GPU generations differ in how the kernel driver packs per-thread
//! attention bits and in whether resuming threads requires a bitmask
//! workaround. These details are captured by the [`Arch`] trait, which is
//! selected by a transport through [`Transport::Arch`].
//!
//! Implementations for concrete hardware live in the companion
//! `eudebug_arch` crate.
//!
//! [`Transport::Arch`]: crate::transport::Transport::Arch

use crate::common::{Geometry, ThreadId};
use crate::util::{align_up, div_ceil};

/// Encodes architecture-specific attention and resume conventions.
///
/// Types implementing `Arch` should be
/// [Zero-variant Enums](https://doc.rust-lang.org/reference/items/enumerations.html#zero-variant-enums),
/// as `Arch` impls are only ever used at the type level, and should never be
/// explicitly instantiated.
pub trait Arch: 'static {
    /// Whether resuming threads requires [`Arch::apply_resume_wa`] on the
    /// attention bitmask and, for version 1 firmware, a resume bit in the
    /// saved thread state.
    const RESUME_WA_REQUIRED: bool = false;

    /// Bytes of attention bitmask describing one EU.
    fn attention_bytes_per_eu(geometry: &Geometry) -> usize {
        div_ceil(geometry.threads_per_eu as usize, 8)
    }

    /// Size of the attention bitmask of one tile, padded to a multiple of
    /// eight bytes.
    fn attention_bitmask_size(geometry: &Geometry) -> usize {
        let eus = geometry.slices as usize
            * geometry.subslices_per_slice as usize
            * geometry.eus_per_subslice as usize;
        align_up(eus * Self::attention_bytes_per_eu(geometry), 8)
    }

    /// Byte index and bit of `id` within the attention bitmask of its tile.
    ///
    /// The default packing assigns each EU [`Arch::attention_bytes_per_eu`]
    /// consecutive bytes in (slice, subslice, eu) order.
    fn attention_bit(geometry: &Geometry, id: &ThreadId) -> (usize, u8) {
        let eu_index = (id.slice as usize * geometry.subslices_per_slice as usize
            + id.subslice as usize)
            * geometry.eus_per_subslice as usize
            + id.eu as usize;
        let byte = eu_index * Self::attention_bytes_per_eu(geometry) + id.thread as usize / 8;
        (byte, (id.thread % 8) as u8)
    }

    /// Decode an attention bitmask of `tile` into the threads it selects.
    fn threads_from_attention_bitmask(geometry: &Geometry, tile: u32, bitmask: &[u8]) -> Vec<ThreadId> {
        let mut threads = Vec::new();
        for slice in 0..geometry.slices {
            for subslice in 0..geometry.subslices_per_slice {
                for eu in 0..geometry.eus_per_subslice {
                    for thread in 0..geometry.threads_per_eu {
                        let id = ThreadId::new(tile, slice, subslice, eu, thread);
                        let (byte, bit) = Self::attention_bit(geometry, &id);
                        match bitmask.get(byte) {
                            Some(b) if b & (1 << bit) != 0 => threads.push(id),
                            _ => {}
                        }
                    }
                }
            }
        }
        threads
    }

    /// Encode `threads` as an attention bitmask of one tile.
    ///
    /// The tile index of each thread is ignored.
    fn attention_bitmask(geometry: &Geometry, threads: &[ThreadId]) -> Vec<u8> {
        let mut bitmask = vec![0; Self::attention_bitmask_size(geometry)];
        for id in threads {
            let (byte, bit) = Self::attention_bit(geometry, id);
            if let Some(b) = bitmask.get_mut(byte) {
                *b |= 1 << bit;
            }
        }
        bitmask
    }

    /// Merge each pair of dwords of `bitmask` so both halves carry the union
    /// of their bits. No-op unless [`Arch::RESUME_WA_REQUIRED`].
    fn apply_resume_wa(bitmask: &mut [u8]) {
        if !Self::RESUME_WA_REQUIRED {
            return;
        }

        for pair in bitmask.chunks_exact_mut(8) {
            let (lo, hi) = pair.split_at_mut(4);
            for (l, h) in lo.iter_mut().zip(hi.iter_mut()) {
                let merged = *l | *h;
                *l = merged;
                *h = merged;
            }
        }
    }
}
