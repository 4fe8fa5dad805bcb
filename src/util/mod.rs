//! Private utility types and functions.

use std::sync::{Mutex, MutexGuard, PoisonError};

use num_traits::PrimInt;

/// Number of meaningful bits in a GPU virtual address.
const GPU_ADDRESS_BITS: u32 = 48;

/// Lock `mutex`, recovering the guard if another thread panicked while
/// holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn align_up<T: PrimInt>(value: T, alignment: T) -> T {
    let rem = value % alignment;
    if rem == T::zero() {
        value
    } else {
        value + (alignment - rem)
    }
}

pub(crate) fn div_ceil<T: PrimInt>(value: T, divisor: T) -> T {
    align_up(value, divisor) / divisor
}

/// Strip the sign-extended upper bits of a canonical GPU address.
pub(crate) fn decanonize(address: u64) -> u64 {
    address & ((1u64 << GPU_ADDRESS_BITS) - 1)
}

/// Dump an attention bitmask at trace level.
pub(crate) fn log_bitmask(label: &str, bitmask: &[u8]) {
    cfg_if::cfg_if! {
        if #[cfg(feature = "trace-bitmask")] {
            if log::log_enabled!(log::Level::Trace) {
                let mut out = String::with_capacity(bitmask.len() * 3);
                for (i, chunk) in bitmask.chunks(8).enumerate() {
                    if i != 0 {
                        out.push(' ');
                    }
                    for b in chunk.iter().rev() {
                        out.push_str(&format!("{:02x}", b));
                    }
                }
                log::trace!("{} [{}]", label, out);
            }
        } else {
            let _ = (label, bitmask);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(0u64, 16), 0);
        assert_eq!(align_up(1u64, 16), 16);
        assert_eq!(align_up(32u32, 16), 32);
        assert_eq!(div_ceil(17usize, 16), 2);
        assert_eq!(div_ceil(16usize, 16), 1);
    }

    #[test]
    fn decanonize_strips_sign_extension() {
        assert_eq!(decanonize(0xffff_8000_0000_1000), 0x8000_0000_1000);
        assert_eq!(decanonize(0x1000), 0x1000);
    }
}
