//! Binary formats published and consumed by SIP firmware.
//!
//! Every layout in this module is little-endian and packed. Field order and
//! widths are dictated by firmware and must not be changed.

pub mod command;
pub mod debug_area;
pub mod fifo;
pub mod header;
pub mod regset;

pub use header::{SipVersion, SrIdent, StateSaveAreaHeader};
pub use regset::{RegsetDesc, RegsetType};
