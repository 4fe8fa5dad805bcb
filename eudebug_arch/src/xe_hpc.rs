//! Implementation for Xe HPC (Ponte Vecchio).

use eudebug::arch::Arch;

/// Xe HPC devices. Multi-tile, eight threads per EU, no resume workaround.
pub enum XeHpc {}

impl Arch for XeHpc {}
