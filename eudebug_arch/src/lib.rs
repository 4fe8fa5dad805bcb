//! Implementations of [`eudebug::arch::Arch`] for GPU generations.
//!
//! Pick the type matching the device a [`Transport`] talks to and use it as
//! its `Arch` associated type.
//!
//! [`Transport`]: eudebug::transport::Transport

pub mod gen12lp;
pub mod xe_hpc;

pub use gen12lp::Gen12Lp;
pub use xe_hpc::XeHpc;
