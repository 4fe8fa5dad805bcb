//! Implementations of the [`Transport`] trait for wrapper types.
//!
//! [`Transport`]: super::Transport

mod arc;
mod boxed;
