//! System utilities
//!
//! This module provides host detection: GPU, memory, and the resulting host profile.

pub mod gpu;
pub mod host;
pub mod resources;

pub use host::{CpuArch, HostProfile, NativeComponent, OsFamily};
