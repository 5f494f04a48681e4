//! Host profile
//!
//! Static description of the machine (OS, architecture, native components)
//! used to decide which engine variants can run here.

use std::collections::BTreeSet;
use std::fmt;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::system::gpu::{self, GpuApi, GpuInfo};
use crate::system::resources::{self, MemoryProfile};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsFamily {
    MacOs,
    Linux,
    Windows,
    Other,
}

impl OsFamily {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "macos" => OsFamily::MacOs,
            "linux" => OsFamily::Linux,
            "windows" => OsFamily::Windows,
            _ => OsFamily::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CpuArch {
    Aarch64,
    X86_64,
    Other,
}

impl CpuArch {
    pub fn current() -> Self {
        match std::env::consts::ARCH {
            "aarch64" => CpuArch::Aarch64,
            "x86_64" => CpuArch::X86_64,
            _ => CpuArch::Other,
        }
    }
}

/// Native runtime pieces an engine variant may depend on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NativeComponent {
    /// Apple GPU reachable through Metal
    Metal,
    /// NVIDIA GPU with a working driver
    Cuda,
    /// llama.cpp is linked into this build
    LlamaCpp,
}

impl fmt::Display for NativeComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeComponent::Metal => write!(f, "metal"),
            NativeComponent::Cuda => write!(f, "cuda"),
            NativeComponent::LlamaCpp => write!(f, "llama.cpp"),
        }
    }
}

/// Static description of the current machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostProfile {
    pub os: OsFamily,
    pub arch: CpuArch,
    pub components: BTreeSet<NativeComponent>,
    #[serde(default)]
    pub gpu: GpuInfo,
    #[serde(default)]
    pub memory: MemoryProfile,
}

static CURRENT: OnceCell<HostProfile> = OnceCell::new();

impl HostProfile {
    pub fn new(os: OsFamily, arch: CpuArch) -> Self {
        Self {
            os,
            arch,
            components: BTreeSet::new(),
            gpu: GpuInfo::default(),
            memory: MemoryProfile::default(),
        }
    }

    pub fn with_component(mut self, component: NativeComponent) -> Self {
        self.components.insert(component);
        self
    }

    pub fn with_gpu(mut self, gpu: GpuInfo) -> Self {
        self.gpu = gpu;
        self
    }

    pub fn with_memory(mut self, memory: MemoryProfile) -> Self {
        self.memory = memory;
        self
    }

    pub fn has(&self, component: NativeComponent) -> bool {
        self.components.contains(&component)
    }

    /// Probes the machine. Spawns helper processes; prefer [`HostProfile::current`].
    pub fn detect() -> Self {
        let os = OsFamily::current();
        let gpu = gpu::detect_gpu();
        let memory = resources::get_memory_profile();

        let mut profile = HostProfile::new(os, CpuArch::current())
            .with_gpu(gpu)
            .with_memory(memory);

        match profile.gpu.api {
            Some(GpuApi::Metal) if os == OsFamily::MacOs => {
                profile.components.insert(NativeComponent::Metal);
            }
            Some(GpuApi::Cuda) => {
                profile.components.insert(NativeComponent::Cuda);
            }
            _ => {}
        }

        if cfg!(feature = "llama") {
            profile.components.insert(NativeComponent::LlamaCpp);
        }

        if !profile.has(NativeComponent::Metal) && !profile.has(NativeComponent::Cuda) {
            tracing::warn!(
                "No GPU runtime detected on {:?}/{:?}; accelerated engines are unavailable",
                profile.os,
                profile.arch
            );
        }

        tracing::info!(
            "Host profile: {:?}/{:?}, gpu={}, ram={} MB, components={:?}",
            profile.os,
            profile.arch,
            profile.gpu.name,
            profile.memory.ram_total_mb,
            profile.components
        );

        profile
    }

    /// Detected once per process, read-only thereafter
    pub fn current() -> &'static HostProfile {
        CURRENT.get_or_init(HostProfile::detect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let host = HostProfile::new(OsFamily::MacOs, CpuArch::Aarch64)
            .with_component(NativeComponent::Metal)
            .with_component(NativeComponent::LlamaCpp);

        assert!(host.has(NativeComponent::Metal));
        assert!(host.has(NativeComponent::LlamaCpp));
        assert!(!host.has(NativeComponent::Cuda));
    }

    #[test]
    fn test_current_platform_enums() {
        if cfg!(target_os = "linux") {
            assert_eq!(OsFamily::current(), OsFamily::Linux);
        }
        if cfg!(target_arch = "x86_64") {
            assert_eq!(CpuArch::current(), CpuArch::X86_64);
        }
    }

    #[test]
    fn test_serialization() {
        let host = HostProfile::new(OsFamily::Linux, CpuArch::X86_64)
            .with_component(NativeComponent::Cuda);
        let json = serde_json::to_string(&host).unwrap();
        assert!(json.contains("\"linux\""));
        assert!(json.contains("\"cuda\""));
        let back: HostProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(host, back);
    }
}
