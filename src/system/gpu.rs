//! GPU detection
//!
//! Detects the host GPU and the native API it can be driven through.

use std::process::Command;

use serde::{Deserialize, Serialize};

/// Native API a detected GPU is reachable through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuApi {
    Metal,
    Cuda,
    Other,
}

/// GPU information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub name: String,
    pub api: Option<GpuApi>,
    pub vram_total_mb: u64,
    pub vram_used_mb: u64,
    /// Unified memory (Apple Silicon): VRAM is the system RAM
    pub unified_memory: bool,
    pub is_available: bool,
}

impl GpuInfo {
    fn not_detected() -> Self {
        Self {
            name: "GPU not detected".to_string(),
            ..Self::default()
        }
    }

    /// Total dedicated VRAM in GB, if known
    pub fn vram_total_gb(&self) -> Option<f64> {
        if self.is_available && self.vram_total_mb > 0 {
            Some(self.vram_total_mb as f64 / 1024.0)
        } else {
            None
        }
    }
}

/// Detect available GPU (best effort)
pub fn detect_gpu() -> GpuInfo {
    let detected = if cfg!(target_os = "macos") {
        detect_gpu_system_profiler().or_else(detect_gpu_apple_silicon)
    } else if cfg!(target_os = "windows") {
        detect_gpu_nvidia_smi().or_else(detect_gpu_wmic)
    } else {
        detect_gpu_nvidia_smi()
    };

    detected.unwrap_or_else(GpuInfo::not_detected)
}

/// Runs a probe command, returning stdout only on success
fn probe(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        tracing::debug!("Probe {} exited with {}", program, output.status);
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

// =============================================================================
// macOS
// =============================================================================

/// Detect GPU using system_profiler SPDisplaysDataType
fn detect_gpu_system_profiler() -> Option<GpuInfo> {
    let stdout = probe("system_profiler", &["SPDisplaysDataType"])?;
    let (name, vram_mb) = parse_system_profiler(&stdout)?;

    // Apple Silicon reports no VRAM line: its GPU shares system RAM
    let unified_memory = name.contains("Apple");
    let vram_mb = match vram_mb {
        Some(mb) => Some(mb),
        None if unified_memory => macos_total_ram_mb(),
        None => None,
    };

    Some(GpuInfo {
        name: format!("{} (Metal)", name),
        api: Some(GpuApi::Metal),
        vram_total_mb: vram_mb.unwrap_or(0),
        vram_used_mb: 0,
        unified_memory,
        is_available: true,
    })
}

/// Extracts "Chipset Model" and the VRAM line from system_profiler output
fn parse_system_profiler(stdout: &str) -> Option<(String, Option<u64>)> {
    let mut gpu_name: Option<String> = None;
    let mut vram_mb: Option<u64> = None;

    for line in stdout.lines() {
        let trimmed = line.trim();

        // "Chipset Model: Apple M2 Pro"
        if let Some(name) = trimmed.strip_prefix("Chipset Model:") {
            let name = name.trim();
            if !name.is_empty() {
                gpu_name = Some(name.to_string());
            }
        }

        // "VRAM (Total): 16 GB" or "VRAM (Dynamic, Max): 4096 MB"
        if trimmed.starts_with("VRAM") {
            let after_colon = trimmed.split(':').nth(1).unwrap_or("").trim();
            let parts: Vec<&str> = after_colon.split_whitespace().collect();
            if let [value, unit, ..] = parts.as_slice() {
                if let Ok(val) = value.parse::<u64>() {
                    vram_mb = Some(match unit.to_uppercase().as_str() {
                        "GB" => val * 1024,
                        _ => val,
                    });
                }
            }
        }
    }

    gpu_name.map(|name| (name, vram_mb))
}

/// Detect Apple Silicon GPU from the CPU brand string
fn detect_gpu_apple_silicon() -> Option<GpuInfo> {
    let brand = probe("sysctl", &["-n", "machdep.cpu.brand_string"])?;
    let brand = brand.trim();
    if !brand.contains("Apple") {
        return None;
    }

    Some(GpuInfo {
        name: format!("{} GPU (Metal, Unified Memory)", brand),
        api: Some(GpuApi::Metal),
        vram_total_mb: macos_total_ram_mb().unwrap_or(0),
        vram_used_mb: 0,
        unified_memory: true,
        is_available: true,
    })
}

fn macos_total_ram_mb() -> Option<u64> {
    let bytes = probe("sysctl", &["-n", "hw.memsize"])?;
    let bytes = bytes.trim().parse::<u64>().ok()?;
    Some(bytes / 1024 / 1024)
}

// =============================================================================
// NVIDIA (Linux and Windows)
// =============================================================================

fn detect_gpu_nvidia_smi() -> Option<GpuInfo> {
    let stdout = probe(
        "nvidia-smi",
        &[
            "--query-gpu=name,memory.total,memory.used",
            "--format=csv,noheader,nounits",
        ],
    )?;
    parse_nvidia_smi(&stdout)
}

fn parse_nvidia_smi(stdout: &str) -> Option<GpuInfo> {
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    let [name, total, used, ..] = parts.as_slice() else {
        return None;
    };

    Some(GpuInfo {
        name: name.to_string(),
        api: Some(GpuApi::Cuda),
        vram_total_mb: total.parse().ok()?,
        vram_used_mb: used.parse().ok()?,
        unified_memory: false,
        is_available: true,
    })
}

// =============================================================================
// Windows fallback
// =============================================================================

fn detect_gpu_wmic() -> Option<GpuInfo> {
    let stdout = probe(
        "wmic",
        &[
            "path",
            "Win32_VideoController",
            "get",
            "Name,AdapterRAM",
            "/Format:List",
        ],
    )?;

    let mut name: Option<String> = None;
    let mut adapter_ram_bytes: Option<u64> = None;

    for line in stdout.lines().map(str::trim) {
        if let Some(value) = line.strip_prefix("Name=") {
            if !value.trim().is_empty() {
                name = Some(value.trim().to_string());
            }
        } else if let Some(value) = line.strip_prefix("AdapterRAM=") {
            adapter_ram_bytes = value.trim().parse().ok();
        }

        if name.is_some() && adapter_ram_bytes.is_some() {
            break;
        }
    }

    Some(GpuInfo {
        name: name?,
        api: Some(GpuApi::Other),
        vram_total_mb: adapter_ram_bytes.unwrap_or(0) / 1024 / 1024,
        vram_used_mb: 0,
        unified_memory: false,
        is_available: true,
    })
}
