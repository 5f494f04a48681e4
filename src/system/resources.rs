//! System memory probing
//!
//! Reads total and used RAM for the host profile.

#[cfg(target_os = "macos")]
use std::process::Command;

use serde::{Deserialize, Serialize};

/// Replaces the detected total memory, in MB
pub const OVERRIDE_MEMORY_ENV: &str = "OVERRIDE_MEMORY_MB";

/// System memory snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryProfile {
    pub ram_used_mb: u64,
    pub ram_total_mb: u64,
    /// Total comes from `OVERRIDE_MEMORY_MB` rather than the OS
    pub overridden: bool,
}

impl MemoryProfile {
    pub fn ram_available_mb(&self) -> u64 {
        self.ram_total_mb.saturating_sub(self.ram_used_mb)
    }
}

/// Get system memory usage (best effort)
pub fn get_memory_profile() -> MemoryProfile {
    let mut profile = detect_memory();

    if let Ok(value) = std::env::var(OVERRIDE_MEMORY_ENV) {
        match value.trim().parse::<u64>() {
            Ok(mb) => {
                tracing::info!("Total memory overridden to {} MB", mb);
                profile.ram_total_mb = mb;
                profile.overridden = true;
            }
            Err(_) => tracing::warn!("Ignoring invalid {}={:?}", OVERRIDE_MEMORY_ENV, value),
        }
    }

    profile
}

#[cfg(target_os = "linux")]
fn detect_memory() -> MemoryProfile {
    std::fs::read_to_string("/proc/meminfo")
        .map(|meminfo| parse_meminfo(&meminfo))
        .unwrap_or_default()
}

#[cfg(target_os = "macos")]
fn detect_memory() -> MemoryProfile {
    MemoryProfile {
        ram_used_mb: macos_used_ram_mb().unwrap_or(0),
        ram_total_mb: macos_total_ram_mb().unwrap_or(0),
        overridden: false,
    }
}

#[cfg(target_os = "windows")]
fn detect_memory() -> MemoryProfile {
    windows_memory().unwrap_or_default()
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn detect_memory() -> MemoryProfile {
    MemoryProfile::default()
}

// =============================================================================
// Linux
// =============================================================================

/// Parses `/proc/meminfo` (values in kB)
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_meminfo(meminfo: &str) -> MemoryProfile {
    let field = |name: &str| -> Option<u64> {
        meminfo
            .lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|rest| rest.trim_start_matches(':').split_whitespace().next())
            .and_then(|kb| kb.parse::<u64>().ok())
    };

    let total_kb = field("MemTotal").unwrap_or(0);
    let available_kb = field("MemAvailable")
        .or_else(|| field("MemFree"))
        .unwrap_or(total_kb);

    MemoryProfile {
        ram_used_mb: total_kb.saturating_sub(available_kb) / 1024,
        ram_total_mb: total_kb / 1024,
        overridden: false,
    }
}

// =============================================================================
// macOS
// =============================================================================

#[cfg(target_os = "macos")]
fn macos_total_ram_mb() -> Option<u64> {
    let output = Command::new("sysctl").args(["-n", "hw.memsize"]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let bytes = String::from_utf8_lossy(&output.stdout).trim().parse::<u64>().ok()?;
    Some(bytes / 1024 / 1024)
}

/// Used RAM via vm_stat (active + wired pages × page size)
#[cfg(target_os = "macos")]
fn macos_used_ram_mb() -> Option<u64> {
    let output = Command::new("vm_stat").output().ok()?;
    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut page_size: u64 = 16384;
    let mut active_pages: u64 = 0;
    let mut wired_pages: u64 = 0;

    let pages = |line: &str, prefix: &str| -> Option<u64> {
        line.strip_prefix(prefix)?
            .trim()
            .trim_end_matches('.')
            .parse()
            .ok()
    };

    for line in stdout.lines() {
        // "Mach Virtual Memory Statistics: (page size of 16384 bytes)"
        if let Some(start) = line.find("page size of ") {
            if let Some(ps) = line[start + 13..]
                .split_whitespace()
                .next()
                .and_then(|v| v.parse().ok())
            {
                page_size = ps;
            }
        }
        if let Some(v) = pages(line, "Pages active:") {
            active_pages = v;
        }
        if let Some(v) = pages(line, "Pages wired down:") {
            wired_pages = v;
        }
    }

    Some((active_pages + wired_pages) * page_size / 1024 / 1024)
}

// =============================================================================
// Windows
// =============================================================================

#[cfg(target_os = "windows")]
fn windows_memory() -> Option<MemoryProfile> {
    let output = std::process::Command::new("wmic")
        .args(["OS", "get", "FreePhysicalMemory,TotalVisibleMemorySize", "/Value"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut free_kb: Option<u64> = None;
    let mut total_kb: Option<u64> = None;

    for line in stdout.lines().map(str::trim) {
        if let Some(value) = line.strip_prefix("FreePhysicalMemory=") {
            free_kb = value.trim().parse().ok();
        } else if let Some(value) = line.strip_prefix("TotalVisibleMemorySize=") {
            total_kb = value.trim().parse().ok();
        }
    }

    match (free_kb, total_kb) {
        (Some(free), Some(total)) if total > 0 => Some(MemoryProfile {
            ram_used_mb: total.saturating_sub(free) / 1024,
            ram_total_mb: total / 1024,
            overridden: false,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meminfo() {
        let meminfo = "MemTotal:       16384000 kB\nMemFree:         1024000 kB\nMemAvailable:    8192000 kB\n";
        let profile = parse_meminfo(meminfo);
        assert_eq!(profile.ram_total_mb, 16000);
        assert_eq!(profile.ram_used_mb, 8000);
        assert_eq!(profile.ram_available_mb(), 8000);
        assert!(!profile.overridden);
    }

    #[test]
    fn test_parse_meminfo_without_available() {
        let meminfo = "MemTotal: 2048 kB\nMemFree: 1024 kB\n";
        let profile = parse_meminfo(meminfo);
        assert_eq!(profile.ram_total_mb, 2);
        assert_eq!(profile.ram_used_mb, 1);
    }

    #[test]
    fn test_parse_meminfo_garbage() {
        assert_eq!(parse_meminfo("nothing here"), MemoryProfile::default());
    }
}
