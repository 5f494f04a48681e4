//! Settings storage
//!
//! Manages persistence of worker settings.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage::{get_data_dir, StorageError};
use crate::system::HostProfile;
use crate::types::model::{PARAM_CONTEXT_LENGTH, PARAM_GPU_LAYERS, PARAM_PATH};
use crate::types::{GenerationRequest, ModelRef, RunnerConfig, SamplingParams, UnloadPolicy};

/// Context sizes a model may be loaded with
const VALID_CONTEXT_SIZES: [u32; 9] = [512, 1024, 2048, 4096, 8192, 16384, 32768, 65536, 131072];

/// Worker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Capacity of each request's token stream (1 - 4096)
    pub channel_capacity: usize,
    /// Seconds a single engine load may take before it counts as failed
    pub load_timeout_secs: u64,
    /// Default per-request deadline in seconds (unset or 0 = none)
    pub generation_timeout_secs: Option<u64>,
    /// What unload does while requests are streaming
    pub unload_policy: UnloadPolicy,
    /// Seconds unload waits under the `wait` policy
    pub unload_wait_secs: u64,
    /// Engine variant tried first
    pub preferred_engine: Option<String>,
    /// Number of GPU layers to offload on accelerated engines
    pub gpu_layers: u32,
    /// Context window size
    pub context_size: u32,
    /// Temperature parameter for text generation (0.0 - 2.0)
    pub temperature: f32,
    /// Top-p (nucleus sampling) parameter (0.0 - 1.0)
    pub top_p: f32,
    /// Top-k sampling parameter
    pub top_k: u32,
    /// Maximum number of tokens to generate
    pub max_tokens: u32,
    /// Sampling seed (0 = random)
    pub seed: u32,
    /// Directory where model files (.gguf) are stored
    pub models_directory: PathBuf,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            channel_capacity: 32,
            load_timeout_secs: 120,
            generation_timeout_secs: None,
            unload_policy: UnloadPolicy::Reject,
            unload_wait_secs: 30,
            preferred_engine: None,
            gpu_layers: 99, // Offload all layers to GPU by default
            context_size: 4096,
            temperature: 0.7,
            top_p: 0.95,
            top_k: 40,
            max_tokens: 512,
            seed: 0,
            models_directory: get_data_dir()
                .ok()
                .map(|d| d.join("models"))
                .unwrap_or_else(|| PathBuf::from("./models")),
        }
    }
}

impl WorkerSettings {
    /// Validate settings values against the current host
    pub fn validate(&mut self) {
        self.validate_with_vram(HostProfile::current().gpu.vram_total_gb());
    }

    /// Validate settings values
    ///
    /// Clamps every parameter into range and caps the context size so the KV
    /// cache fits in `vram_gb` of dedicated VRAM.
    pub fn validate_with_vram(&mut self, vram_gb: Option<f64>) {
        self.channel_capacity = self.channel_capacity.clamp(1, 4096);
        self.load_timeout_secs = self.load_timeout_secs.max(1);
        if self.generation_timeout_secs == Some(0) {
            self.generation_timeout_secs = None;
        }
        if self
            .preferred_engine
            .as_deref()
            .is_some_and(|name| name.trim().is_empty())
        {
            self.preferred_engine = None;
        }

        self.temperature = self.temperature.clamp(0.0, 2.0);
        self.top_p = self.top_p.clamp(0.0, 1.0);
        if self.top_k == 0 {
            self.top_k = 40;
        }
        self.max_tokens = self.max_tokens.clamp(1, 65536);

        if !VALID_CONTEXT_SIZES.contains(&self.context_size) {
            self.context_size = nearest_context_size(self.context_size);
        }

        let max_safe_context = vram_safe_context_size(vram_gb);
        if self.context_size > max_safe_context {
            tracing::warn!(
                "Context size {} too large for available VRAM, capping to {}",
                self.context_size,
                max_safe_context
            );
            self.context_size = max_safe_context;
        }

        // Can't generate more than the context allows
        if self.max_tokens > self.context_size {
            self.max_tokens = self.context_size / 2;
        }
    }

    pub fn sampling(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            seed: self.seed,
        }
    }

    /// A request carrying these settings' generation defaults
    pub fn request(&self, prompt: impl Into<String>) -> GenerationRequest {
        GenerationRequest::new(prompt)
            .with_max_tokens(self.max_tokens)
            .with_sampling(self.sampling())
    }

    /// Reference to a model file, resolved against `models_directory` when relative
    pub fn model_ref(&self, file: impl AsRef<Path>) -> ModelRef {
        let file = file.as_ref();
        let path = if file.is_absolute() || file.exists() {
            file.to_path_buf()
        } else {
            self.models_directory.join(file)
        };

        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        ModelRef::new(id)
            .with_param(PARAM_PATH, path.display())
            .with_param(PARAM_CONTEXT_LENGTH, self.context_size)
            .with_param(PARAM_GPU_LAYERS, self.gpu_layers)
    }
}

impl From<&WorkerSettings> for RunnerConfig {
    fn from(settings: &WorkerSettings) -> Self {
        RunnerConfig {
            channel_capacity: settings.channel_capacity,
            load_timeout: Duration::from_secs(settings.load_timeout_secs),
            generation_timeout: settings.generation_timeout_secs.map(Duration::from_secs),
            unload_policy: settings.unload_policy,
            unload_wait: Duration::from_secs(settings.unload_wait_secs),
            preferred_engine: settings.preferred_engine.clone(),
            ..RunnerConfig::default()
        }
    }
}

fn nearest_context_size(requested: u32) -> u32 {
    VALID_CONTEXT_SIZES
        .iter()
        .copied()
        .min_by_key(|&size| (size as i64 - requested as i64).abs())
        .unwrap_or(4096)
}

/// Estimate the maximum safe context size based on available VRAM
///
/// Tuned so 8 GB VRAM allows 32K context: half the VRAM for the model, half
/// for the KV cache at roughly 128 MB per 1K tokens.
fn vram_safe_context_size(vram_gb: Option<f64>) -> u32 {
    let vram_gb = match vram_gb {
        Some(gb) if gb > 0.0 => gb,
        // Unknown VRAM (CPU hosts): no cap
        _ => return *VALID_CONTEXT_SIZES.last().unwrap_or(&131072),
    };

    let vram_for_kv = vram_gb * 0.5;
    let max_ctx = (vram_for_kv * 1024.0 / 128.0) as u32 * 1024;

    let size = VALID_CONTEXT_SIZES
        .iter()
        .rev()
        .copied()
        .find(|&s| s <= max_ctx)
        .unwrap_or(VALID_CONTEXT_SIZES[0]);
    tracing::debug!("VRAM: {:.1} GB -> max safe context: {}", vram_gb, size);
    size
}

/// Get the settings file path
fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> WorkerSettings {
    match get_settings_path().and_then(|path| load_settings_from(&path)) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            WorkerSettings::default()
        }
    }
}

/// Load and validate settings from `path`; a missing file yields defaults
pub fn load_settings_from(path: &Path) -> Result<WorkerSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(WorkerSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: WorkerSettings = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to disk
pub fn save_settings(settings: &WorkerSettings) -> Result<(), StorageError> {
    save_settings_to(settings, &get_settings_path()?)
}

pub fn save_settings_to(settings: &WorkerSettings, path: &Path) -> Result<(), StorageError> {
    // Ensure the parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}
