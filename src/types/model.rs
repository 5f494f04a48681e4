//! Model types
//!
//! Defines the model reference handed to engines and the metadata they report back.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Load parameter: path to the model artifact (defaults to the model id)
pub const PARAM_PATH: &str = "path";
/// Load parameter: context window to allocate
pub const PARAM_CONTEXT_LENGTH: &str = "context_length";
/// Load parameter: number of layers to offload to the GPU
pub const PARAM_GPU_LAYERS: &str = "gpu_layers";

/// Identifies a model to load
///
/// An opaque identifier plus backend-specific load parameters. There are no
/// setters: a `ModelRef` is built once with [`ModelRef::with_param`] and then
/// only read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    id: String,
    #[serde(default)]
    params: BTreeMap<String, String>,
}

impl ModelRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            params: BTreeMap::new(),
        }
    }

    /// Returns a copy of this reference with one more load parameter
    pub fn with_param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(key.into(), value.to_string());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Parses a load parameter, ignoring values that don't parse
    pub fn param_as<T: FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.param(key)?;
        match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring unparsable load parameter {}={:?}", key, raw);
                None
            }
        }
    }

    /// Location of the model artifact on disk
    pub fn path(&self) -> PathBuf {
        PathBuf::from(self.param(PARAM_PATH).unwrap_or(&self.id))
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Information about a loaded model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Display name of the model
    pub name: String,
    /// Path to the model artifact
    pub path: String,
    /// Model size in bytes
    pub size_bytes: u64,
    /// Number of parameters (if known)
    pub parameters: Option<u64>,
    /// Context window allocated for generation
    pub context_length: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_defaults_to_id() {
        let model = ModelRef::new("/models/llama.gguf");
        assert_eq!(model.path(), PathBuf::from("/models/llama.gguf"));

        let model = ModelRef::new("llama-3b").with_param(PARAM_PATH, "/srv/llama-3b-q4.gguf");
        assert_eq!(model.path(), PathBuf::from("/srv/llama-3b-q4.gguf"));
    }

    #[test]
    fn test_typed_params() {
        let model = ModelRef::new("m")
            .with_param(PARAM_CONTEXT_LENGTH, 8192)
            .with_param(PARAM_GPU_LAYERS, "lots");

        assert_eq!(model.param_as::<u32>(PARAM_CONTEXT_LENGTH), Some(8192));
        assert_eq!(model.param_as::<u32>(PARAM_GPU_LAYERS), None);
        assert_eq!(model.param_as::<u32>("missing"), None);
    }

    #[test]
    fn test_equality_includes_params() {
        let a = ModelRef::new("m").with_param(PARAM_CONTEXT_LENGTH, 2048);
        let b = ModelRef::new("m").with_param(PARAM_CONTEXT_LENGTH, 4096);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }
}
