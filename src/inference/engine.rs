//! Inference engine contract
//!
//! Every engine variant (llama.cpp on the GPU, llama.cpp on the CPU, test
//! doubles) implements [`InferenceEngine`]. The contract is the same for all
//! of them; only compatibility predicates and native resources differ.
//!
//! # Ordering
//!
//! Engines do not guard against misuse themselves. The runner guarantees that
//! `load`, `generate` and `unload` never overlap in a way the contract forbids:
//! no `load` while anything else runs on the instance, no `unload` while a
//! generation over the handle is still streaming.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;

use crate::inference::model::ModelError;
use crate::inference::streaming::{StreamClosed, TokenSender};
use crate::types::{GenerationRequest, ModelInfo, ModelRef};

/// Errors that can occur during engine operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("failed to load model: {0}")]
    Load(String),

    #[error("model validation failed: {0}")]
    Validation(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("handle {0} does not belong to the model loaded in this engine")]
    StaleHandle(HandleId),

    #[error("engine worker error: {0}")]
    Worker(String),
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        EngineError::Validation(e.to_string())
    }
}

impl From<StreamClosed> for EngineError {
    fn from(e: StreamClosed) -> Self {
        EngineError::Generation(e.to_string())
    }
}

/// Process-unique id of one successful `load`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        HandleId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One loaded model inside one engine instance
///
/// Not `Clone`: `unload` consumes the handle, so a handle can be unloaded at
/// most once and never used afterwards. Engines key their native resources by
/// [`EngineHandle::id`] and reject handles that don't match
/// ([`EngineError::StaleHandle`]).
#[derive(Debug)]
pub struct EngineHandle {
    id: HandleId,
    engine: String,
    model: ModelRef,
    info: ModelInfo,
}

impl EngineHandle {
    pub fn new(engine: impl Into<String>, model: ModelRef, info: ModelInfo) -> Self {
        Self {
            id: HandleId::next(),
            engine: engine.into(),
            model,
            info,
        }
    }

    /// Same as [`EngineHandle::new`] with an id the engine already allocated
    pub fn with_id(id: HandleId, engine: impl Into<String>, model: ModelRef, info: ModelInfo) -> Self {
        Self {
            id,
            engine: engine.into(),
            model,
            info,
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    pub fn model(&self) -> &ModelRef {
        &self.model
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }
}

/// Contract implemented by every engine variant
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Variant name, also stamped on every chunk
    fn name(&self) -> &str;

    /// Whether several `generate` calls may run at once over one handle
    fn supports_concurrent_generation(&self) -> bool {
        false
    }

    /// Acquires native resources for `model`
    ///
    /// On failure nothing stays allocated, so the call can be retried.
    async fn load(&self, model: &ModelRef) -> Result<EngineHandle, EngineError>;

    /// Streams generated chunks into `sink`
    ///
    /// A successful run ends with one terminal chunk (`Stop` or `Length`). When
    /// `sink` reports cancellation the engine stops at its next step, releases
    /// per-request state and returns `Ok(())` without a terminal chunk. On
    /// `Err` the caller emits the `Error` chunk.
    async fn generate(
        &self,
        handle: &EngineHandle,
        request: GenerationRequest,
        sink: TokenSender,
    ) -> Result<(), EngineError>;

    /// Releases the native resources behind `handle`
    async fn unload(&self, handle: EngineHandle) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_ids_are_unique() {
        let a = EngineHandle::new("e", ModelRef::new("m"), ModelInfo::default());
        let b = EngineHandle::new("e", ModelRef::new("m"), ModelInfo::default());
        assert_ne!(a.id(), b.id());
        assert_eq!(a.engine(), "e");
        assert_eq!(a.model().id(), "m");
    }

    #[test]
    fn test_error_conversions() {
        let err: EngineError = ModelError::Truncated.into();
        assert_eq!(err, EngineError::Validation("truncated GGUF header".to_string()));

        let err: EngineError = StreamClosed::Cancelled.into();
        assert!(matches!(err, EngineError::Generation(_)));
    }
}
