//! Worker runner
//!
//! Pluggable inference engines behind one contract, capability-based engine
//! selection for the current host, and the per-worker [`Runner`] that owns the
//! loaded model's lifecycle and streams generated tokens to callers.

pub mod inference;
pub mod runner;
pub mod storage;
pub mod system;
pub mod types;

pub use inference::{
    EngineCapability, EngineError, EngineRegistry, FinishReason, InferenceEngine, TokenChunk,
    TokenStream,
};
pub use runner::{Runner, RunnerError, RunnerState};
pub use system::HostProfile;
pub use types::{GenerationRequest, ModelRef, RequestId, RunnerConfig};
