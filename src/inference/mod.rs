//! Inference engines
//!
//! The engine contract, the registry of variants built into this process, the
//! selector that picks one for a host, and the token stream engines write into.

pub mod capability;
pub mod engine;
#[cfg(feature = "llama")]
pub mod llama;
pub mod model;
pub mod selector;
pub mod streaming;

#[cfg(test)]
pub(crate) mod testing;

pub use capability::{default_registry, EngineCapability, EngineRegistry};
pub use engine::{EngineError, EngineHandle, HandleId, InferenceEngine};
pub use selector::{EngineAttempt, NoCompatibleEngine, Selection, Selector};
pub use streaming::{token_channel, CancelHandle, FinishReason, StreamClosed, TokenChunk, TokenSender, TokenStream};
