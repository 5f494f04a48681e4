//! Shared type definitions
//!
//! This module contains the data types shared by engines, the selector and the runner.

pub mod config;
pub mod model;
pub mod request;

pub use config::{RunnerConfig, UnloadPolicy};
pub use model::{ModelInfo, ModelRef};
pub use request::{GenerationRequest, RequestId, SamplingParams, StopSequences};
