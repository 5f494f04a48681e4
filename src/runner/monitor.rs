//! Runner telemetry
//!
//! The runner reports lifecycle and per-request events to a [`MonitorSink`].
//! Recording is fire-and-forget: sinks must return promptly and never fail.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::inference::{EngineAttempt, FinishReason};
use crate::types::RequestId;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    ModelLoaded {
        model: String,
        engine: String,
        duration_ms: u64,
        /// Variants that failed before `engine` succeeded
        fallbacks: usize,
    },
    ModelLoadFailed {
        model: String,
        attempts: Vec<EngineAttempt>,
        failures: u64,
    },
    ModelUnloaded {
        model: String,
        engine: String,
    },
    RequestCompleted {
        request_id: RequestId,
        engine: String,
        tokens: u64,
        tokens_per_sec: f64,
        finish_reason: FinishReason,
    },
    RequestFailed {
        request_id: RequestId,
        engine: String,
        reason: String,
        failures: u64,
    },
    RequestCancelled {
        request_id: RequestId,
        engine: String,
        tokens: u64,
    },
}

/// Receives telemetry from the runner
pub trait MonitorSink: Send + Sync {
    /// Called inline on runner paths; must not block
    fn record(&self, event: &TelemetryEvent);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MonitorSink for NullSink {
    fn record(&self, _event: &TelemetryEvent) {}
}

/// Logs events through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MonitorSink for TracingSink {
    fn record(&self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::ModelLoaded {
                model,
                engine,
                duration_ms,
                ..
            } => tracing::info!("Model '{}' loaded on '{}' in {}ms", model, engine, duration_ms),
            TelemetryEvent::ModelLoadFailed {
                model, failures, ..
            } => tracing::warn!("Model '{}' failed to load (failure #{})", model, failures),
            TelemetryEvent::ModelUnloaded { model, engine } => {
                tracing::info!("Model '{}' unloaded from '{}'", model, engine)
            }
            TelemetryEvent::RequestCompleted {
                request_id,
                tokens,
                tokens_per_sec,
                finish_reason,
                ..
            } => tracing::info!(
                "Request {} finished ({:?}): {} chunks, {:.1} tok/s",
                request_id,
                finish_reason,
                tokens,
                tokens_per_sec
            ),
            TelemetryEvent::RequestFailed {
                request_id, reason, ..
            } => tracing::warn!("Request {} failed: {}", request_id, reason),
            TelemetryEvent::RequestCancelled {
                request_id, tokens, ..
            } => tracing::info!("Request {} cancelled after {} chunks", request_id, tokens),
        }
    }
}

/// A timestamped event
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryRecord {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: TelemetryEvent,
}

/// Forwards events to a bounded channel, dropping them when it is full
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<TelemetryRecord>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<TelemetryRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Arc::new(Self { tx }), rx)
    }
}

impl MonitorSink for ChannelSink {
    fn record(&self, event: &TelemetryEvent) {
        let record = TelemetryRecord {
            at: Utc::now(),
            event: event.clone(),
        };
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => tracing::debug!("Telemetry channel full, event dropped"),
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unloaded(model: &str) -> TelemetryEvent {
        TelemetryEvent::ModelUnloaded {
            model: model.to_string(),
            engine: "e".to_string(),
        }
    }

    #[test]
    fn test_channel_sink_drops_when_full() {
        let (sink, mut rx) = ChannelSink::new(1);
        sink.record(&unloaded("a"));
        sink.record(&unloaded("b"));

        assert_eq!(rx.try_recv().unwrap().event, unloaded("a"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_sink_ignores_closed_receiver() {
        let (sink, rx) = ChannelSink::new(4);
        drop(rx);
        sink.record(&unloaded("a"));
    }

    #[test]
    fn test_event_serialization() {
        let record = TelemetryRecord {
            at: Utc::now(),
            event: TelemetryEvent::RequestCancelled {
                request_id: RequestId::new("r1"),
                engine: "e".to_string(),
                tokens: 3,
            },
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["event"], "request_cancelled");
        assert_eq!(json["request_id"], "r1");
        assert_eq!(json["tokens"], 3);
        assert!(json["at"].is_string());
    }
}
