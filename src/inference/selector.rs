//! Engine selection
//!
//! Picks and loads the best engine variant for a model: an explicit preference
//! first (when compatible), then the registry's ranked compatible variants.
//! Each candidate is tried at most once per selection; the first successful
//! `load` wins. Incompatible variants are never loaded.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::inference::capability::{EngineCapability, EngineRegistry};
use crate::inference::engine::{EngineError, EngineHandle, InferenceEngine};
use crate::system::HostProfile;
use crate::types::ModelRef;

/// One variant the selector considered and why it was passed over
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineAttempt {
    pub engine: String,
    pub error: String,
}

impl fmt::Display for EngineAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.engine, self.error)
    }
}

/// No variant could load the model on this host
///
/// `attempts` is empty when no registered variant matches the host at all.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("no compatible engine for '{model}'{}", describe_attempts(.attempts))]
pub struct NoCompatibleEngine {
    pub model: String,
    pub attempts: Vec<EngineAttempt>,
}

fn describe_attempts(attempts: &[EngineAttempt]) -> String {
    if attempts.is_empty() {
        return " (no registered engine matches this host)".to_string();
    }
    let tried: Vec<String> = attempts.iter().map(ToString::to_string).collect();
    format!(" (tried {})", tried.join("; "))
}

/// A loaded engine, ready for generation
pub struct Selection {
    pub capability: EngineCapability,
    pub engine: Arc<dyn InferenceEngine>,
    pub handle: EngineHandle,
    /// Variants that failed before this one
    pub attempts: Vec<EngineAttempt>,
}

impl fmt::Debug for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selection")
            .field("capability", &self.capability)
            .field("handle", &self.handle)
            .field("attempts", &self.attempts)
            .finish()
    }
}

pub struct Selector {
    registry: Arc<EngineRegistry>,
    load_timeout: Duration,
}

impl Selector {
    pub fn new(registry: Arc<EngineRegistry>) -> Self {
        Self {
            registry,
            load_timeout: Duration::from_secs(120),
        }
    }

    /// A `load` that doesn't finish in time counts as a failed attempt
    pub fn with_load_timeout(mut self, load_timeout: Duration) -> Self {
        self.load_timeout = load_timeout;
        self
    }

    /// Candidates in the order they will be tried
    ///
    /// An incompatible or unknown preference is reported as an attempt and skipped.
    pub fn candidates(
        &self,
        host: &HostProfile,
        preference: Option<&str>,
    ) -> (Vec<EngineCapability>, Vec<EngineAttempt>) {
        let mut candidates = self.registry.compatible(host);
        let mut skipped = Vec::new();

        if let Some(preferred) = preference {
            match candidates.iter().position(|c| c.name() == preferred) {
                Some(index) => {
                    let capability = candidates.remove(index);
                    candidates.insert(0, capability);
                }
                None => {
                    let reason = if self.registry.get(preferred).is_some() {
                        "not compatible with this host"
                    } else {
                        "not registered"
                    };
                    tracing::warn!(
                        "Preferred engine '{}' {}, falling back to ranked engines",
                        preferred,
                        reason
                    );
                    skipped.push(EngineAttempt {
                        engine: preferred.to_string(),
                        error: reason.to_string(),
                    });
                }
            }
        }

        (candidates, skipped)
    }

    pub async fn select(
        &self,
        model: &ModelRef,
        host: &HostProfile,
        preference: Option<&str>,
    ) -> Result<Selection, NoCompatibleEngine> {
        let (candidates, mut attempts) = self.candidates(host, preference);

        if candidates.is_empty() {
            tracing::warn!("No registered engine is compatible with this host");
            return Err(NoCompatibleEngine {
                model: model.id().to_string(),
                attempts,
            });
        }

        for capability in candidates {
            tracing::info!("Loading '{}' with engine '{}'", model, capability.name());

            match self.try_load(&capability, model).await {
                Ok((engine, handle)) => {
                    return Ok(Selection {
                        capability,
                        engine,
                        handle,
                        attempts,
                    });
                }
                Err(error) => {
                    tracing::warn!(
                        "Engine '{}' failed to load '{}': {}",
                        capability.name(),
                        model,
                        error
                    );
                    attempts.push(EngineAttempt {
                        engine: capability.name().to_string(),
                        error: error.to_string(),
                    });
                }
            }
        }

        Err(NoCompatibleEngine {
            model: model.id().to_string(),
            attempts,
        })
    }

    async fn try_load(
        &self,
        capability: &EngineCapability,
        model: &ModelRef,
    ) -> Result<(Arc<dyn InferenceEngine>, EngineHandle), EngineError> {
        let engine = capability.instantiate()?;

        // On timeout the load future and the engine instance are dropped together,
        // taking any partially acquired resources with them.
        let handle = tokio::time::timeout(self.load_timeout, engine.load(model))
            .await
            .map_err(|_| {
                EngineError::Load(format!(
                    "timed out after {:.1}s",
                    self.load_timeout.as_secs_f64()
                ))
            })??;

        Ok((engine, handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::testing::{scripted_capability, Probe, Script};
    use crate::system::{CpuArch, OsFamily};

    fn host() -> HostProfile {
        HostProfile::new(OsFamily::Linux, CpuArch::X86_64)
    }

    #[tokio::test]
    async fn test_incompatible_variant_never_loaded() {
        let v1 = Probe::new();
        let v2 = Probe::new();
        let registry = EngineRegistry::new()
            .with(scripted_capability("v1", 0, false, Script::default(), &v1))
            .with(scripted_capability("v2", 1, true, Script::default(), &v2));

        let selection = Selector::new(Arc::new(registry))
            .select(&ModelRef::new("m"), &host(), None)
            .await
            .unwrap();

        assert_eq!(selection.capability.name(), "v2");
        assert_eq!(selection.handle.engine(), "v2");
        assert_eq!(v1.loads(), 0);
        assert_eq!(v1.instances.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(v2.loads(), 1);
    }

    #[tokio::test]
    async fn test_falls_through_to_next_ranked_variant() {
        let probe = Probe::new();
        let registry = EngineRegistry::new()
            .with(scripted_capability("v3", 9, true, Script::failing_load("always"), &probe))
            .with(scripted_capability("v1", 0, true, Script::failing_load("bad artifact"), &probe))
            .with(scripted_capability("v2", 1, true, Script::default(), &probe));

        let selection = Selector::new(Arc::new(registry))
            .select(&ModelRef::new("m"), &host(), None)
            .await
            .unwrap();

        assert_eq!(selection.handle.engine(), "v2");
        assert_eq!(probe.events(), vec!["load:v1:m", "load:v2:m"]);
        assert_eq!(
            selection.attempts,
            vec![EngineAttempt {
                engine: "v1".to_string(),
                error: "failed to load model: bad artifact".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_preference_tried_first() {
        let probe = Probe::new();
        let registry = EngineRegistry::new()
            .with(scripted_capability("fast", 0, true, Script::default(), &probe))
            .with(scripted_capability("portable", 5, true, Script::default(), &probe));

        let selection = Selector::new(Arc::new(registry))
            .select(&ModelRef::new("m"), &host(), Some("portable"))
            .await
            .unwrap();

        assert_eq!(selection.capability.name(), "portable");
        assert_eq!(probe.events(), vec!["load:portable:m"]);
    }

    #[tokio::test]
    async fn test_failed_preference_falls_back_once() {
        let probe = Probe::new();
        let registry = EngineRegistry::new()
            .with(scripted_capability("fast", 0, true, Script::default(), &probe))
            .with(scripted_capability("broken", 5, true, Script::failing_load("oom"), &probe));

        let selection = Selector::new(Arc::new(registry))
            .select(&ModelRef::new("m"), &host(), Some("broken"))
            .await
            .unwrap();

        assert_eq!(selection.capability.name(), "fast");
        assert_eq!(probe.events(), vec!["load:broken:m", "load:fast:m"]);
    }

    #[tokio::test]
    async fn test_incompatible_preference_is_reported_not_loaded() {
        let probe = Probe::new();
        let registry = EngineRegistry::new()
            .with(scripted_capability("gpu", 0, false, Script::default(), &probe))
            .with(scripted_capability("cpu", 5, true, Script::default(), &probe));

        let selection = Selector::new(Arc::new(registry))
            .select(&ModelRef::new("m"), &host(), Some("gpu"))
            .await
            .unwrap();

        assert_eq!(selection.capability.name(), "cpu");
        assert_eq!(selection.attempts[0].engine, "gpu");
        assert_eq!(probe.events(), vec!["load:cpu:m"]);
    }

    #[tokio::test]
    async fn test_all_failures_aggregated() {
        let probe = Probe::new();
        let registry = EngineRegistry::new()
            .with(scripted_capability("a", 0, true, Script::failing_load("oom"), &probe))
            .with(scripted_capability("b", 1, true, Script::failing_load("bad file"), &probe));

        let err = Selector::new(Arc::new(registry))
            .select(&ModelRef::new("m"), &host(), None)
            .await
            .unwrap_err();

        assert_eq!(err.attempts.len(), 2);
        assert_eq!(err.attempts[0].engine, "a");
        assert_eq!(err.attempts[1].engine, "b");
        assert!(err.to_string().contains("bad file"));
    }

    #[tokio::test]
    async fn test_empty_registry() {
        let err = Selector::new(Arc::new(EngineRegistry::new()))
            .select(&ModelRef::new("m"), &host(), None)
            .await
            .unwrap_err();
        assert!(err.attempts.is_empty());
        assert!(err.to_string().contains("no registered engine"));
    }

    #[tokio::test]
    async fn test_load_timeout_is_a_failed_attempt() {
        let probe = Probe::new();
        let registry = EngineRegistry::new()
            .with(scripted_capability(
                "stuck",
                0,
                true,
                Script::default().with_load_delay(Duration::from_secs(60)),
                &probe,
            ))
            .with(scripted_capability("ok", 1, true, Script::default(), &probe));

        let selection = Selector::new(Arc::new(registry))
            .with_load_timeout(Duration::from_millis(20))
            .select(&ModelRef::new("m"), &host(), None)
            .await
            .unwrap();

        assert_eq!(selection.capability.name(), "ok");
        assert!(selection.attempts[0].error.contains("timed out"));
        // The stuck engine never got as far as allocating its model
        assert_eq!(probe.resident.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
