//! Runner state machine
//!
//! Every load, generate and unload transition is checked and applied here,
//! under the runner's single lock. Methods never await; the slow work
//! (engine calls) happens between a `begin_*` and its matching `finish_*`.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use super::error::RunnerError;
use super::Job;
use crate::inference::{CancelHandle, EngineHandle, InferenceEngine, NoCompatibleEngine};
use crate::types::{ModelRef, RequestId};

/// Read-only view of the runner, for health reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunnerState {
    Unloaded,
    Loading {
        model: ModelRef,
    },
    Ready {
        model: ModelRef,
        engine: String,
    },
    Generating {
        model: ModelRef,
        engine: String,
        requests: Vec<RequestId>,
    },
    Unloading {
        model: ModelRef,
    },
    Failed {
        reason: String,
    },
}

impl RunnerState {
    pub fn name(&self) -> &'static str {
        match self {
            RunnerState::Unloaded => "unloaded",
            RunnerState::Loading { .. } => "loading",
            RunnerState::Ready { .. } => "ready",
            RunnerState::Generating { .. } => "generating",
            RunnerState::Unloading { .. } => "unloading",
            RunnerState::Failed { .. } => "failed",
        }
    }

    /// Model currently loaded or being loaded
    pub fn model(&self) -> Option<&ModelRef> {
        match self {
            RunnerState::Loading { model }
            | RunnerState::Ready { model, .. }
            | RunnerState::Generating { model, .. }
            | RunnerState::Unloading { model } => Some(model),
            RunnerState::Unloaded | RunnerState::Failed { .. } => None,
        }
    }
}

/// The active engine and its handle
#[derive(Clone)]
pub(crate) struct Loaded {
    pub capability: String,
    pub engine: Arc<dyn InferenceEngine>,
    pub handle: Arc<EngineHandle>,
    /// FIFO queue for engines that generate one request at a time
    pub queue: Option<mpsc::UnboundedSender<Job>>,
}

impl Loaded {
    pub fn model(&self) -> &ModelRef {
        self.handle.model()
    }
}

enum Phase {
    Unloaded,
    Loading(ModelRef),
    Ready(Loaded),
    Generating(Loaded, BTreeSet<RequestId>),
    Unloading(ModelRef),
    Failed(String),
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Unloaded => "unloaded",
            Phase::Loading(_) => "loading",
            Phase::Ready(_) => "ready",
            Phase::Generating(..) => "generating",
            Phase::Unloading(_) => "unloading",
            Phase::Failed(_) => "failed",
        }
    }
}

/// What `load_model` has to do after the transition into `Loading`
pub(crate) enum LoadPlan {
    Fresh,
    /// The requested model is already active
    AlreadyLoaded,
    /// Unload this first
    Replace(Loaded),
}

pub(crate) struct Machine {
    phase: Phase,
    /// Cancellation handles of requests admitted and not yet finished
    requests: HashMap<RequestId, CancelHandle>,
    /// Finished or cancelled ids, so repeated cancels stay successful
    closed: VecDeque<RequestId>,
    history: usize,
}

impl Machine {
    pub fn new(history: usize) -> Self {
        Self {
            phase: Phase::Unloaded,
            requests: HashMap::new(),
            closed: VecDeque::new(),
            history,
        }
    }

    fn busy(&self, operation: &'static str) -> RunnerError {
        RunnerError::Busy {
            operation,
            state: self.phase.name(),
        }
    }

    fn take(&mut self) -> Phase {
        std::mem::replace(&mut self.phase, Phase::Unloaded)
    }

    pub fn is_generating(&self) -> bool {
        matches!(self.phase, Phase::Generating(..))
    }

    /// `has_engine` is false when no registered engine runs on this host; the
    /// load is then refused without leaving the current state.
    pub fn begin_load(
        &mut self,
        model: &ModelRef,
        has_engine: bool,
    ) -> Result<LoadPlan, RunnerError> {
        match self.take() {
            Phase::Ready(loaded) if loaded.model() == model => {
                self.phase = Phase::Ready(loaded);
                Ok(LoadPlan::AlreadyLoaded)
            }
            phase @ (Phase::Unloaded | Phase::Failed(_) | Phase::Ready(_)) if !has_engine => {
                self.phase = phase;
                Err(NoCompatibleEngine {
                    model: model.id().to_string(),
                    attempts: Vec::new(),
                }
                .into())
            }
            Phase::Unloaded | Phase::Failed(_) => {
                self.phase = Phase::Loading(model.clone());
                Ok(LoadPlan::Fresh)
            }
            Phase::Ready(loaded) => {
                self.phase = Phase::Loading(model.clone());
                Ok(LoadPlan::Replace(loaded))
            }
            other => {
                self.phase = other;
                Err(self.busy("load"))
            }
        }
    }

    pub fn finish_load(&mut self, loaded: Loaded) {
        self.phase = Phase::Ready(loaded);
    }

    /// Back to `Unloaded` without a failure reason
    pub fn reset(&mut self) {
        self.phase = Phase::Unloaded;
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.phase = Phase::Failed(reason.into());
    }

    /// Admits a request, returning the engine it runs on
    pub fn begin_generate(&mut self, id: &RequestId) -> Result<Loaded, RunnerError> {
        if self.requests.contains_key(id) {
            return Err(self.busy("generate"));
        }

        match self.take() {
            Phase::Ready(loaded) => {
                let lease = loaded.clone();
                self.phase = Phase::Generating(loaded, BTreeSet::from([id.clone()]));
                Ok(lease)
            }
            Phase::Generating(loaded, mut active) => {
                let lease = loaded.clone();
                active.insert(id.clone());
                self.phase = Phase::Generating(loaded, active);
                Ok(lease)
            }
            other @ (Phase::Unloaded | Phase::Failed(_)) => {
                self.phase = other;
                Err(RunnerError::NotReady)
            }
            other => {
                self.phase = other;
                Err(self.busy("generate"))
            }
        }
    }

    /// Registers the consumer's cancellation handle for an admitted request
    pub fn track(&mut self, id: RequestId, cancel: CancelHandle) {
        self.requests.insert(id, cancel);
    }

    /// Returns `true` when this was the last active request
    pub fn finish_request(&mut self, id: &RequestId) -> bool {
        if self.requests.remove(id).is_some() {
            self.remember(id.clone());
        }

        match self.take() {
            Phase::Generating(loaded, mut active) => {
                active.remove(id);
                if active.is_empty() {
                    self.phase = Phase::Ready(loaded);
                    true
                } else {
                    self.phase = Phase::Generating(loaded, active);
                    false
                }
            }
            other => {
                self.phase = other;
                false
            }
        }
    }

    fn remember(&mut self, id: RequestId) {
        if self.history == 0 {
            return;
        }
        if self.closed.len() >= self.history {
            self.closed.pop_front();
        }
        self.closed.push_back(id);
    }

    /// `Ok(true)` if the request was cancelled now, `Ok(false)` if it already ended
    pub fn cancel(&mut self, id: &RequestId) -> Result<bool, RunnerError> {
        if let Some(handle) = self.requests.get(id) {
            return Ok(handle.cancel());
        }
        if self.closed.contains(id) {
            return Ok(false);
        }
        Err(RunnerError::NotFound(id.clone()))
    }

    /// Cancels every admitted request; returns how many were still running
    pub fn cancel_all(&mut self) -> usize {
        self.requests.values().filter(|handle| handle.cancel()).count()
    }

    /// `Ok(None)` when there is nothing to unload
    pub fn begin_unload(&mut self) -> Result<Option<Loaded>, RunnerError> {
        match self.take() {
            Phase::Ready(loaded) => {
                self.phase = Phase::Unloading(loaded.model().clone());
                Ok(Some(loaded))
            }
            Phase::Unloaded | Phase::Failed(_) => Ok(None),
            other => {
                self.phase = other;
                Err(self.busy("unload"))
            }
        }
    }

    pub fn finish_unload(&mut self) {
        self.phase = Phase::Unloaded;
    }

    pub fn snapshot(&self) -> RunnerState {
        match &self.phase {
            Phase::Unloaded => RunnerState::Unloaded,
            Phase::Loading(model) => RunnerState::Loading {
                model: model.clone(),
            },
            Phase::Ready(loaded) => RunnerState::Ready {
                model: loaded.model().clone(),
                engine: loaded.capability.clone(),
            },
            Phase::Generating(loaded, active) => RunnerState::Generating {
                model: loaded.model().clone(),
                engine: loaded.capability.clone(),
                requests: active.iter().cloned().collect(),
            },
            Phase::Unloading(model) => RunnerState::Unloading {
                model: model.clone(),
            },
            Phase::Failed(reason) => RunnerState::Failed {
                reason: reason.clone(),
            },
        }
    }
}
