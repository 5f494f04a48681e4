//! Worker runner
//!
//! Owns the lifecycle of the one engine instance a worker keeps loaded and
//! serializes load, generate and unload against each other. All transitions go
//! through a single state machine ([`RunnerState`]); engine calls run outside
//! its lock, so a slow generation never blocks new submissions.
//!
//! Engines that can't generate concurrently get a FIFO queue served by one
//! dispatcher task per loaded handle.

mod error;
mod monitor;
mod state;

pub use error::RunnerError;
pub use monitor::{
    ChannelSink, MonitorSink, NullSink, TelemetryEvent, TelemetryRecord, TracingSink,
};
pub use state::RunnerState;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Notify};

use crate::inference::{
    capability, token_channel, CancelHandle, EngineError, EngineHandle, EngineRegistry,
    FinishReason, InferenceEngine, NoCompatibleEngine, Selection, Selector, TokenSender,
    TokenStream,
};
use crate::system::HostProfile;
use crate::types::{GenerationRequest, ModelRef, RequestId, RunnerConfig, UnloadPolicy};
use state::{LoadPlan, Loaded, Machine};

/// An admitted generation request
pub(crate) struct Job {
    id: RequestId,
    request: GenerationRequest,
    sink: TokenSender,
    engine: Arc<dyn InferenceEngine>,
    handle: Arc<EngineHandle>,
}

/// Per-worker control unit; cheap to clone, all clones share one state machine
#[derive(Clone)]
pub struct Runner {
    core: Arc<Core>,
}

struct Core {
    registry: Arc<EngineRegistry>,
    host: HostProfile,
    config: RunnerConfig,
    selector: Selector,
    monitor: Arc<dyn MonitorSink>,
    machine: Mutex<Machine>,
    /// Signalled when the last in-flight request finishes
    idle: Notify,
    failures: AtomicU64,
}

impl Runner {
    pub fn new(
        registry: Arc<EngineRegistry>,
        host: HostProfile,
        config: RunnerConfig,
        monitor: Arc<dyn MonitorSink>,
    ) -> Self {
        let selector = Selector::new(registry.clone()).with_load_timeout(config.load_timeout);
        let machine = Mutex::new(Machine::new(config.cancel_history));

        Self {
            core: Arc::new(Core {
                registry,
                host,
                config,
                selector,
                monitor,
                machine,
                idle: Notify::new(),
                failures: AtomicU64::new(0),
            }),
        }
    }

    /// Runner over the process-wide registry and the detected host
    pub fn with_config(config: RunnerConfig) -> Self {
        Self::new(
            capability::global(),
            HostProfile::current().clone(),
            config,
            Arc::new(TracingSink),
        )
    }

    pub fn host(&self) -> &HostProfile {
        &self.core.host
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.core.config
    }

    pub fn status(&self) -> RunnerState {
        self.core.machine().snapshot()
    }

    /// Loads `model`, replacing whatever model is active
    ///
    /// `preference` names an engine variant to try first; without one the
    /// configured preference applies. Loading the model that is already active
    /// is a no-op.
    pub async fn load_model(
        &self,
        model: ModelRef,
        preference: Option<&str>,
    ) -> Result<(), RunnerError> {
        let core = &self.core;

        let has_engine = !core.registry.compatible(&core.host).is_empty();
        let plan = core.machine().begin_load(&model, has_engine);
        let plan = match plan {
            Ok(LoadPlan::AlreadyLoaded) => {
                tracing::debug!("Model '{}' is already loaded", model);
                return Ok(());
            }
            Ok(plan) => plan,
            Err(RunnerError::NoCompatibleEngine(err)) => {
                core.load_failed(&err);
                return Err(err.into());
            }
            Err(e) => {
                tracing::warn!("Load of '{}' rejected: {}", model, e);
                return Err(e);
            }
        };

        let preference = preference
            .map(str::to_string)
            .or_else(|| core.config.preferred_engine.clone());

        // Detached so the machine always leaves `Loading`, even if the caller stops waiting
        let task = tokio::spawn(core.clone().complete_load(model, plan, preference));
        match task.await {
            Ok(result) => result,
            Err(e) => Err(core.fatal(format!("load task failed: {}", e))),
        }
    }

    /// Submits a generation request and returns its token stream
    ///
    /// Dropping the stream cancels the request.
    pub async fn generate(
        &self,
        id: impl Into<RequestId>,
        request: GenerationRequest,
    ) -> Result<TokenStream, RunnerError> {
        let id = id.into();
        let core = &self.core;
        let deadline = request.timeout.or(core.config.generation_timeout);

        let (job, stream, queue) = {
            let mut machine = core.machine();
            let lease = match machine.begin_generate(&id) {
                Ok(lease) => lease,
                Err(e) => {
                    tracing::warn!("Request {} rejected: {}", id, e);
                    return Err(e);
                }
            };

            let (sink, stream) =
                token_channel(id.clone(), lease.engine.name(), core.config.channel_capacity);
            machine.track(id.clone(), stream.cancel_handle());

            let Loaded {
                engine,
                handle,
                queue,
                ..
            } = lease;
            let job = Job {
                id: id.clone(),
                request,
                sink,
                engine,
                handle,
            };
            (job, stream, queue)
        };

        if let Some(deadline) = deadline {
            watch_deadline(id.clone(), stream.cancel_handle(), deadline);
        }
        tracing::debug!("Request {} admitted", id);

        match queue {
            Some(queue) => {
                if let Err(mpsc::error::SendError(job)) = queue.send(job) {
                    drop(job);
                    core.finish(&id);
                    return Err(core.fatal("request queue closed".to_string()));
                }
            }
            None => {
                let core = core.clone();
                tokio::spawn(async move { core.run_job(job).await });
            }
        }

        Ok(stream)
    }

    /// Cancels an in-flight request; cancelling a finished one is a no-op
    pub fn cancel(&self, id: &RequestId) -> Result<(), RunnerError> {
        if self.core.machine().cancel(id)? {
            tracing::info!("Request {} cancelled", id);
        } else {
            tracing::debug!("Request {} already closed", id);
        }
        Ok(())
    }

    /// Unloads the active model
    ///
    /// While requests are streaming this returns `Busy`, or under
    /// [`UnloadPolicy::Wait`] waits up to `unload_wait` for them to finish.
    pub async fn unload(&self) -> Result<(), RunnerError> {
        let core = &self.core;
        let begun = match core.config.unload_policy {
            UnloadPolicy::Reject => core.begin_unload(),
            UnloadPolicy::Wait => core.begin_unload_when_idle(core.config.unload_wait).await,
        };

        match begun {
            Ok(Some(loaded)) => self.complete_unload(loaded).await,
            Ok(None) => Ok(()),
            Err(e) => {
                tracing::warn!("Unload rejected: {}", e);
                Err(e)
            }
        }
    }

    /// Cancels every in-flight request, waits for them to wind down, then unloads
    pub async fn shutdown(&self) -> Result<(), RunnerError> {
        let core = &self.core;
        let cancelled = core.machine().cancel_all();
        if cancelled > 0 {
            tracing::info!("Shutdown cancelled {} in-flight requests", cancelled);
        }

        match core.begin_unload_when_idle(core.config.unload_wait).await? {
            Some(loaded) => self.complete_unload(loaded).await,
            None => Ok(()),
        }
    }

    async fn complete_unload(&self, loaded: Loaded) -> Result<(), RunnerError> {
        let core = self.core.clone();
        let task = tokio::spawn(async move {
            let result = core.release(loaded).await;
            match &result {
                Ok(()) => core.machine().finish_unload(),
                Err(e) => core.machine().fail(format!("unload failed: {}", e)),
            }
            result
        });

        match task.await {
            Ok(result) => result,
            Err(e) => Err(self.core.fatal(format!("unload task failed: {}", e))),
        }
    }
}

fn watch_deadline(id: RequestId, cancel: CancelHandle, deadline: Duration) {
    tokio::spawn(async move {
        if tokio::time::timeout(deadline, cancel.closed()).await.is_err() && cancel.cancel() {
            tracing::warn!(
                "Request {} exceeded its {:.1}s deadline, cancelling",
                id,
                deadline.as_secs_f64()
            );
        }
    });
}

/// Runs queued jobs one at a time, in arrival order
async fn serve_queue(core: Weak<Core>, mut queue: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = queue.recv().await {
        let Some(core) = core.upgrade() else {
            break;
        };
        core.run_job(job).await;
    }
    tracing::debug!("Request queue closed");
}

impl Core {
    fn machine(&self) -> MutexGuard<'_, Machine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, event: TelemetryEvent) {
        self.monitor.record(&event);
    }

    fn fatal(&self, reason: String) -> RunnerError {
        tracing::error!("{}", reason);
        self.machine().fail(reason.clone());
        RunnerError::Fatal(reason)
    }

    fn load_failed(&self, err: &NoCompatibleEngine) {
        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::error!("{}", err);
        self.record(TelemetryEvent::ModelLoadFailed {
            model: err.model.clone(),
            attempts: err.attempts.clone(),
            failures,
        });
    }

    async fn complete_load(
        self: Arc<Self>,
        model: ModelRef,
        plan: LoadPlan,
        preference: Option<String>,
    ) -> Result<(), RunnerError> {
        if let LoadPlan::Replace(previous) = plan {
            tracing::info!("Switching from '{}' to '{}'", previous.model(), model);
            if let Err(e) = self.release(previous).await {
                tracing::error!("Could not unload previous model: {}", e);
                self.machine()
                    .fail(format!("unload before switching failed: {}", e));
                return Err(e);
            }
        }

        let started = Instant::now();
        let selected = self
            .selector
            .select(&model, &self.host, preference.as_deref())
            .await;

        match selected {
            Ok(selection) => {
                let fallbacks = selection.attempts.len();
                let loaded = self.activate(selection);
                let event = TelemetryEvent::ModelLoaded {
                    model: model.id().to_string(),
                    engine: loaded.capability.clone(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    fallbacks,
                };
                self.machine().finish_load(loaded);
                self.record(event);
                Ok(())
            }
            Err(err) => {
                if err.attempts.is_empty() {
                    self.machine().reset();
                } else {
                    self.machine().fail(err.to_string());
                }
                self.load_failed(&err);
                Err(err.into())
            }
        }
    }

    fn activate(self: &Arc<Self>, selection: Selection) -> Loaded {
        let Selection {
            capability,
            engine,
            handle,
            ..
        } = selection;

        let queue = if engine.supports_concurrent_generation() {
            None
        } else {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(serve_queue(Arc::downgrade(self), rx));
            Some(tx)
        };

        Loaded {
            capability: capability.name().to_string(),
            engine,
            handle: Arc::new(handle),
            queue,
        }
    }

    /// Unloads a handle taken out of the machine
    async fn release(&self, loaded: Loaded) -> Result<(), RunnerError> {
        let Loaded {
            capability,
            engine,
            handle,
            queue,
        } = loaded;
        // Stops the dispatcher; nothing is queued since the runner was idle
        drop(queue);

        let handle = Arc::try_unwrap(handle).map_err(|_| {
            RunnerError::Fatal(format!("handle on '{}' is still in use", capability))
        })?;
        let model = handle.model().id().to_string();
        tracing::info!("Unloading '{}' from '{}'", model, capability);

        tokio::time::timeout(self.config.load_timeout, engine.unload(handle))
            .await
            .map_err(|_| {
                EngineError::Worker(format!(
                    "unload timed out after {:.1}s",
                    self.config.load_timeout.as_secs_f64()
                ))
            })??;

        self.record(TelemetryEvent::ModelUnloaded {
            model,
            engine: capability,
        });
        Ok(())
    }

    fn begin_unload(&self) -> Result<Option<Loaded>, RunnerError> {
        self.machine().begin_unload()
    }

    /// `begin_unload` once no request is streaming, or `Busy` after `within`
    async fn begin_unload_when_idle(
        &self,
        within: Duration,
    ) -> Result<Option<Loaded>, RunnerError> {
        let deadline = tokio::time::Instant::now() + within;

        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut machine = self.machine();
                if !machine.is_generating() {
                    return machine.begin_unload();
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.begin_unload();
            }
        }
    }

    fn finish(&self, id: &RequestId) {
        let idle = self.machine().finish_request(id);
        if idle {
            self.idle.notify_waiters();
        }
    }

    async fn run_job(&self, job: Job) {
        let Job {
            id,
            request,
            sink,
            engine,
            handle,
        } = job;
        let engine_name = engine.name().to_string();
        let started = Instant::now();

        let result = if sink.is_cancelled() {
            tracing::debug!("Request {} cancelled before it started", id);
            drop(handle);
            Ok(())
        } else {
            // Own task so a panicking engine fails just this request
            let task_sink = sink.clone();
            let task =
                tokio::spawn(async move { engine.generate(&handle, request, task_sink).await });
            // The task owns the handle; it is unshared again once the task is gone
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!("Engine '{}' crashed on request {}: {}", engine_name, id, e);
                    Err(EngineError::Worker(format!("generation task failed: {}", e)))
                }
            }
        };

        let elapsed = started.elapsed();
        let tokens = sink.text_chunks();
        let completed = |finish_reason: FinishReason| TelemetryEvent::RequestCompleted {
            request_id: id.clone(),
            engine: engine_name.clone(),
            tokens,
            tokens_per_sec: tokens_per_sec(tokens, elapsed),
            finish_reason,
        };

        let event = if result.is_ok() && sink.is_finished() {
            completed(sink.finish_reason())
        } else if sink.is_cancelled() && !sink.is_finished() {
            TelemetryEvent::RequestCancelled {
                request_id: id.clone(),
                engine: engine_name.clone(),
                tokens,
            }
        } else {
            match result {
                Err(e) => {
                    let _ = sink.finish(FinishReason::Error).await;
                    TelemetryEvent::RequestFailed {
                        request_id: id.clone(),
                        engine: engine_name.clone(),
                        reason: e.to_string(),
                        failures: self.failures.fetch_add(1, Ordering::SeqCst) + 1,
                    }
                }
                Ok(()) => {
                    tracing::warn!(
                        "Engine '{}' ended request {} without a finish reason",
                        engine_name,
                        id
                    );
                    let _ = sink.finish(FinishReason::Stop).await;
                    completed(FinishReason::Stop)
                }
            }
        };

        self.finish(&id);
        self.record(event);
    }
}

fn tokens_per_sec(tokens: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        tokens as f64 / secs
    } else {
        0.0
    }
}
