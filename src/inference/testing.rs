//! Scripted engine for tests
//!
//! Produces a fixed token sequence and records everything it is asked to do
//! in a shared [`Probe`].

use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::inference::capability::EngineCapability;
use crate::inference::engine::{EngineError, EngineHandle, HandleId, InferenceEngine};
use crate::inference::streaming::{FinishReason, TokenSender};
use crate::system::HostProfile;
use crate::types::{GenerationRequest, ModelInfo, ModelRef};

pub(crate) const FAIL_LOAD_PARAM: &str = "fail_load";

/// Shared record of what scripted engines did
#[derive(Debug, Default)]
pub(crate) struct Probe {
    events: Mutex<Vec<String>>,
    pub instances: AtomicUsize,
    pub loads: AtomicUsize,
    pub unloads: AtomicUsize,
    /// Models currently resident
    pub resident: AtomicIsize,
    /// Per-request generation state currently allocated
    pub live_requests: AtomicIsize,
    pub max_parallel: AtomicIsize,
}

impl Probe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn log(&self, event: impl Into<String>) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn events_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.starts_with(prefix))
            .collect()
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unloads(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }

    pub fn live_requests(&self) -> isize {
        self.live_requests.load(Ordering::SeqCst)
    }

    fn acquire_request(self: &Arc<Self>) -> RequestGuard {
        let now = self.live_requests.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_parallel.fetch_max(now, Ordering::SeqCst);
        RequestGuard(self.clone())
    }
}

struct RequestGuard(Arc<Probe>);

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.0.live_requests.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Behaviour of a scripted engine
#[derive(Debug, Clone)]
pub(crate) struct Script {
    pub tokens: Vec<String>,
    pub fail_load: Option<String>,
    pub load_delay: Duration,
    pub step_delay: Duration,
    pub concurrent: bool,
    /// Fail with a generation error before emitting this token index
    pub fail_at: Option<usize>,
    /// Panic before emitting this token index
    pub panic_at: Option<usize>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            tokens: vec!["Hello".to_string(), ",".to_string(), " world".to_string()],
            fail_load: None,
            load_delay: Duration::ZERO,
            step_delay: Duration::ZERO,
            concurrent: false,
            fail_at: None,
            panic_at: None,
        }
    }
}

impl Script {
    /// `count` tokens named `t0`, `t1`, ...
    pub fn counting(count: usize) -> Self {
        Self {
            tokens: (0..count).map(|i| format!("t{}", i)).collect(),
            ..Self::default()
        }
    }

    pub fn failing_load(reason: &str) -> Self {
        Self {
            fail_load: Some(reason.to_string()),
            ..Self::default()
        }
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn concurrent(mut self) -> Self {
        self.concurrent = true;
        self
    }

    pub fn failing_at(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }

    pub fn panicking_at(mut self, index: usize) -> Self {
        self.panic_at = Some(index);
        self
    }
}

pub(crate) struct ScriptedEngine {
    name: String,
    script: Script,
    probe: Arc<Probe>,
    loaded: Mutex<Option<HandleId>>,
}

impl ScriptedEngine {
    pub fn new(name: &str, script: Script, probe: Arc<Probe>) -> Self {
        probe.instances.fetch_add(1, Ordering::SeqCst);
        Self {
            name: name.to_string(),
            script,
            probe,
            loaded: Mutex::new(None),
        }
    }

    fn loaded(&self) -> Option<HandleId> {
        *self.loaded.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        if self.loaded() == Some(handle.id()) {
            Ok(())
        } else {
            Err(EngineError::StaleHandle(handle.id()))
        }
    }
}

#[async_trait]
impl InferenceEngine for ScriptedEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_concurrent_generation(&self) -> bool {
        self.script.concurrent
    }

    async fn load(&self, model: &ModelRef) -> Result<EngineHandle, EngineError> {
        self.probe.log(format!("load:{}:{}", self.name, model.id()));
        self.probe.loads.fetch_add(1, Ordering::SeqCst);

        if !self.script.load_delay.is_zero() {
            tokio::time::sleep(self.script.load_delay).await;
        }
        // A `fail_load` model param fails just that model
        let failure = self
            .script
            .fail_load
            .clone()
            .or_else(|| model.param(FAIL_LOAD_PARAM).map(str::to_string));
        if let Some(reason) = failure {
            return Err(EngineError::Load(reason));
        }

        let info = ModelInfo {
            name: model.id().to_string(),
            path: model.path().display().to_string(),
            ..ModelInfo::default()
        };
        let handle = EngineHandle::new(&self.name, model.clone(), info);
        *self.loaded.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle.id());
        self.probe.resident.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    async fn generate(
        &self,
        handle: &EngineHandle,
        request: GenerationRequest,
        sink: TokenSender,
    ) -> Result<(), EngineError> {
        self.check(handle)?;
        let _state = self.probe.acquire_request();
        let id = sink.request_id().clone();
        let budget = request.max_tokens as usize;

        for (i, token) in self.script.tokens.iter().take(budget).enumerate() {
            if sink.is_cancelled() {
                self.probe.log(format!("cancelled:{}", id));
                return Ok(());
            }
            if self.script.fail_at == Some(i) {
                return Err(EngineError::Generation("scripted failure".to_string()));
            }
            if self.script.panic_at == Some(i) {
                panic!("scripted panic in request {}", id);
            }
            if !self.script.step_delay.is_zero() {
                tokio::time::sleep(self.script.step_delay).await;
            }
            self.probe.log(format!("chunk:{}:{}", id, i));
            if sink.send_text(token.as_str()).await.is_err() {
                self.probe.log(format!("cancelled:{}", id));
                return Ok(());
            }
        }

        let reason = if self.script.tokens.len() > budget {
            FinishReason::Length
        } else {
            FinishReason::Stop
        };
        self.probe.log(format!("finish:{}", id));
        let _ = sink.finish(reason).await;
        Ok(())
    }

    async fn unload(&self, handle: EngineHandle) -> Result<(), EngineError> {
        self.check(&handle)?;
        *self.loaded.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.probe.unloads.fetch_add(1, Ordering::SeqCst);
        self.probe.resident.fetch_sub(1, Ordering::SeqCst);
        self.probe
            .log(format!("unload:{}:{}", self.name, handle.model().id()));
        Ok(())
    }
}

pub(crate) fn scripted_capability(
    name: &str,
    rank: u32,
    compatible: bool,
    script: Script,
    probe: &Arc<Probe>,
) -> EngineCapability {
    let engine_name = name.to_string();
    let probe = probe.clone();
    EngineCapability::new(
        name,
        rank,
        move |_host: &HostProfile| compatible,
        move || {
            let engine: Arc<dyn InferenceEngine> =
                Arc::new(ScriptedEngine::new(&engine_name, script.clone(), probe.clone()));
            Ok(engine)
        },
    )
}
