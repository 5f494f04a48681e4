//! llama.cpp engine variants
//!
//! `LlamaModel` and `LlamaContext` are not `Send`, so every engine instance
//! owns a dedicated worker thread that holds the native model and runs all
//! llama.cpp calls. The async side talks to it over a command channel and gets
//! answers back on oneshot channels.
//!
//! Two variants share this implementation:
//! - `llama-accelerated` offloads every layer to Metal or CUDA
//! - `llama-portable` keeps everything on the CPU and runs anywhere llama.cpp does

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use async_trait::async_trait;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use once_cell::sync::OnceCell;
use tokio::sync::oneshot;

use crate::inference::capability::EngineCapability;
use crate::inference::engine::{EngineError, EngineHandle, HandleId, InferenceEngine};
use crate::inference::model::validate_gguf;
use crate::inference::streaming::{FinishReason, TokenSender, Utf8Assembler};
use crate::system::{HostProfile, NativeComponent};
use crate::types::model::{PARAM_CONTEXT_LENGTH, PARAM_GPU_LAYERS};
use crate::types::{GenerationRequest, ModelInfo, ModelRef, SamplingParams, StopSequences};

pub const ACCELERATED: &str = "llama-accelerated";
pub const PORTABLE: &str = "llama-portable";

/// llama.cpp clamps this to the model's layer count
const ALL_LAYERS: u32 = 999;
const DEFAULT_CONTEXT: u32 = 4096;
const MIN_CONTEXT: u32 = 512;
const BATCH_SIZE: usize = 512;

/// llama.cpp may only be initialised once per process
static BACKEND: OnceCell<LlamaBackend> = OnceCell::new();

fn backend() -> Result<&'static LlamaBackend, EngineError> {
    BACKEND.get_or_try_init(|| {
        tracing::info!("Initializing llama.cpp backend");
        LlamaBackend::init()
            .map_err(|e| EngineError::Load(format!("failed to initialize backend: {}", e)))
    })
}

/// Where model layers live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Offload {
    Gpu,
    Cpu,
}

/// Requests handled by the worker thread
enum WorkerCommand {
    Load {
        id: HandleId,
        path: PathBuf,
        gpu_layers: u32,
        context_length: Option<u32>,
        reply: oneshot::Sender<Result<ModelInfo, EngineError>>,
    },
    Generate {
        id: HandleId,
        request: GenerationRequest,
        sink: TokenSender,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Unload {
        id: HandleId,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Shutdown,
}

/// A llama.cpp engine instance and its worker thread
pub struct LlamaEngine {
    name: &'static str,
    offload: Offload,
    commands: Sender<WorkerCommand>,
}

impl LlamaEngine {
    /// Engine that puts every layer on the GPU unless the model says otherwise
    pub fn accelerated() -> Result<Self, EngineError> {
        Self::spawn(ACCELERATED, Offload::Gpu)
    }

    /// CPU-only engine
    pub fn portable() -> Result<Self, EngineError> {
        Self::spawn(PORTABLE, Offload::Cpu)
    }

    fn spawn(name: &'static str, offload: Offload) -> Result<Self, EngineError> {
        let (commands, inbox) = mpsc::channel();

        thread::Builder::new()
            .name(format!("{}-worker", name))
            .spawn(move || worker_loop(inbox))
            .map_err(|e| EngineError::Worker(format!("failed to spawn worker thread: {}", e)))?;

        tracing::debug!("Started {} worker thread", name);
        Ok(Self {
            name,
            offload,
            commands,
        })
    }

    fn gpu_layers(&self, model: &ModelRef) -> u32 {
        match self.offload {
            Offload::Cpu => 0,
            Offload::Gpu => model.param_as(PARAM_GPU_LAYERS).unwrap_or(ALL_LAYERS),
        }
    }

    fn send(&self, command: WorkerCommand) -> Result<(), EngineError> {
        self.commands
            .send(command)
            .map_err(|_| EngineError::Worker(format!("{} worker has stopped", self.name)))
    }

    fn worker_gone(&self) -> EngineError {
        EngineError::Worker(format!("{} worker exited before replying", self.name))
    }
}

impl Drop for LlamaEngine {
    fn drop(&mut self) {
        // The worker drops any resident model on its way out
        let _ = self.commands.send(WorkerCommand::Shutdown);
    }
}

#[async_trait]
impl InferenceEngine for LlamaEngine {
    fn name(&self) -> &str {
        self.name
    }

    async fn load(&self, model: &ModelRef) -> Result<EngineHandle, EngineError> {
        let id = HandleId::next();
        let (reply, response) = oneshot::channel();

        self.send(WorkerCommand::Load {
            id,
            path: model.path(),
            gpu_layers: self.gpu_layers(model),
            context_length: model.param_as(PARAM_CONTEXT_LENGTH),
            reply,
        })?;

        let info = response.await.map_err(|_| self.worker_gone())??;
        Ok(EngineHandle::with_id(id, self.name, model.clone(), info))
    }

    async fn generate(
        &self,
        handle: &EngineHandle,
        request: GenerationRequest,
        sink: TokenSender,
    ) -> Result<(), EngineError> {
        let (reply, response) = oneshot::channel();
        self.send(WorkerCommand::Generate {
            id: handle.id(),
            request,
            sink,
            reply,
        })?;
        response.await.map_err(|_| self.worker_gone())?
    }

    async fn unload(&self, handle: EngineHandle) -> Result<(), EngineError> {
        let (reply, response) = oneshot::channel();
        self.send(WorkerCommand::Unload {
            id: handle.id(),
            reply,
        })?;
        response.await.map_err(|_| self.worker_gone())?
    }
}

/// The model owned by a worker thread
struct Resident {
    id: HandleId,
    model: LlamaModel,
    context_length: u32,
}

fn worker_loop(inbox: Receiver<WorkerCommand>) {
    let mut resident: Option<Resident> = None;

    while let Ok(command) = inbox.recv() {
        match command {
            WorkerCommand::Load {
                id,
                path,
                gpu_layers,
                context_length,
                reply,
            } => {
                if resident.is_some() {
                    let _ = reply.send(Err(EngineError::Load(
                        "engine already holds a model".to_string(),
                    )));
                    continue;
                }

                match load_resident(id, &path, gpu_layers, context_length) {
                    Ok((loaded, info)) => {
                        if reply.send(Ok(info)).is_ok() {
                            resident = Some(loaded);
                        } else {
                            // Caller gave up (timeout); don't keep a model nobody owns
                            tracing::warn!("Load of {} abandoned, releasing model", path.display());
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to load {}: {}", path.display(), e);
                        let _ = reply.send(Err(e));
                    }
                }
            }
            WorkerCommand::Generate {
                id,
                request,
                sink,
                reply,
            } => {
                let result = match &resident {
                    Some(loaded) if loaded.id == id => run_generation(loaded, &request, &sink),
                    _ => Err(EngineError::StaleHandle(id)),
                };
                let _ = reply.send(result);
            }
            WorkerCommand::Unload { id, reply } => {
                let result = match &resident {
                    Some(loaded) if loaded.id == id => {
                        resident = None;
                        tracing::info!("Model {} unloaded", id);
                        Ok(())
                    }
                    _ => Err(EngineError::StaleHandle(id)),
                };
                let _ = reply.send(result);
            }
            WorkerCommand::Shutdown => break,
        }
    }

    tracing::debug!("llama.cpp worker exiting");
}

fn load_resident(
    id: HandleId,
    path: &Path,
    gpu_layers: u32,
    context_length: Option<u32>,
) -> Result<(Resident, ModelInfo), EngineError> {
    let header = validate_gguf(path)?;
    tracing::debug!(
        "GGUF v{} with {} tensors at {}",
        header.version,
        header.tensor_count,
        path.display()
    );

    let backend = backend()?;
    let params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);

    tracing::info!("Loading {} with {} GPU layers", path.display(), gpu_layers);
    let model = LlamaModel::load_from_file(backend, path, &params)
        .map_err(|e| EngineError::Load(e.to_string()))?;

    let trained = model.n_ctx_train().max(MIN_CONTEXT);
    let context_length = context_length
        .unwrap_or(DEFAULT_CONTEXT)
        .clamp(MIN_CONTEXT, trained);

    let info = ModelInfo {
        name: path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        path: path.display().to_string(),
        size_bytes: model.size() as u64,
        parameters: Some(model.n_params() as u64),
        context_length,
    };
    tracing::info!(
        "Model loaded: {} ({} params, {} token context)",
        info.name,
        model.n_params(),
        context_length
    );

    Ok((
        Resident {
            id,
            model,
            context_length,
        },
        info,
    ))
}

fn generation_error(what: &str, e: impl std::fmt::Display) -> EngineError {
    EngineError::Generation(format!("{}: {}", what, e))
}

fn run_generation(
    resident: &Resident,
    request: &GenerationRequest,
    sink: &TokenSender,
) -> Result<(), EngineError> {
    let backend = backend()?;
    let model = &resident.model;

    let prompt = if request.raw_prompt {
        request.prompt.clone()
    } else {
        match build_chat_prompt(model, &request.prompt) {
            Ok(chat_prompt) => chat_prompt,
            Err(error) => {
                tracing::warn!("Chat template not applied: {error}");
                request.prompt.clone()
            }
        }
    };

    let n_ctx = NonZeroU32::new(resident.context_length)
        .ok_or_else(|| EngineError::Generation("context length is zero".to_string()))?;
    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(Some(n_ctx))
        .with_n_batch(BATCH_SIZE as u32);

    // Per-request state: dropped when this function returns, cancelled or not
    let mut ctx = model
        .new_context(backend, ctx_params)
        .map_err(|e| generation_error("failed to create context", e))?;

    let tokens = model
        .str_to_token(&prompt, AddBos::Always)
        .map_err(|e| generation_error("failed to tokenize", e))?;

    if tokens.is_empty() {
        return Err(EngineError::Generation("prompt produced no tokens".to_string()));
    }
    if tokens.len() >= n_ctx.get() as usize {
        return Err(EngineError::Generation(format!(
            "prompt of {} tokens does not fit the {} token context",
            tokens.len(),
            n_ctx
        )));
    }

    tracing::debug!("Tokenized prompt into {} tokens", tokens.len());
    run_inference(&mut ctx, model, &tokens, n_ctx.get(), request, sink)
}

fn build_chat_prompt(model: &LlamaModel, prompt: &str) -> Result<String, String> {
    let template = model
        .chat_template(None)
        .map_err(|e| format!("Failed to load chat template: {e}"))?;
    let user_message = LlamaChatMessage::new("user".to_string(), prompt.to_string())
        .map_err(|e| format!("Failed to build chat message: {e}"))?;
    model
        .apply_chat_template(&template, &[user_message], true)
        .map_err(|e| format!("Failed to apply chat template: {e}"))
}

fn build_sampler(params: &SamplingParams) -> LlamaSampler {
    if params.is_greedy() {
        return LlamaSampler::greedy();
    }

    let seed = if params.seed == 0 {
        rand_seed()
    } else {
        params.seed
    };
    LlamaSampler::chain_simple([
        LlamaSampler::top_k(params.top_k as i32),
        LlamaSampler::top_p(params.top_p, 1),
        LlamaSampler::temp(params.temperature),
        LlamaSampler::dist(seed),
    ])
}

/// Sends any buffered text and the terminal chunk
fn finish(
    sink: &TokenSender,
    utf8: &mut Utf8Assembler,
    stops: &mut StopSequences,
    reason: FinishReason,
) {
    let (tail, stopped) = drain_tail(utf8, stops);
    if !tail.is_empty() {
        let _ = sink.blocking_send(tail, FinishReason::None);
    }
    let reason = if stopped { FinishReason::Stop } else { reason };
    let _ = sink.blocking_send(String::new(), reason);
}

/// Text still buffered at the end of a run; `true` if it completed a stop sequence
fn drain_tail(utf8: &mut Utf8Assembler, stops: &mut StopSequences) -> (String, bool) {
    let mut tail = String::new();
    if let Some(text) = utf8.flush() {
        let (emit, stopped) = stops.push(&text);
        tail.push_str(&emit);
        if stopped {
            return (tail, true);
        }
    }
    tail.push_str(&stops.flush());
    (tail, false)
}

fn run_inference(
    ctx: &mut LlamaContext,
    model: &LlamaModel,
    prompt: &[LlamaToken],
    n_ctx: u32,
    request: &GenerationRequest,
    sink: &TokenSender,
) -> Result<(), EngineError> {
    let mut batch = LlamaBatch::new(BATCH_SIZE, 1);
    let last = prompt.len() - 1;

    // Prompts longer than one batch are decoded window by window
    for (window_index, window) in prompt.chunks(BATCH_SIZE).enumerate() {
        batch.clear();
        for (offset, token) in window.iter().enumerate() {
            let position = window_index * BATCH_SIZE + offset;
            batch
                .add(*token, position as i32, &[0], position == last)
                .map_err(|e| generation_error("failed to add token to batch", e))?;
        }
        ctx.decode(&mut batch)
            .map_err(|e| generation_error("failed to decode prompt", e))?;
    }

    let mut sampler = build_sampler(&request.sampling);
    let mut stops = request.stop_sequences();
    let mut utf8 = Utf8Assembler::default();
    let mut position = prompt.len() as i32;
    let mut generated = 0u32;

    loop {
        if sink.is_cancelled() {
            tracing::debug!("Generation {} cancelled", sink.request_id());
            return Ok(());
        }
        if generated >= request.max_tokens || position as u32 >= n_ctx {
            finish(sink, &mut utf8, &mut stops, FinishReason::Length);
            return Ok(());
        }

        let token = sampler.sample(ctx, batch.n_tokens() - 1);
        sampler.accept(token);

        if model.is_eog_token(token) {
            tracing::debug!("End of generation token encountered");
            finish(sink, &mut utf8, &mut stops, FinishReason::Stop);
            return Ok(());
        }

        let bytes = model
            .token_to_bytes(token, Special::Tokenize)
            .map_err(|e| generation_error("failed to convert token to bytes", e))?;
        generated += 1;

        if let Some(text) = utf8.push(&bytes) {
            let (emit, stopped) = stops.push(&text);
            if !emit.is_empty() && sink.blocking_send(emit, FinishReason::None).is_err() {
                tracing::debug!("Consumer went away, stopping generation");
                return Ok(());
            }
            if stopped {
                let _ = sink.blocking_send(String::new(), FinishReason::Stop);
                return Ok(());
            }
        }

        batch.clear();
        batch
            .add(token, position, &[0], true)
            .map_err(|e| generation_error("failed to add token to batch", e))?;
        ctx.decode(&mut batch)
            .map_err(|e| generation_error("failed to decode", e))?;
        position += 1;
    }
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}

fn gpu_offload_available(host: &HostProfile) -> bool {
    (cfg!(feature = "metal") && host.has(NativeComponent::Metal))
        || (cfg!(feature = "cuda") && host.has(NativeComponent::Cuda))
        || (cfg!(feature = "vulkan") && host.gpu.is_available)
}

pub fn accelerated_capability() -> EngineCapability {
    EngineCapability::new(
        ACCELERATED,
        0,
        |host: &HostProfile| host.has(NativeComponent::LlamaCpp) && gpu_offload_available(host),
        || {
            let engine: Arc<dyn InferenceEngine> = Arc::new(LlamaEngine::accelerated()?);
            Ok(engine)
        },
    )
}

pub fn portable_capability() -> EngineCapability {
    EngineCapability::new(
        PORTABLE,
        10,
        |host: &HostProfile| host.has(NativeComponent::LlamaCpp),
        || {
            let engine: Arc<dyn InferenceEngine> = Arc::new(LlamaEngine::portable()?);
            Ok(engine)
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::streaming::token_channel;
    use crate::system::{CpuArch, OsFamily};
    use crate::types::model::PARAM_PATH;
    use crate::types::RequestId;
    use std::io::Write;

    fn linux() -> HostProfile {
        HostProfile::new(OsFamily::Linux, CpuArch::X86_64)
    }

    #[test]
    fn test_portable_needs_llama_runtime() {
        let capability = portable_capability();
        assert!(!capability.is_compatible(&linux()));
        assert!(capability.is_compatible(&linux().with_component(NativeComponent::LlamaCpp)));
    }

    #[test]
    fn test_accelerated_needs_gpu_runtime() {
        let capability = accelerated_capability();
        let cpu_only = linux().with_component(NativeComponent::LlamaCpp);
        assert!(!capability.is_compatible(&cpu_only));

        let cuda = cpu_only.clone().with_component(NativeComponent::Cuda);
        assert_eq!(capability.is_compatible(&cuda), cfg!(feature = "cuda"));
    }

    #[test]
    fn test_drain_tail_releases_partial_stop() {
        let mut stops = StopSequences::new(&["STOP".to_string()]);
        let mut utf8 = Utf8Assembler::default();

        assert_eq!(stops.push("done ST"), ("done ".to_string(), false));
        assert_eq!(utf8.push(&[0xC3]), None);

        let (tail, stopped) = drain_tail(&mut utf8, &mut stops);
        assert_eq!(tail, "ST\u{FFFD}");
        assert!(!stopped);
        assert_eq!(drain_tail(&mut utf8, &mut stops), (String::new(), false));
    }

    #[test]
    fn test_gpu_layers_follow_variant() {
        let model = ModelRef::new("m").with_param(PARAM_GPU_LAYERS, 12);
        let accelerated = LlamaEngine::accelerated().unwrap();
        let portable = LlamaEngine::portable().unwrap();

        assert_eq!(accelerated.gpu_layers(&model), 12);
        assert_eq!(accelerated.gpu_layers(&ModelRef::new("m")), ALL_LAYERS);
        assert_eq!(portable.gpu_layers(&model), 0);
    }

    #[tokio::test]
    async fn test_load_rejects_non_gguf_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"definitely not a model file").unwrap();

        let engine = LlamaEngine::portable().unwrap();
        let model = ModelRef::new("bogus").with_param(PARAM_PATH, file.path().display());
        let err = engine.load(&model).await.unwrap_err();

        assert!(matches!(err, EngineError::Validation(_)), "{err}");
    }

    #[tokio::test]
    async fn test_missing_file_fails_validation() {
        let engine = LlamaEngine::portable().unwrap();
        let model = ModelRef::new("/nonexistent/model.gguf");
        assert!(matches!(
            engine.load(&model).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_foreign_handle_is_stale() {
        let engine = LlamaEngine::portable().unwrap();
        let handle = EngineHandle::new(PORTABLE, ModelRef::new("m"), ModelInfo::default());
        let id = handle.id();

        let (sink, _stream) = token_channel(RequestId::new("r"), PORTABLE, 4);
        let err = engine
            .generate(&handle, GenerationRequest::new("hi"), sink)
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::StaleHandle(id));

        assert_eq!(engine.unload(handle).await, Err(EngineError::StaleHandle(id)));
    }
}
