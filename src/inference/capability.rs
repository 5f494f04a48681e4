//! Engine capability registry
//!
//! Enumerates the engine variants built into this process and which of them
//! can run on a given host. Variants are registered once at startup; the
//! registry is read-only afterwards.

use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::inference::engine::{EngineError, InferenceEngine};
use crate::system::HostProfile;

type CompatibilityFn = dyn Fn(&HostProfile) -> bool + Send + Sync;
type EngineFactory = dyn Fn() -> Result<Arc<dyn InferenceEngine>, EngineError> + Send + Sync;

/// Describes one engine variant
#[derive(Clone)]
pub struct EngineCapability {
    name: String,
    rank: u32,
    compatible: Arc<CompatibilityFn>,
    factory: Arc<EngineFactory>,
}

impl EngineCapability {
    /// `rank`: lower is preferred
    pub fn new<P, F>(name: impl Into<String>, rank: u32, compatible: P, factory: F) -> Self
    where
        P: Fn(&HostProfile) -> bool + Send + Sync + 'static,
        F: Fn() -> Result<Arc<dyn InferenceEngine>, EngineError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            rank,
            compatible: Arc::new(compatible),
            factory: Arc::new(factory),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn is_compatible(&self, host: &HostProfile) -> bool {
        (self.compatible)(host)
    }

    /// Creates a fresh engine instance; each instance holds at most one model
    pub fn instantiate(&self) -> Result<Arc<dyn InferenceEngine>, EngineError> {
        (self.factory)()
    }
}

impl fmt::Debug for EngineCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineCapability")
            .field("name", &self.name)
            .field("rank", &self.rank)
            .finish_non_exhaustive()
    }
}

/// Registry of engine variants
#[derive(Debug, Clone, Default)]
pub struct EngineRegistry {
    capabilities: Vec<EngineCapability>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a variant. A second variant with an existing name is ignored.
    pub fn register(&mut self, capability: EngineCapability) {
        if self.get(capability.name()).is_some() {
            tracing::warn!("Engine '{}' already registered, ignoring", capability.name());
            return;
        }
        tracing::debug!(
            "Registered engine '{}' (rank {})",
            capability.name(),
            capability.rank()
        );
        self.capabilities.push(capability);
    }

    pub fn with(mut self, capability: EngineCapability) -> Self {
        self.register(capability);
        self
    }

    pub fn get(&self, name: &str) -> Option<&EngineCapability> {
        self.capabilities.iter().find(|c| c.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.capabilities.iter().map(EngineCapability::name).collect()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Variants that can run on `host`, best first
    ///
    /// Ordered by rank; equal ranks keep registration order.
    pub fn compatible(&self, host: &HostProfile) -> Vec<EngineCapability> {
        let mut compatible: Vec<EngineCapability> = self
            .capabilities
            .iter()
            .filter(|c| c.is_compatible(host))
            .cloned()
            .collect();
        // Stable sort keeps registration order among ties
        compatible.sort_by_key(EngineCapability::rank);
        compatible
    }
}

/// Variants shipped with this build
pub fn default_registry() -> EngineRegistry {
    #[allow(unused_mut)]
    let mut registry = EngineRegistry::new();

    #[cfg(feature = "llama")]
    {
        registry.register(crate::inference::llama::accelerated_capability());
        registry.register(crate::inference::llama::portable_capability());
    }

    registry
}

static GLOBAL: OnceCell<Arc<EngineRegistry>> = OnceCell::new();

/// Installs the process-wide registry; fails if one is already installed
pub fn install_global(registry: EngineRegistry) -> Result<(), EngineRegistry> {
    GLOBAL
        .set(Arc::new(registry))
        .map_err(|rejected| Arc::try_unwrap(rejected).unwrap_or_else(|arc| (*arc).clone()))
}

/// Process-wide registry, [`default_registry`] unless one was installed first
pub fn global() -> Arc<EngineRegistry> {
    GLOBAL
        .get_or_init(|| Arc::new(default_registry()))
        .clone()
}
