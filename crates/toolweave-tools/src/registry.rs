//! Capability trait, registry and per-run lookup table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use toolweave_core::{ToolDefinition, ToolSource};

use crate::ToolError;

/// Context for capability execution.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Cancelled when the owning run is cancelled
    pub cancel: CancellationToken,
    /// Upper bound for a single execution, if any
    pub timeout: Option<Duration>,
}

impl ToolContext {
    /// Create a context with a fresh cancellation token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context bound to an existing cancellation token.
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            timeout: None,
        }
    }

    /// Set the per-execution timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A named, described, schema-typed unit of work.
///
/// Implementations are immutable once registered; side effects happen only in
/// [`Capability::execute`].
#[async_trait]
pub trait Capability: Send + Sync {
    /// Unique name of this capability.
    fn name(&self) -> &str;

    /// Human-readable description offered to the model.
    fn description(&self) -> &str;

    /// JSON Schema of the argument object.
    fn parameter_schema(&self) -> serde_json::Value;

    /// Where the capability comes from.
    fn source(&self) -> ToolSource {
        ToolSource::Local
    }

    /// Whether identical invocations may be served from a result cache.
    fn cacheable(&self) -> bool {
        false
    }

    /// Schema-level definition offered to a backend.
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description())
            .with_parameters(self.parameter_schema())
            .with_source(self.source())
    }

    /// Execute with the JSON-encoded argument object, returning result text.
    async fn execute(&self, ctx: &ToolContext, arguments: &str) -> Result<String, ToolError>;
}

type CapabilityFn = dyn Fn(&str) -> Result<String, ToolError> + Send + Sync;

/// Adapter turning a synchronous closure into a [`Capability`].
pub struct FnCapability {
    name: String,
    description: String,
    schema: serde_json::Value,
    cacheable: bool,
    func: Box<CapabilityFn>,
}

impl FnCapability {
    /// Wrap `func`, which receives the raw JSON argument text.
    pub fn new<F>(name: impl Into<String>, description: impl Into<String>, func: F) -> Self
    where
        F: Fn(&str) -> Result<String, ToolError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            schema: serde_json::json!({"type": "object", "properties": {}}),
            cacheable: false,
            func: Box::new(func),
        }
    }

    /// Set the argument schema.
    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = schema;
        self
    }

    /// Allow results to be cached.
    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }
}

#[async_trait]
impl Capability for FnCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameter_schema(&self) -> serde_json::Value {
        self.schema.clone()
    }

    fn cacheable(&self) -> bool {
        self.cacheable
    }

    async fn execute(&self, ctx: &ToolContext, arguments: &str) -> Result<String, ToolError> {
        if ctx.cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }
        (self.func)(arguments)
    }
}

/// Registry of in-process capabilities, kept in registration order.
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    capabilities: Vec<Arc<dyn Capability>>,
    index: HashMap<String, usize>,
}

impl CapabilityRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability, replacing any earlier one with the same name.
    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        let name = capability.name().to_string();
        match self.index.get(&name) {
            Some(&pos) => {
                debug!(capability = %name, "Replacing registered capability");
                self.capabilities[pos] = capability;
            }
            None => {
                self.index.insert(name, self.capabilities.len());
                self.capabilities.push(capability);
            }
        }
    }

    /// Get a capability by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.index.get(name).map(|&i| self.capabilities[i].clone())
    }

    /// Check if a capability exists.
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// List all capability names in registration order.
    pub fn list(&self) -> Vec<&str> {
        self.capabilities.iter().map(|c| c.name()).collect()
    }

    /// Get all definitions in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.capabilities.iter().map(|c| c.definition()).collect()
    }

    /// Iterate over all capabilities.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Capability>> {
        self.capabilities.iter()
    }

    /// Get the number of registered capabilities.
    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

/// Something that can list remote capabilities, such as one protocol server.
#[async_trait]
pub trait CapabilitySource: Send + Sync {
    /// Name used in logs.
    fn source_name(&self) -> &str;

    /// Fetch the current capability list.
    async fn capabilities(
        &self,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<Arc<dyn Capability>>>;
}

/// The name-keyed lookup table for one run.
///
/// Resolution checks local capabilities first, then remote ones in the order
/// their sources were added. A remote capability whose name is already taken
/// is skipped.
#[derive(Default, Clone)]
pub struct CapabilitySet {
    local: CapabilityRegistry,
    remote: CapabilityRegistry,
}

impl CapabilitySet {
    /// A set with only local capabilities.
    pub fn new(local: CapabilityRegistry) -> Self {
        Self {
            local,
            remote: CapabilityRegistry::new(),
        }
    }

    /// Add one remote snapshot.
    pub fn add_remote(&mut self, capabilities: Vec<Arc<dyn Capability>>) {
        for capability in capabilities {
            let name = capability.name().to_string();
            if self.local.contains(&name) || self.remote.contains(&name) {
                warn!(capability = %name, "Skipping duplicate remote capability");
                continue;
            }
            self.remote.register(capability);
        }
    }

    /// Snapshot every source once, skipping sources that fail.
    pub async fn snapshot(
        local: CapabilityRegistry,
        sources: &[Arc<dyn CapabilitySource>],
        cancel: &CancellationToken,
    ) -> Self {
        let mut set = Self::new(local);
        for source in sources {
            match source.capabilities(cancel).await {
                Ok(capabilities) => {
                    debug!(
                        source = source.source_name(),
                        count = capabilities.len(),
                        "Snapshot remote capabilities"
                    );
                    set.add_remote(capabilities);
                }
                Err(e) => {
                    warn!(source = source.source_name(), error = %e, "Failed to list remote capabilities");
                }
            }
        }
        set
    }

    /// Resolve a capability by name.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.local.get(name).or_else(|| self.remote.get(name))
    }

    /// Definitions of all capabilities, local first.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs = self.local.definitions();
        defs.extend(self.remote.definitions());
        defs
    }

    /// Total number of capabilities.
    pub fn len(&self) -> usize {
        self.local.len() + self.remote.len()
    }

    /// Check if no capabilities are available.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
