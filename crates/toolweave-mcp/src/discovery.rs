//! Ownership of the configured servers and their capability snapshots.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use toolweave_tools::{Capability, CapabilityRegistry, CapabilitySet, CapabilitySource};
use tracing::{info, warn};

use crate::builder::McpBuilder;
use crate::client::McpClient;
use crate::error::McpError;
use crate::tools::McpToolWrapper;

/// One server viewed as a source of capabilities.
pub struct ServerSource {
    client: Arc<McpClient>,
}

impl ServerSource {
    pub fn new(client: Arc<McpClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CapabilitySource for ServerSource {
    fn source_name(&self) -> &str {
        self.client.name()
    }

    async fn capabilities(
        &self,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<Arc<dyn Capability>>> {
        let tools = self.client.list_tools(cancel).await?;
        Ok(tools
            .into_iter()
            .map(|tool| Arc::new(McpToolWrapper::new(tool, self.client.clone())) as Arc<dyn Capability>)
            .collect())
    }
}

/// Owns the clients for every configured server.
#[derive(Debug, Default)]
pub struct McpServerManager {
    clients: Vec<Arc<McpClient>>,
}

impl McpServerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the builder's servers. Eagerly checked clients are kept as they
    /// are; lazy descriptors become unconnected clients.
    pub async fn from_builder(
        builder: McpBuilder,
        cancel: &CancellationToken,
    ) -> Result<Self, McpError> {
        let timeout = builder.timeout();
        let retry = builder.retry_policy().clone();
        let output = builder.build(cancel).await?;

        let mut manager = Self::new();
        for client in output.clients {
            manager.add_client(client);
        }
        for descriptor in output.descriptors {
            manager.add_client(Arc::new(McpClient::new(descriptor, timeout, retry.clone())));
        }
        info!(servers = manager.len(), "Server manager ready");
        Ok(manager)
    }

    /// Register a client, replacing any client with the same name.
    pub fn add_client(&mut self, client: Arc<McpClient>) {
        if let Some(existing) = self.clients.iter_mut().find(|c| c.name() == client.name()) {
            warn!(server = %client.name(), "Replacing server with duplicate name");
            *existing = client;
        } else {
            self.clients.push(client);
        }
    }

    pub fn client(&self, name: &str) -> Option<Arc<McpClient>> {
        self.clients.iter().find(|c| c.name() == name).cloned()
    }

    pub fn clients(&self) -> &[Arc<McpClient>] {
        &self.clients
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Every server as a capability source.
    pub fn sources(&self) -> Vec<Arc<dyn CapabilitySource>> {
        self.clients
            .iter()
            .map(|c| Arc::new(ServerSource::new(c.clone())) as Arc<dyn CapabilitySource>)
            .collect()
    }

    /// Snapshot all remote capabilities on top of `local`. Servers that fail
    /// to list their tools are logged and skipped.
    pub async fn capability_set(
        &self,
        local: CapabilityRegistry,
        cancel: &CancellationToken,
    ) -> CapabilitySet {
        CapabilitySet::snapshot(local, &self.sources(), cancel).await
    }

    /// Close every client, logging failures.
    pub async fn close_all(&self) {
        for client in &self.clients {
            if let Err(e) = client.close().await {
                warn!(server = %client.name(), error = %e, "Failed to close server");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::LazyServerDescriptor;
    use crate::client::ClientState;
    use crate::retry::RetryPolicy;
    use std::time::Duration;
    use toolweave_tools::FnCapability;

    fn missing(name: &str) -> Arc<McpClient> {
        Arc::new(McpClient::new(
            LazyServerDescriptor::stdio(name, "definitely-not-a-real-command-xyz", vec![]),
            Duration::from_secs(1),
            RetryPolicy::new(1, Duration::from_millis(1)),
        ))
    }

    #[test]
    fn test_add_client_replaces_duplicates() {
        let mut manager = McpServerManager::new();
        manager.add_client(missing("a"));
        manager.add_client(missing("b"));
        manager.add_client(missing("a"));
        assert_eq!(manager.len(), 2);
        assert!(manager.client("a").is_some());
        assert!(manager.client("c").is_none());
    }

    #[tokio::test]
    async fn test_snapshot_skips_failing_servers() {
        let mut manager = McpServerManager::new();
        manager.add_client(missing("broken"));

        let mut local = CapabilityRegistry::new();
        local.register(Arc::new(FnCapability::new("echo", "Echo", |a| Ok(a.to_string()))));

        let set = manager.capability_set(local, &CancellationToken::new()).await;
        assert_eq!(set.len(), 1);
        assert!(set.resolve("echo").is_some());
    }

    #[tokio::test]
    async fn test_from_builder_without_health_check_is_lazy() {
        let builder = McpBuilder::new()
            .with_health_check(false)
            .add_stdio_server("lazy", "definitely-not-a-real-command-xyz", Vec::<String>::new());
        let manager = McpServerManager::from_builder(builder, &CancellationToken::new())
            .await
            .unwrap();

        let client = manager.client("lazy").unwrap();
        assert_eq!(client.state(), ClientState::Unconnected);

        manager.close_all().await;
        assert_eq!(client.state(), ClientState::Closed);
    }
}
