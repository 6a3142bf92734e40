use cache::CloneCache;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::connection::ClientConnectionState;

/// `host -> connection id`. Registration is last-writer-wins: a new
/// `register` for a host already claimed simply overwrites the
/// mapping, and the displaced connection is never told.
#[derive(Default)]
pub struct HostRegistry(CloneCache<String, Uuid>);

impl HostRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn register(&self, host: String, connection_id: Uuid) {
    self.0.insert(host, connection_id).await;
  }

  pub async fn resolve(&self, host: &str) -> Option<Uuid> {
    self.0.get(&host.to_string()).await
  }

  /// Drops each of `hosts` if it still points at `connection_id`. A
  /// host reassigned to a different connection in the meantime is
  /// left alone — the "not displaced" rule.
  pub async fn remove_hosts(&self, hosts: &[String], connection_id: Uuid) {
    for host in hosts {
      self.0.remove_if(host, |owner| *owner == connection_id).await;
    }
  }
}

/// Per-process state, constructed fresh by each call to `serve`/
/// `serve_handler` rather than reached through a global — every piece
/// of mutable state here is owned by the `Router` that holds it.
pub struct ServerState {
  pub host_registry: HostRegistry,
  pub connections: CloneCache<Uuid, std::sync::Arc<ClientConnectionState>>,
  pub api_keys: Vec<String>,
  pub connect_path: String,
}

impl ServerState {
  pub fn new(config: &ServerConfig) -> std::sync::Arc<Self> {
    std::sync::Arc::new(Self {
      host_registry: HostRegistry::new(),
      connections: CloneCache::new(),
      api_keys: config.api_keys.clone(),
      connect_path: config.connect_path.clone(),
    })
  }
}
