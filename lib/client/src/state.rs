use bytes::Bytes;
use cache::CloneCache;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use warp_protocol::Message;

/// Per in-flight tunnelled request. `body_tx` is `None` for requests
/// the server reported as bodyless; `cancel` fires when a
/// `request-aborted` arrives, at any point up to the response being
/// fully streamed back.
#[derive(Clone)]
pub struct RequestHandle {
  pub body_tx: Option<warp_channel::Sender<Bytes>>,
  pub cancel: CancellationToken,
}

/// State local to one server connection: the local reqwest client
/// used to issue forwarded requests, the outbound control channel,
/// and the per-id maps for in-flight requests and tunnelled
/// WebSockets. Owned entirely by the task `connect` spawns — never
/// reached through a global.
pub struct ClientState {
  pub local_addr: String,
  pub http: reqwest::Client,
  pub outbound: warp_channel::Sender<Message>,
  pub requests: CloneCache<Uuid, RequestHandle>,
  pub ws_tunnels: CloneCache<Uuid, warp_channel::Sender<(Bytes, bool)>>,
}

impl ClientState {
  pub fn new(
    local_addr: String,
    outbound: warp_channel::Sender<Message>,
  ) -> std::sync::Arc<Self> {
    std::sync::Arc::new(Self {
      local_addr,
      http: reqwest::Client::new(),
      outbound,
      requests: CloneCache::new(),
      ws_tunnels: CloneCache::new(),
    })
  }
}
