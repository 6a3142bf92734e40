use std::sync::Arc;

use cache::CloneCache;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;
use warp_protocol::{Message, UPSTREAM_UNREACHABLE_BODY};

use crate::ongoing_request::{OngoingRequest, TunnelResponse};
use crate::state::ServerState;
use crate::ws_tunnel::WsTunnels;

/// Everything the server knows about one connected client: where to
/// write outbound messages, which requests are in flight on it, and
/// which hosts it has claimed (so teardown can prune them).
pub struct ClientConnectionState {
  pub id: Uuid,
  pub outbound: warp_channel::Sender<Message>,
  pub ongoing: CloneCache<Uuid, Arc<OngoingRequest>>,
  pub ws_tunnels: WsTunnels,
  claimed_hosts: Mutex<Vec<String>>,
  /// Cancelled on teardown; linked into every request pump so they
  /// stop promptly when the connection dies mid-request.
  pub cancel: CancellationToken,
}

impl ClientConnectionState {
  pub fn new(id: Uuid, outbound: warp_channel::Sender<Message>) -> Arc<Self> {
    Arc::new(Self {
      id,
      outbound,
      ongoing: CloneCache::new(),
      ws_tunnels: WsTunnels::new(),
      claimed_hosts: Mutex::new(Vec::new()),
      cancel: CancellationToken::new(),
    })
  }

  /// Dispatches one inbound message. Protocol violations (unknown id,
  /// malformed variant for this direction) are logged and dropped —
  /// never fatal to the connection.
  pub async fn handle_incoming(
    self: &Arc<Self>,
    state: &Arc<ServerState>,
    message: Message,
  ) {
    match message {
      Message::Register { id, api_key, domain } => {
        self.handle_register(state, id, api_key, domain).await;
      }
      Message::ResponseStart { id, status, status_text, headers } => {
        self.handle_response_start(id, status, status_text, headers).await;
      }
      Message::ResponseData { id, chunk } => {
        match self.ongoing.get(&id).await {
          Some(request) => {
            if let Err(e) = request.push_body_chunk(chunk).await {
              warn!("dropping response-data for {id}: {e:#}");
            }
          }
          None => warn!("response-data for unregistered request {id}"),
        }
      }
      Message::ResponseEnd { id } => {
        if let Some(request) = self.ongoing.remove(&id).await {
          request.close_body();
        } else {
          warn!("response-end for unregistered request {id}");
        }
      }
      Message::ResponseError { id, reason } => {
        warn!("client reported error for request {id}: {reason}");
        if let Some(request) = self.ongoing.remove(&id).await {
          request.resolve(TunnelResponse::fixed_text(
            StatusCode::BAD_GATEWAY,
            UPSTREAM_UNREACHABLE_BODY,
          ));
        }
      }
      Message::WsOpened { ws_id, .. } => {
        self.ws_tunnels.mark_opened(ws_id).await;
      }
      Message::WsMessage { ws_id, chunk, binary } => {
        self.ws_tunnels.relay_to_public(ws_id, chunk, binary).await;
      }
      Message::WsClosed { ws_id } => {
        self.ws_tunnels.remove(ws_id).await;
      }
      other => {
        warn!(
          "unexpected {} message from client on connection {}",
          other.kind(),
          self.id
        );
      }
    }
  }

  async fn handle_register(
    self: &Arc<Self>,
    state: &Arc<ServerState>,
    id: Uuid,
    api_key: String,
    domain: String,
  ) {
    if !state.api_keys.is_empty() && !state.api_keys.contains(&api_key) {
      warn!("connection {} failed auth for domain {domain}", self.id);
      self.outbound.close();
      return;
    }
    self.claimed_hosts.lock().await.push(domain.clone());
    state.host_registry.register(domain, self.id).await;
    if let Err(e) =
      self.outbound.send(Message::Registered { id }).await
    {
      warn!("failed to ack registration for connection {}: {e:#}", self.id);
    }
  }

  async fn handle_response_start(
    &self,
    id: Uuid,
    status: u16,
    status_text: String,
    headers: std::collections::BTreeMap<String, String>,
  ) {
    let Some(request) = self.ongoing.get(&id).await else {
      warn!("response-start for unregistered request {id}");
      return;
    };
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    let mut header_map = HeaderMap::new();
    for (key, value) in headers {
      if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(key.as_bytes()),
        HeaderValue::from_str(&value),
      ) {
        header_map.insert(name, value);
      }
    }
    let _ = status_text;
    let body = request.take_response_body();
    request.resolve(TunnelResponse { status, headers: header_map, body });
  }

  /// Runs once the connection is gone for good: every still-pending
  /// request is resolved with 503 rather than left hanging, its
  /// response body channel is closed so a caller already streaming a
  /// response doesn't block forever on a chunk that will never come,
  /// and every host this connection claimed is removed from the
  /// registry (unless reassigned in the meantime).
  pub async fn teardown(&self, state: &Arc<ServerState>) {
    self.cancel.cancel();
    for (id, request) in self.ongoing.get_entries().await {
      request.resolve(TunnelResponse::fixed_text(
        StatusCode::SERVICE_UNAVAILABLE,
        "Connection to remote client lost",
      ));
      request.close_body();
      self.ongoing.remove(&id).await;
    }
    let claimed_hosts = self.claimed_hosts.lock().await;
    state.host_registry.remove_hosts(&claimed_hosts, self.id).await;
    self.ws_tunnels.close_all().await;
  }
}
