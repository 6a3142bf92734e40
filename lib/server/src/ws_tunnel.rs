use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use cache::CloneCache;
use tracing::{debug, warn};
use uuid::Uuid;
use warp_protocol::Message;
use warp_transport::websocket::{Websocket, WebsocketReceiver, WebsocketSender};
use warp_transport::{AxumWebsocket, DEFAULT_CAPACITY};

use crate::connection::ClientConnectionState;

/// Tracks the tunnelled (non-control) WebSockets a connection is
/// relaying: `wsId -> channel feeding that socket's write side`.
#[derive(Default)]
pub struct WsTunnels(CloneCache<Uuid, warp_channel::Sender<(Bytes, bool)>>);

impl WsTunnels {
  pub fn new() -> Self {
    Self::default()
  }

  async fn register(&self, ws_id: Uuid, tx: warp_channel::Sender<(Bytes, bool)>) {
    self.0.insert(ws_id, tx).await;
  }

  pub async fn mark_opened(&self, ws_id: Uuid) {
    debug!("tunnelled websocket {ws_id} reported open by client");
  }

  pub async fn relay_to_public(&self, ws_id: Uuid, chunk: Bytes, binary: bool) {
    match self.0.get(&ws_id).await {
      Some(tx) => {
        if tx.send((chunk, binary)).await.is_err() {
          warn!("dropping ws-message for closed tunnel {ws_id}");
        }
      }
      None => warn!("ws-message for unregistered tunnel {ws_id}"),
    }
  }

  pub async fn remove(&self, ws_id: Uuid) {
    if let Some(tx) = self.0.remove(&ws_id).await {
      tx.close();
    }
  }

  pub async fn close_all(&self) {
    for (_, tx) in self.0.get_entries().await {
      tx.close();
    }
  }
}

/// Relays one public WebSocket connection to the claiming client:
/// public frames become `ws-message` on the control channel, and
/// `ws-message`s the client sends back are written to the public
/// socket until either side closes.
pub async fn handle(
  connection: Arc<ClientConnectionState>,
  domain: String,
  url: String,
  headers: BTreeMap<String, String>,
  socket: AxumWebsocket,
) {
  let ws_id = Uuid::new_v4();
  let (tx, mut rx) = warp_channel::channel::<(Bytes, bool)>(DEFAULT_CAPACITY);
  connection.ws_tunnels.register(ws_id, tx).await;

  if connection
    .outbound
    .send(Message::WsOpened { ws_id, domain, url, headers })
    .await
    .is_err()
  {
    connection.ws_tunnels.remove(ws_id).await;
    return;
  }

  let (mut sender, mut receiver) = socket.split();

  let writer = tokio::spawn(async move {
    while let Some((chunk, binary)) = rx.recv().await {
      if sender.send(chunk, binary).await.is_err() {
        break;
      }
    }
    let _ = sender.close().await;
  });

  loop {
    match receiver.recv().await {
      Ok(Some(bytes)) => {
        let message = Message::WsMessage { ws_id, chunk: bytes, binary: true };
        if connection.outbound.send(message).await.is_err() {
          break;
        }
      }
      Ok(None) | Err(_) => break,
    }
  }

  let _ = connection.outbound.send(Message::WsClosed { ws_id }).await;
  connection.ws_tunnels.remove(ws_id).await;
  writer.abort();
}
