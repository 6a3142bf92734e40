use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;
use uuid::Uuid;
use warp_protocol::Message;
use warp_transport::DEFAULT_CAPACITY;
use warp_transport::websocket::{Websocket, WebsocketReceiver, WebsocketSender};

use crate::state::ClientState;

/// Dials the local WebSocket endpoint a tunnelled `ws-opened` names
/// and relays frames both ways until either side closes. Spawned as
/// its own task so one tunnelled socket never blocks the control
/// loop or any other.
pub async fn handle_opened(
  state: Arc<ClientState>,
  ws_id: Uuid,
  url: String,
  _headers: BTreeMap<String, String>,
) {
  let target = to_ws_url(&state.local_addr, &url);
  let (stream, _response) = match tokio_tungstenite::connect_async(&target).await
  {
    Ok(pair) => pair,
    Err(e) => {
      warn!("failed to dial local websocket {target}: {e:#}");
      let _ = state.outbound.send(Message::WsClosed { ws_id }).await;
      return;
    }
  };

  let (mut sender, mut receiver) =
    warp_transport::TungsteniteWebsocket(stream).split();
  let (tx, mut rx) = warp_channel::channel::<(Bytes, bool)>(DEFAULT_CAPACITY);
  state.ws_tunnels.insert(ws_id, tx).await;

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
        if state.outbound.send(message).await.is_err() {
          break;
        }
      }
      Ok(None) | Err(_) => break,
    }
  }

  let _ = state.outbound.send(Message::WsClosed { ws_id }).await;
  state.ws_tunnels.remove(&ws_id).await;
  writer.abort();
}

pub async fn relay_to_local(
  state: &Arc<ClientState>,
  ws_id: Uuid,
  chunk: Bytes,
  binary: bool,
) {
  match state.ws_tunnels.get(&ws_id).await {
    Some(tx) => {
      if tx.send((chunk, binary)).await.is_err() {
        warn!("dropping ws-message for closed local tunnel {ws_id}");
      }
    }
    None => warn!("ws-message for unregistered local tunnel {ws_id}"),
  }
}

pub async fn close(state: &Arc<ClientState>, ws_id: Uuid) {
  if let Some(tx) = state.ws_tunnels.remove(&ws_id).await {
    tx.close();
  }
}

fn to_ws_url(local_addr: &str, url: &str) -> String {
  let converted = if let Some(rest) = local_addr.strip_prefix("https") {
    format!("wss{rest}")
  } else if let Some(rest) = local_addr.strip_prefix("http") {
    format!("ws{rest}")
  } else {
    local_addr.to_string()
  };
  format!("{}{}", converted.trim_end_matches('/'), url)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn to_ws_url_converts_scheme_and_joins_path() {
    assert_eq!(
      to_ws_url("http://127.0.0.1:3000", "/socket?a=1"),
      "ws://127.0.0.1:3000/socket?a=1"
    );
    assert_eq!(
      to_ws_url("https://example.com", "/socket"),
      "wss://example.com/socket"
    );
  }
}
