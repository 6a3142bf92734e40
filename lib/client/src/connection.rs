use std::sync::Arc;

use anyhow::Context;
use tokio::sync::oneshot;
use tracing::warn;
use uuid::Uuid;
use warp_channel::Receiver;
use warp_codec::BinaryCodec;
use warp_protocol::{CODEC_QUERY_PARAM, Message};
use warp_transport::TungsteniteWebsocket;

use crate::config::ClientConfig;
use crate::state::ClientState;
use crate::{local_request, ws_tunnel};

/// Handles to the two one-shot completions a caller observes for a
/// connection: `registered` resolves once the server has accepted the
/// claim, `closed` resolves (carrying the cause, if any) once the
/// connection is gone for good.
pub struct Connection {
  pub registered: oneshot::Receiver<()>,
  pub closed: oneshot::Receiver<Option<anyhow::Error>>,
}

/// Dials `config.server`, always negotiating the binary codec (no
/// reason for a native client to pay JSON's base64 overhead), sends
/// `register`, and starts the inbound loop. Returns once the socket
/// is open and the register message is on the wire — not once the
/// server has replied; that's what `registered` is for.
pub async fn connect(config: ClientConfig) -> anyhow::Result<Connection> {
  let url = format!(
    "{}{}?{}=1",
    config.server.trim_end_matches('/'),
    config.connect_path,
    CODEC_QUERY_PARAM,
  );
  let (stream, _response) = tokio_tungstenite::connect_async(&url)
    .await
    .with_context(|| format!("failed to connect to {url}"))?;

  let duplex = warp_transport::bind(
    TungsteniteWebsocket(stream),
    Box::new(BinaryCodec),
    warp_transport::DEFAULT_CAPACITY,
  );
  let state = ClientState::new(config.local_addr.clone(), duplex.outbound);

  state
    .outbound
    .send(Message::Register {
      id: Uuid::new_v4(),
      api_key: config.api_key,
      domain: config.domain,
    })
    .await
    .context("failed to send register message")?;

  let (registered_tx, registered_rx) = oneshot::channel();
  let (closed_tx, closed_rx) = oneshot::channel();
  tokio::spawn(run_inbound_loop(
    state,
    duplex.inbound,
    registered_tx,
    closed_tx,
  ));

  Ok(Connection { registered: registered_rx, closed: closed_rx })
}

async fn run_inbound_loop(
  state: Arc<ClientState>,
  mut inbound: Receiver<Message>,
  registered_tx: oneshot::Sender<()>,
  closed_tx: oneshot::Sender<Option<anyhow::Error>>,
) {
  let mut registered_tx = Some(registered_tx);
  while let Some(message) = inbound.recv().await {
    match message {
      Message::Registered { .. } => {
        if let Some(tx) = registered_tx.take() {
          let _ = tx.send(());
        }
      }
      Message::RequestStart { id, domain: _, method, url, headers, has_body } => {
        local_request::start(state.clone(), id, method, url, headers, has_body)
          .await;
      }
      Message::RequestData { id, chunk } => {
        local_request::push_chunk(&state, id, chunk).await;
      }
      Message::RequestEnd { id } => {
        local_request::end_body(&state, id).await;
      }
      Message::RequestAborted { id } => {
        local_request::abort(&state, id).await;
      }
      Message::WsOpened { ws_id, domain: _, url, headers } => {
        tokio::spawn(ws_tunnel::handle_opened(
          state.clone(),
          ws_id,
          url,
          headers,
        ));
      }
      Message::WsMessage { ws_id, chunk, binary } => {
        ws_tunnel::relay_to_local(&state, ws_id, chunk, binary).await;
      }
      Message::WsClosed { ws_id } => {
        ws_tunnel::close(&state, ws_id).await;
      }
      other => {
        warn!("unexpected {} message from server", other.kind());
      }
    }
  }
  let _ = closed_tx.send(None);
}
