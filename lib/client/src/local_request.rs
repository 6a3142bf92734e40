use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;
use warp_channel::{Receiver, channel};
use warp_protocol::Message;

use crate::state::{ClientState, RequestHandle};

/// Begins forwarding one tunnelled request to the local endpoint.
/// Spawns its own task so the inbound control loop isn't blocked
/// waiting on the local call or the response stream.
pub async fn start(
  state: Arc<ClientState>,
  id: Uuid,
  method: String,
  url: String,
  headers: BTreeMap<String, String>,
  has_body: bool,
) {
  let cancel = CancellationToken::new();
  let body_rx = if has_body {
    let (tx, rx) = channel::<Bytes>(warp_transport::DEFAULT_CAPACITY);
    state
      .requests
      .insert(id, RequestHandle { body_tx: Some(tx), cancel: cancel.clone() })
      .await;
    Some(rx)
  } else {
    state
      .requests
      .insert(id, RequestHandle { body_tx: None, cancel: cancel.clone() })
      .await;
    None
  };
  tokio::spawn(run(state, id, method, url, headers, body_rx, cancel));
}

/// Pushes a `request-data` chunk into the body channel for `id`. A
/// missing entry (unknown or already-aborted id) is logged and
/// dropped, never fatal.
pub async fn push_chunk(state: &Arc<ClientState>, id: Uuid, chunk: Bytes) {
  match state.requests.get(&id).await {
    Some(handle) => {
      if let Some(tx) = &handle.body_tx {
        if tx.send(chunk).await.is_err() {
          warn!("dropping request-data for {id}: body channel closed");
        }
      }
    }
    None => warn!("request-data for unregistered request {id}"),
  }
}

/// Closes the body channel for `id`, signalling EOF to the in-flight
/// local call. Leaves the request entry in place — the response may
/// still be streaming back.
pub async fn end_body(state: &Arc<ClientState>, id: Uuid) {
  match state.requests.get(&id).await {
    Some(handle) => {
      if let Some(tx) = &handle.body_tx {
        tx.close();
      }
    }
    None => warn!("request-end for unregistered request {id}"),
  }
}

/// Cancels the outstanding local call and drops the entry. No further
/// messages are sent for this id afterward.
pub async fn abort(state: &Arc<ClientState>, id: Uuid) {
  if let Some(handle) = state.requests.remove(&id).await {
    handle.cancel.cancel();
    if let Some(tx) = &handle.body_tx {
      tx.close();
    }
  } else {
    warn!("request-aborted for unregistered request {id}");
  }
}

fn body_stream(
  rx: Receiver<Bytes>,
) -> impl futures_util::Stream<Item = Result<Bytes, std::convert::Infallible>>
+ Send
+ 'static {
  futures_util::stream::unfold(rx, |mut rx| async move {
    rx.recv().await.map(|chunk| (Ok(chunk), rx))
  })
}

fn flatten_headers(headers: &reqwest::header::HeaderMap) -> BTreeMap<String, String> {
  let mut map = BTreeMap::new();
  for (name, value) in headers.iter() {
    if let Ok(value) = value.to_str() {
      map.entry(name.as_str().to_string()).or_insert_with(|| value.to_string());
    }
  }
  map
}

async fn run(
  state: Arc<ClientState>,
  id: Uuid,
  method: String,
  url: String,
  headers: BTreeMap<String, String>,
  body_rx: Option<Receiver<Bytes>>,
  cancel: CancellationToken,
) {
  let local_url = format!("{}{}", state.local_addr.trim_end_matches('/'), url);
  let method =
    method.parse::<reqwest::Method>().unwrap_or(reqwest::Method::GET);
  let mut builder = state.http.request(method, &local_url);
  for (key, value) in &headers {
    if let (Ok(name), Ok(value)) = (
      reqwest::header::HeaderName::from_bytes(key.as_bytes()),
      reqwest::header::HeaderValue::from_str(value),
    ) {
      builder = builder.header(name, value);
    }
  }
  if let Some(rx) = body_rx {
    builder = builder.body(reqwest::Body::wrap_stream(body_stream(rx)));
  }

  let send_result = tokio::select! {
    result = builder.send() => result,
    _ = cancel.cancelled() => {
      state.requests.remove(&id).await;
      return;
    }
  };

  match send_result {
    Ok(response) => stream_response(&state, id, response, &cancel).await,
    Err(e) => {
      warn!("local call failed for request {id}: {e:#}");
      let _ = state
        .outbound
        .send(Message::ResponseError { id, reason: e.to_string() })
        .await;
    }
  }
  state.requests.remove(&id).await;
}

async fn stream_response(
  state: &Arc<ClientState>,
  id: Uuid,
  response: reqwest::Response,
  cancel: &CancellationToken,
) {
  let status = response.status();
  let status_text = status.canonical_reason().unwrap_or("").to_string();
  let headers = flatten_headers(response.headers());
  let start = Message::ResponseStart {
    id,
    status: status.as_u16(),
    status_text,
    headers,
  };
  if state.outbound.send(start).await.is_err() {
    warn!("send failed starting response for {id}: connection is gone");
    state.outbound.close();
    return;
  }

  let mut stream = response.bytes_stream();
  loop {
    tokio::select! {
      _ = cancel.cancelled() => return,
      chunk = stream.next() => match chunk {
        Some(Ok(bytes)) => {
          if bytes.is_empty() {
            continue;
          }
          if state
            .outbound
            .send(Message::ResponseData { id, chunk: bytes })
            .await
            .is_err()
          {
            warn!("send failed pumping response body for {id}: closing connection");
            state.outbound.close();
            return;
          }
        }
        Some(Err(e)) => {
          warn!("error reading local response body for {id}: {e:#}");
          let _ = state
            .outbound
            .send(Message::ResponseError { id, reason: e.to_string() })
            .await;
          return;
        }
        None => break,
      },
    }
  }
  let _ = state.outbound.send(Message::ResponseEnd { id }).await;
}
