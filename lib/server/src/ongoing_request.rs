use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use bytes::Bytes;
use http::HeaderMap;
use tokio::sync::oneshot;
use uuid::Uuid;
use warp_channel::{Receiver, Sender, channel};

/// The response half of a tunnelled request, assembled once
/// `response-start` arrives and handed to the HTTP layer.
pub struct TunnelResponse {
  pub status: http::StatusCode,
  pub headers: HeaderMap,
  pub body: axum::body::Body,
}

impl TunnelResponse {
  pub fn fixed_text(
    status: http::StatusCode,
    text: &'static str,
  ) -> Self {
    Self {
      status,
      headers: HeaderMap::new(),
      body: axum::body::Body::from(text),
    }
  }
}

/// One in-flight tunnelled request: a one-shot slot for the eventual
/// response, and a body channel response-data chunks are pushed into
/// once that slot has been filled.
pub struct OngoingRequest {
  pub id: Uuid,
  response_tx: StdMutex<Option<oneshot::Sender<TunnelResponse>>>,
  body_tx: Sender<Bytes>,
  body_rx: StdMutex<Option<Receiver<Bytes>>>,
}

impl OngoingRequest {
  pub fn new(id: Uuid) -> (Arc<Self>, oneshot::Receiver<TunnelResponse>) {
    let (body_tx, body_rx) = channel::<Bytes>(warp_transport::DEFAULT_CAPACITY);
    let (response_tx, response_rx) = oneshot::channel();
    (
      Arc::new(Self {
        id,
        response_tx: StdMutex::new(Some(response_tx)),
        body_tx,
        body_rx: StdMutex::new(Some(body_rx)),
      }),
      response_rx,
    )
  }

  /// Fulfils the response slot. A no-op if already resolved — callers
  /// don't need to track whether someone beat them to it.
  pub fn resolve(&self, response: TunnelResponse) {
    if let Some(tx) = self.response_tx.lock().unwrap().take() {
      let _ = tx.send(response);
    }
  }

  /// Whether `resolve` has already fired. Distinguishes a genuine
  /// caller abort (no response produced yet) from the handler task's
  /// ordinary return after a response arrived — both drop the same
  /// cancellation guard, only the former should raise `request-aborted`.
  pub fn is_resolved(&self) -> bool {
    self.response_tx.lock().unwrap().is_none()
  }

  pub async fn push_body_chunk(&self, chunk: Bytes) -> anyhow::Result<()> {
    self.body_tx.send(chunk).await
  }

  pub fn close_body(&self) {
    self.body_tx.close();
  }

  /// Builds the streaming `axum::body::Body` for the response, taking
  /// ownership of the receiver half. Only meaningful once, on
  /// `response-start`; a second call returns an already-empty body.
  pub fn take_response_body(&self) -> axum::body::Body {
    match self.body_rx.lock().unwrap().take() {
      Some(rx) => axum::body::Body::from_stream(body_stream(rx)),
      None => axum::body::Body::empty(),
    }
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
