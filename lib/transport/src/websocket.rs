//! Wrappers normalizing Axum's and Tungstenite's WebSocket types
//! behind one shape, so the server and client connection loops can
//! share the same read/write pump logic regardless of which side of
//! the handshake they're on.

use anyhow::{Context, anyhow};
use bytes::Bytes;
use futures_util::{
  SinkExt, StreamExt,
  stream::{SplitSink, SplitStream},
};

/// Abstraction over a WebSocket that can be split into an
/// independent sender/receiver pair: framed, ordered, reliable,
/// full-duplex delivery of opaque messages with close notification.
pub trait Websocket: Send + 'static {
  type Sender: WebsocketSender;
  type Receiver: WebsocketReceiver;

  fn split(self) -> (Self::Sender, Self::Receiver);
}

pub trait WebsocketSender: Send + 'static {
  fn send(
    &mut self,
    bytes: Bytes,
    binary: bool,
  ) -> impl Future<Output = anyhow::Result<()>> + Send;

  fn close(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send;
}

pub trait WebsocketReceiver: Send + 'static {
  /// `Ok(None)` signals a clean close; pings/pongs are absorbed
  /// internally and never surfaced.
  fn recv(
    &mut self,
  ) -> impl Future<Output = anyhow::Result<Option<Bytes>>> + Send;
}

// ---------------------------------------------------------------
// Axum (server side)
// ---------------------------------------------------------------

pub struct AxumWebsocket(pub axum::extract::ws::WebSocket);

impl Websocket for AxumWebsocket {
  type Sender = AxumWebsocketSender;
  type Receiver = AxumWebsocketReceiver;

  fn split(self) -> (Self::Sender, Self::Receiver) {
    let (tx, rx) = self.0.split();
    (AxumWebsocketSender(tx), AxumWebsocketReceiver(rx))
  }
}

pub struct AxumWebsocketSender(
  SplitSink<axum::extract::ws::WebSocket, axum::extract::ws::Message>,
);

impl WebsocketSender for AxumWebsocketSender {
  async fn send(
    &mut self,
    bytes: Bytes,
    binary: bool,
  ) -> anyhow::Result<()> {
    let message = if binary {
      axum::extract::ws::Message::Binary(bytes)
    } else {
      let text = String::from_utf8(bytes.to_vec())
        .context("JSON codec produced non-UTF8 bytes")?;
      axum::extract::ws::Message::Text(text.into())
    };
    self
      .0
      .send(message)
      .await
      .context("failed to send websocket message")
  }

  async fn close(&mut self) -> anyhow::Result<()> {
    self
      .0
      .send(axum::extract::ws::Message::Close(None))
      .await
      .context("failed to send websocket close frame")
  }
}

pub struct AxumWebsocketReceiver(
  SplitStream<axum::extract::ws::WebSocket>,
);

impl WebsocketReceiver for AxumWebsocketReceiver {
  async fn recv(&mut self) -> anyhow::Result<Option<Bytes>> {
    loop {
      return match self.0.next().await {
        Some(Ok(axum::extract::ws::Message::Binary(bytes))) => {
          Ok(Some(bytes))
        }
        Some(Ok(axum::extract::ws::Message::Text(text))) => {
          Ok(Some(Bytes::from(text.as_str().to_owned().into_bytes())))
        }
        Some(Ok(axum::extract::ws::Message::Ping(_)))
        | Some(Ok(axum::extract::ws::Message::Pong(_))) => continue,
        Some(Ok(axum::extract::ws::Message::Close(_))) | None => {
          Ok(None)
        }
        Some(Err(e)) => {
          Err(anyhow!(e).context("websocket receive error"))
        }
      };
    }
  }
}

// ---------------------------------------------------------------
// Tungstenite (client side)
// ---------------------------------------------------------------

pub type TungsteniteStream = tokio_tungstenite::WebSocketStream<
  tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

pub struct TungsteniteWebsocket(pub TungsteniteStream);

impl Websocket for TungsteniteWebsocket {
  type Sender = TungsteniteWebsocketSender;
  type Receiver = TungsteniteWebsocketReceiver;

  fn split(self) -> (Self::Sender, Self::Receiver) {
    let (tx, rx) = self.0.split();
    (
      TungsteniteWebsocketSender(tx),
      TungsteniteWebsocketReceiver(rx),
    )
  }
}

pub struct TungsteniteWebsocketSender(
  SplitSink<TungsteniteStream, tokio_tungstenite::tungstenite::Message>,
);

impl WebsocketSender for TungsteniteWebsocketSender {
  async fn send(
    &mut self,
    bytes: Bytes,
    binary: bool,
  ) -> anyhow::Result<()> {
    let message = if binary {
      tokio_tungstenite::tungstenite::Message::Binary(bytes)
    } else {
      let text = String::from_utf8(bytes.to_vec())
        .context("JSON codec produced non-UTF8 bytes")?;
      tokio_tungstenite::tungstenite::Message::Text(text.into())
    };
    self
      .0
      .send(message)
      .await
      .context("failed to send websocket message")
  }

  async fn close(&mut self) -> anyhow::Result<()> {
    self
      .0
      .close(None)
      .await
      .context("failed to send websocket close frame")
  }
}

pub struct TungsteniteWebsocketReceiver(SplitStream<TungsteniteStream>);

impl WebsocketReceiver for TungsteniteWebsocketReceiver {
  async fn recv(&mut self) -> anyhow::Result<Option<Bytes>> {
    loop {
      use tokio_tungstenite::tungstenite::Message as TMessage;
      return match self.0.next().await {
        Some(Ok(TMessage::Binary(bytes))) => Ok(Some(bytes)),
        Some(Ok(TMessage::Text(text))) => {
          Ok(Some(Bytes::from(text.as_str().to_owned().into_bytes())))
        }
        Some(Ok(TMessage::Ping(_))) | Some(Ok(TMessage::Pong(_)))
        | Some(Ok(TMessage::Frame(_))) => continue,
        Some(Ok(TMessage::Close(_))) | None => Ok(None),
        Some(Err(e)) => {
          Err(anyhow!(e).context("websocket receive error"))
        }
      };
    }
  }
}
