//! Given a raw WebSocket and a codec, returns a pair of channels
//! carrying decoded application [`Message`]s in each direction. A
//! read pump and a write pump each own their own task, so the caller
//! gets back plain channels instead of a future to await.

use warp_channel::{Receiver, Sender, channel};
use warp_codec::Codec;
use warp_protocol::Message;

use crate::websocket::{Websocket, WebsocketReceiver, WebsocketSender};

/// Default number of in-flight messages either direction may buffer
/// before `send` starts applying backpressure.
pub const DEFAULT_CAPACITY: usize = 32;

pub struct Duplex {
  /// Decoded messages arriving over the socket.
  pub inbound: Receiver<Message>,
  /// Send here to have a message encoded and transmitted.
  pub outbound: Sender<Message>,
}

/// Spawns the read and write pumps for an already-open WebSocket.
/// Closing either the socket or either returned channel eventually
/// closes both — each `close()` is idempotent, so it does not matter
/// which side notices first.
pub fn bind<W: Websocket>(
  ws: W,
  codec: Box<dyn Codec>,
  capacity: usize,
) -> Duplex {
  let (mut ws_tx, mut ws_rx) = ws.split();
  let (in_tx, in_rx) = channel::<Message>(capacity);
  let (out_tx, mut out_rx) = channel::<Message>(capacity);

  let in_tx_for_write = in_tx.clone();
  let binary = codec.is_binary();

  tokio::spawn(async move {
    while let Some(message) = out_rx.recv().await {
      let bytes = codec.encode(message);
      if let Err(e) = ws_tx.send(bytes, binary).await {
        tracing::debug!("duplex write pump stopping: {e:#}");
        break;
      }
    }
    let _ = ws_tx.close().await;
    in_tx_for_write.close();
  });

  let out_tx_for_read = out_tx.clone();
  tokio::spawn(async move {
    loop {
      match ws_rx.recv().await {
        Ok(Some(bytes)) => match codec.decode(bytes) {
          Ok(message) => {
            if in_tx.send(message).await.is_err() {
              break;
            }
          }
          Err(e) => {
            // Protocol violation: log and drop, connection stays up.
            tracing::warn!("dropping undecodable message: {e:#}");
          }
        },
        Ok(None) => break,
        Err(e) => {
          tracing::debug!("duplex read pump stopping: {e:#}");
          break;
        }
      }
    }
    in_tx.close();
    out_tx_for_read.close();
  });

  Duplex {
    inbound: in_rx,
    outbound: out_tx,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::websocket::{WebsocketReceiver as _, WebsocketSender as _};
  use bytes::Bytes;
  use std::sync::{Arc, Mutex};
  use warp_codec::JsonCodec;
  use warp_protocol::Message;

  /// An in-process fake socket used to exercise `bind` without a real
  /// network connection.
  struct FakeSocket {
    inbox: Arc<Mutex<Vec<Bytes>>>,
    outbox: Arc<Mutex<Vec<Bytes>>>,
  }

  struct FakeSender(Arc<Mutex<Vec<Bytes>>>);
  struct FakeReceiver(Arc<Mutex<Vec<Bytes>>>);

  impl crate::websocket::Websocket for FakeSocket {
    type Sender = FakeSender;
    type Receiver = FakeReceiver;

    fn split(self) -> (Self::Sender, Self::Receiver) {
      (FakeSender(self.outbox), FakeReceiver(self.inbox))
    }
  }

  impl crate::websocket::WebsocketSender for FakeSender {
    async fn send(
      &mut self,
      bytes: Bytes,
      _binary: bool,
    ) -> anyhow::Result<()> {
      self.0.lock().unwrap().push(bytes);
      Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
      Ok(())
    }
  }

  impl crate::websocket::WebsocketReceiver for FakeReceiver {
    async fn recv(&mut self) -> anyhow::Result<Option<Bytes>> {
      let item = self.0.lock().unwrap().pop();
      match item {
        Some(bytes) => Ok(Some(bytes)),
        None => {
          // Nothing queued: park briefly then report close, which is
          // enough for these tests (single in-flight message).
          tokio::time::sleep(std::time::Duration::from_millis(5))
            .await;
          Ok(None)
        }
      }
    }
  }

  #[tokio::test]
  async fn outbound_send_is_encoded_and_written_to_socket() {
    let outbox = Arc::new(Mutex::new(Vec::new()));
    let socket = FakeSocket {
      inbox: Arc::new(Mutex::new(Vec::new())),
      outbox: outbox.clone(),
    };
    let duplex = bind(socket, Box::new(JsonCodec), DEFAULT_CAPACITY);
    duplex
      .outbound
      .send(Message::Registered {
        id: uuid::Uuid::nil(),
      })
      .await
      .unwrap();
    duplex.outbound.close();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let written = outbox.lock().unwrap();
    assert_eq!(written.len(), 1);
    assert!(
      String::from_utf8_lossy(&written[0]).contains("\"registered\"")
    );
  }

  #[tokio::test]
  async fn inbound_message_is_decoded_and_delivered() {
    let inbox = Arc::new(Mutex::new(vec![JsonCodec.encode(
      Message::Registered {
        id: uuid::Uuid::nil(),
      },
    )]));
    let socket = FakeSocket {
      inbox: inbox.clone(),
      outbox: Arc::new(Mutex::new(Vec::new())),
    };
    let mut duplex =
      bind(socket, Box::new(JsonCodec), DEFAULT_CAPACITY);
    let message = duplex.inbound.recv().await.unwrap();
    assert_eq!(message.kind(), "registered");
  }
}
