//! Two interchangeable wire codecs over one envelope shape: a JSON
//! codec that base64-encodes chunk payloads, and a length-prefixed
//! binary codec that appends them raw. Negotiated by the `v` query
//! parameter on the connect URL (`warp_protocol::CODEC_QUERY_PARAM`).

use anyhow::{Context, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use warp_protocol::Message;

/// Shared interface both wire codecs implement.
pub trait Codec: Send + Sync + 'static {
  fn encode(&self, message: Message) -> Bytes;
  fn decode(&self, bytes: Bytes) -> anyhow::Result<Message>;
  /// Whether the underlying WebSocket message should be sent as
  /// binary (`true`) or text (`false`).
  fn is_binary(&self) -> bool;
}

/// Pulls the mutable chunk field out of the variants that carry one,
/// so the two codecs can handle it differently from the rest of the
/// message.
fn chunk_mut(message: &mut Message) -> Option<&mut Bytes> {
  match message {
    Message::RequestData { chunk, .. }
    | Message::ResponseData { chunk, .. }
    | Message::WsMessage { chunk, .. } => Some(chunk),
    _ => None,
  }
}

/// Scalar fields as JSON; a present `chunk` is base64-encoded inside
/// the JSON object. Sent as WebSocket text frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
  fn encode(&self, message: Message) -> Bytes {
    // serde_json::to_vec on this enum cannot fail: every field is a
    // plain scalar, string, map, or the base64 chunk adapter.
    Bytes::from(
      serde_json::to_vec(&message)
        .expect("Message is always JSON-serializable"),
    )
  }

  fn decode(&self, bytes: Bytes) -> anyhow::Result<Message> {
    serde_json::from_slice(&bytes)
      .context("failed to decode JSON message")
  }

  fn is_binary(&self) -> bool {
    false
  }
}

/// `[u32 header_len][header_bytes (JSON, chunk field emptied)][chunk_bytes]`.
/// Avoids base64 overhead on the hot path. Sent as WebSocket binary
/// frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl Codec for BinaryCodec {
  fn encode(&self, mut message: Message) -> Bytes {
    let chunk =
      chunk_mut(&mut message).map(std::mem::take).unwrap_or_default();
    let header = serde_json::to_vec(&message)
      .expect("Message is always JSON-serializable");
    let mut buf =
      BytesMut::with_capacity(4 + header.len() + chunk.len());
    buf.put_u32(header.len() as u32);
    buf.put_slice(&header);
    buf.put_slice(&chunk);
    buf.freeze()
  }

  fn decode(&self, mut bytes: Bytes) -> anyhow::Result<Message> {
    if bytes.len() < 4 {
      bail!("binary message shorter than the length prefix");
    }
    let header_len = bytes.get_u32() as usize;
    if bytes.len() < header_len {
      bail!("binary message shorter than its declared header length");
    }
    let header = bytes.split_to(header_len);
    let mut message: Message = serde_json::from_slice(&header)
      .context("failed to decode binary message header")?;
    // Whatever remains is the chunk, verbatim.
    if let Some(slot) = chunk_mut(&mut message) {
      *slot = bytes;
    }
    Ok(message)
  }

  fn is_binary(&self) -> bool {
    true
  }
}

/// Picks a codec from the `v` query parameter presence: present ⇒
/// binary envelope, absent ⇒ JSON.
pub fn negotiate(v_param_present: bool) -> Box<dyn Codec> {
  if v_param_present {
    Box::new(BinaryCodec)
  } else {
    Box::new(JsonCodec)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::BTreeMap;
  use uuid::Uuid;

  fn sample_messages() -> Vec<Message> {
    vec![
      Message::RequestStart {
        id: Uuid::new_v4(),
        domain: "app.test".into(),
        method: "GET".into(),
        url: "/".into(),
        headers: BTreeMap::from([(
          "accept".into(),
          "*/*".into(),
        )]),
        has_body: false,
      },
      Message::RequestData {
        id: Uuid::new_v4(),
        chunk: Bytes::from_static(b"hello world"),
      },
      Message::RequestEnd { id: Uuid::new_v4() },
      Message::RequestAborted { id: Uuid::new_v4() },
      Message::Register {
        id: Uuid::new_v4(),
        api_key: "secret".into(),
        domain: "app.test".into(),
      },
      Message::Registered { id: Uuid::new_v4() },
      Message::ResponseStart {
        id: Uuid::new_v4(),
        status: 200,
        status_text: "OK".into(),
        headers: BTreeMap::new(),
      },
      Message::ResponseError {
        id: Uuid::new_v4(),
        reason: "boom".into(),
      },
    ]
  }

  fn assert_round_trips(message: Message, codec: &dyn Codec) {
    let expected = message.clone();
    let encoded = codec.encode(message);
    let decoded = codec.decode(encoded).unwrap();
    assert_eq!(decoded, expected);
  }

  #[test]
  fn json_codec_round_trips_all_variants() {
    for message in sample_messages() {
      assert_round_trips(message, &JsonCodec);
    }
  }

  #[test]
  fn binary_codec_round_trips_all_variants() {
    for message in sample_messages() {
      assert_round_trips(message, &BinaryCodec);
    }
  }

  #[test]
  fn binary_codec_round_trips_large_chunk() {
    let chunk = Bytes::from(vec![7u8; 1024 * 1024]);
    let message = Message::ResponseData {
      id: Uuid::new_v4(),
      chunk: chunk.clone(),
    };
    let encoded = BinaryCodec.encode(message);
    let decoded = BinaryCodec.decode(encoded).unwrap();
    match decoded {
      Message::ResponseData { chunk: got, .. } => {
        assert_eq!(got, chunk)
      }
      other => panic!("unexpected variant: {other:?}"),
    }
  }

  #[test]
  fn binary_codec_length_matches_header_plus_chunk() {
    let chunk = Bytes::from_static(b"abc");
    let message = Message::ResponseData {
      id: Uuid::new_v4(),
      chunk: chunk.clone(),
    };
    let mut cloned = message.clone();
    let header_len = {
      let taken = chunk_mut(&mut cloned).map(std::mem::take);
      let header = serde_json::to_vec(&cloned).unwrap();
      drop(taken);
      header.len()
    };
    let encoded = BinaryCodec.encode(message);
    assert_eq!(encoded.len(), 4 + header_len + chunk.len());
  }

  #[test]
  fn json_codec_base64_encodes_chunk() {
    let message = Message::RequestData {
      id: Uuid::new_v4(),
      chunk: Bytes::from_static(b"hi"),
    };
    let encoded = JsonCodec.encode(message);
    let text = String::from_utf8(encoded.to_vec()).unwrap();
    assert!(text.contains("\"chunk\":\"aGk=\""));
  }
}
