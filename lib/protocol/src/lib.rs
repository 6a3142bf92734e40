//! The tagged message union both endpoints speak, plus the small
//! constants and id types that form the wire contract. This crate
//! defines the schema only — not who holds per-connection or
//! per-request state; that belongs to `warp_server` and `warp_client`
//! respectively.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type RequestId = Uuid;
pub type WsId = Uuid;

/// Default path the server exposes for client WebSocket upgrades.
pub const DEFAULT_CONNECT_PATH: &str = "/_connect";

/// Query parameter selecting the wire codec. Present (any value) ⇒
/// binary envelope; absent ⇒ JSON-with-base64.
pub const CODEC_QUERY_PARAM: &str = "v";

/// Fixed response body used when no client has claimed the requested
/// `Host`, or the claiming connection is gone.
pub const NO_REGISTRATION_BODY: &str =
  "No registration for domain and/or remote service not available";

/// Fixed response body used when the client's local HTTP call fails.
pub const UPSTREAM_UNREACHABLE_BODY: &str =
  "Error sending request to remote client";

/// The tagged message union carried over the duplex transport.
/// Every non-control message carries `id`; chunk-bearing variants
/// carry an opaque byte payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
  // ---- server -> client ----
  RequestStart {
    id: RequestId,
    domain: String,
    method: String,
    url: String,
    headers: BTreeMap<String, String>,
    #[serde(rename = "hasBody")]
    has_body: bool,
  },
  RequestData {
    id: RequestId,
    #[serde(with = "chunk_codec")]
    chunk: Bytes,
  },
  RequestEnd {
    id: RequestId,
  },
  RequestAborted {
    id: RequestId,
  },
  WsOpened {
    #[serde(rename = "wsId")]
    ws_id: WsId,
    domain: String,
    url: String,
    headers: BTreeMap<String, String>,
  },
  WsMessage {
    #[serde(rename = "wsId")]
    ws_id: WsId,
    #[serde(with = "chunk_codec")]
    chunk: Bytes,
    binary: bool,
  },
  WsClosed {
    #[serde(rename = "wsId")]
    ws_id: WsId,
  },

  // ---- client -> server ----
  Register {
    id: RequestId,
    #[serde(rename = "apiKey")]
    api_key: String,
    domain: String,
  },
  Registered {
    id: RequestId,
  },
  ResponseStart {
    id: RequestId,
    status: u16,
    #[serde(rename = "statusText")]
    status_text: String,
    headers: BTreeMap<String, String>,
  },
  ResponseData {
    id: RequestId,
    #[serde(with = "chunk_codec")]
    chunk: Bytes,
  },
  ResponseEnd {
    id: RequestId,
  },
  ResponseError {
    id: RequestId,
    reason: String,
  },
}

impl Message {
  /// The request/ws id every variant carries.
  pub fn id(&self) -> Uuid {
    use Message::*;
    match self {
      RequestStart { id, .. }
      | RequestData { id, .. }
      | RequestEnd { id }
      | RequestAborted { id }
      | Register { id, .. }
      | Registered { id }
      | ResponseStart { id, .. }
      | ResponseData { id, .. }
      | ResponseEnd { id }
      | ResponseError { id, .. } => *id,
      WsOpened { ws_id, .. }
      | WsMessage { ws_id, .. }
      | WsClosed { ws_id } => *ws_id,
    }
  }

  /// Short name for logging; never mirrors internal Rust type names.
  pub fn kind(&self) -> &'static str {
    use Message::*;
    match self {
      RequestStart { .. } => "request-start",
      RequestData { .. } => "request-data",
      RequestEnd { .. } => "request-end",
      RequestAborted { .. } => "request-aborted",
      WsOpened { .. } => "ws-opened",
      WsMessage { .. } => "ws-message",
      WsClosed { .. } => "ws-closed",
      Register { .. } => "register",
      Registered { .. } => "registered",
      ResponseStart { .. } => "response-start",
      ResponseData { .. } => "response-data",
      ResponseEnd { .. } => "response-end",
      ResponseError { .. } => "response-error",
    }
  }
}

/// Errors a handler may raise while dispatching an inbound `Message`
/// without those errors being fatal to the connection: log and drop
/// the offending message, keep the connection alive.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
  #[error("unregistered id {0} on {1} message")]
  UnregisteredId(Uuid, &'static str),
  #[error("missing body channel for id {0}")]
  MissingBodyChannel(Uuid),
}

/// `serde(with = ...)` module encoding a `Bytes` field as base64
/// inside JSON. Only used when a message is serialized through
/// `serde_json`; the binary
/// codec in `warp_codec` bypasses `serde` entirely for the chunk and
/// appends it as raw trailing bytes instead.
mod chunk_codec {
  use base64::Engine;
  use base64::engine::general_purpose::STANDARD;
  use bytes::Bytes;
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(
    chunk: &Bytes,
    serializer: S,
  ) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(chunk))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(
    deserializer: D,
  ) -> Result<Bytes, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD
      .decode(encoded.as_bytes())
      .map(Bytes::from)
      .map_err(serde::de::Error::custom)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn id_extracts_request_id_for_request_variants() {
    let id = Uuid::new_v4();
    let message = Message::RequestEnd { id };
    assert_eq!(message.id(), id);
  }

  #[test]
  fn id_extracts_ws_id_for_ws_variants() {
    let ws_id = Uuid::new_v4();
    let message = Message::WsClosed { ws_id };
    assert_eq!(message.id(), ws_id);
  }

  #[test]
  fn kind_never_collides() {
    use std::collections::HashSet;
    let kinds: HashSet<&'static str> = [
      Message::RequestStart {
        id: Uuid::nil(),
        domain: String::new(),
        method: String::new(),
        url: String::new(),
        headers: BTreeMap::new(),
        has_body: false,
      },
      Message::RequestData {
        id: Uuid::nil(),
        chunk: Bytes::new(),
      },
      Message::RequestEnd { id: Uuid::nil() },
      Message::RequestAborted { id: Uuid::nil() },
      Message::Register {
        id: Uuid::nil(),
        api_key: String::new(),
        domain: String::new(),
      },
      Message::Registered { id: Uuid::nil() },
    ]
    .iter()
    .map(Message::kind)
    .collect();
    assert_eq!(kinds.len(), 6);
  }
}
