use warp_protocol::DEFAULT_CONNECT_PATH;

/// Everything `connect` needs to dial a server, claim a domain, and
/// forward traffic to a local endpoint.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ClientConfig {
  /// Server base URL, e.g. `https://warp.example.com`.
  pub server: String,
  #[serde(rename = "apiKey")]
  pub api_key: String,
  pub domain: String,
  /// Local endpoint to forward requests to, e.g. `http://127.0.0.1:3000`.
  #[serde(rename = "localAddr")]
  pub local_addr: String,
  #[serde(default = "default_connect_path")]
  pub connect_path: String,
}

fn default_connect_path() -> String {
  DEFAULT_CONNECT_PATH.to_string()
}
