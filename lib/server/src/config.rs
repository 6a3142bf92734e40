use warp_protocol::DEFAULT_CONNECT_PATH;

/// Everything `serve`/`serve_handler` need to stand up the public
/// tunnel endpoint.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ServerConfig {
  #[serde(default = "default_bind_ip")]
  pub bind_ip: String,
  #[serde(default = "default_port")]
  pub port: u16,
  /// Accepted `apiKey` values for `register` messages.
  #[serde(default)]
  pub api_keys: Vec<String>,
  #[serde(default = "default_connect_path")]
  pub connect_path: String,
}

fn default_bind_ip() -> String {
  "0.0.0.0".to_string()
}

fn default_port() -> u16 {
  8080
}

fn default_connect_path() -> String {
  DEFAULT_CONNECT_PATH.to_string()
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      bind_ip: default_bind_ip(),
      port: default_port(),
      api_keys: Vec::new(),
      connect_path: default_connect_path(),
    }
  }
}
