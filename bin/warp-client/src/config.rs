//! Layered configuration for `warp-client`: CLI flags over
//! environment variables over an optional TOML file over built-in
//! defaults, matching `warp-server`'s loader.

use std::path::{Path, PathBuf};

use clap::Parser;
use config::ConfigLoader;
use logger::LogConfig;
use serde::Deserialize;
use warp_client::ClientConfig;

/// `warp-client` command line arguments.
#[derive(Parser, Debug)]
#[command(name = "warp-client", author, about, version)]
pub struct CliArgs {
  /// Path to a TOML config file. Can be passed multiple times; later
  /// files win on conflicting keys.
  #[arg(long, short = 'c')]
  pub config_path: Option<Vec<PathBuf>>,

  /// Server base URL, e.g. `https://warp.example.com`.
  #[arg(long)]
  pub server: Option<String>,

  /// API key to present at `register` time.
  #[arg(long)]
  pub api_key: Option<String>,

  /// Domain to claim on the server.
  #[arg(long)]
  pub domain: Option<String>,

  /// Local address to forward tunnelled requests to.
  #[arg(long)]
  pub local_addr: Option<String>,

  /// WebSocket path to upgrade on.
  #[arg(long)]
  pub connect_path: Option<String>,

  /// Log level: off, error, warn, info, debug, trace.
  #[arg(long)]
  pub log_level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Env {
  #[serde(default)]
  warp_config_path: Vec<PathBuf>,
  warp_server: Option<String>,
  warp_api_key: Option<String>,
  warp_domain: Option<String>,
  warp_local_addr: Option<String>,
  warp_connect_path: Option<String>,
  warp_log_level: Option<String>,
  debug: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
  server: Option<String>,
  #[serde(rename = "apiKey")]
  api_key: Option<String>,
  domain: Option<String>,
  #[serde(rename = "localAddr")]
  local_addr: Option<String>,
  #[serde(default)]
  connect_path: Option<String>,
  #[serde(default)]
  logging: LogConfig,
}

pub fn load() -> anyhow::Result<(ClientConfig, LogConfig)> {
  let args = CliArgs::parse();
  let env: Env = envy::from_env().unwrap_or_default();

  let config_paths: Vec<PathBuf> = args
    .config_path
    .clone()
    .filter(|p| !p.is_empty())
    .unwrap_or_else(|| env.warp_config_path.clone());

  let file = if config_paths.is_empty() {
    FileConfig::default()
  } else {
    let paths: Vec<&Path> =
      config_paths.iter().map(PathBuf::as_path).collect();
    (ConfigLoader { paths: &paths, debug_print: false }).load()?
  };

  let server = args
    .server
    .or(env.warp_server)
    .or(file.server)
    .ok_or_else(|| anyhow::anyhow!("missing required `server` (--server / WARP_SERVER / config file)"))?;
  let api_key = args
    .api_key
    .or(env.warp_api_key)
    .or(file.api_key)
    .ok_or_else(|| anyhow::anyhow!("missing required `api-key` (--api-key / WARP_API_KEY / config file)"))?;
  let domain = args
    .domain
    .or(env.warp_domain)
    .or(file.domain)
    .ok_or_else(|| anyhow::anyhow!("missing required `domain` (--domain / WARP_DOMAIN / config file)"))?;
  let local_addr = args
    .local_addr
    .or(env.warp_local_addr)
    .or(file.local_addr)
    .ok_or_else(|| anyhow::anyhow!("missing required `local-addr` (--local-addr / WARP_LOCAL_ADDR / config file)"))?;
  let connect_path = args
    .connect_path
    .or(env.warp_connect_path)
    .or(file.connect_path)
    .unwrap_or_else(|| warp_protocol::DEFAULT_CONNECT_PATH.to_string());

  let config = ClientConfig { server, api_key, domain, local_addr, connect_path };

  let mut log_level = args
    .log_level
    .or(env.warp_log_level)
    .map(|raw| parse_log_level(&raw))
    .unwrap_or(file.logging.level);
  if env.debug.as_deref() == Some("1") {
    log_level = logger::LogLevel::Debug;
  }

  let logging = LogConfig { level: log_level, ..file.logging };

  Ok((config, logging))
}

fn parse_log_level(raw: &str) -> logger::LogLevel {
  use logger::LogLevel::*;
  match raw.to_ascii_lowercase().as_str() {
    "off" => Off,
    "error" => Error,
    "warn" | "warning" => Warn,
    "debug" => Debug,
    "trace" => Trace,
    _ => Info,
  }
}
