//! Layered configuration for `warp-server`, combining (highest
//! priority first) CLI flags, environment variables, an optional TOML
//! config file, and built-in defaults — the same four-tier
//! precedence `warp-client` uses.

use std::path::{Path, PathBuf};

use clap::Parser;
use config::ConfigLoader;
use logger::LogConfig;
use serde::Deserialize;
use warp_server::ServerConfig;

/// `warp-server` command line arguments. A value set here always wins
/// over the environment and the config file.
#[derive(Parser, Debug)]
#[command(name = "warp-server", author, about, version)]
pub struct CliArgs {
  /// Path to a TOML config file. Can be passed multiple times; later
  /// files win on conflicting keys.
  #[arg(long, short = 'c')]
  pub config_path: Option<Vec<PathBuf>>,

  /// Port to listen on for public HTTP traffic and client upgrades.
  #[arg(long, short = 'p')]
  pub port: Option<u16>,

  /// Address to bind the listener to.
  #[arg(long)]
  pub bind_ip: Option<String>,

  /// Accepted API key for client `register` messages. Can be passed
  /// multiple times.
  #[arg(long = "api-key")]
  pub api_keys: Vec<String>,

  /// WebSocket path clients upgrade on.
  #[arg(long)]
  pub connect_path: Option<String>,

  /// Log level: off, error, warn, info, debug, trace.
  #[arg(long)]
  pub log_level: Option<String>,
}

/// Environment variable overrides, all read from the `WARP_` prefix
/// plus the bare `DEBUG` toggle.
#[derive(Debug, Default, Deserialize)]
struct Env {
  #[serde(default)]
  warp_config_path: Vec<PathBuf>,
  warp_port: Option<u16>,
  warp_bind_ip: Option<String>,
  /// Comma-separated; envy has no native list support, so this is
  /// split by hand below.
  warp_api_keys: Option<String>,
  warp_connect_path: Option<String>,
  warp_log_level: Option<String>,
  /// `DEBUG=1` forces verbose logging regardless of any configured
  /// level.
  debug: Option<String>,
}

/// The shape of the optional TOML file: server fields flattened
/// alongside a nested `[logging]` table.
#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
  #[serde(flatten)]
  server: ServerConfig,
  #[serde(default)]
  logging: LogConfig,
}

pub fn load() -> anyhow::Result<(ServerConfig, LogConfig)> {
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

  let env_api_keys: Vec<String> = env
    .warp_api_keys
    .map(|raw| {
      raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect()
    })
    .unwrap_or_default();

  let server = ServerConfig {
    bind_ip: args.bind_ip.or(env.warp_bind_ip).unwrap_or(file.server.bind_ip),
    port: args.port.or(env.warp_port).unwrap_or(file.server.port),
    api_keys: if !args.api_keys.is_empty() {
      args.api_keys
    } else if !env_api_keys.is_empty() {
      env_api_keys
    } else {
      file.server.api_keys
    },
    connect_path: args
      .connect_path
      .or(env.warp_connect_path)
      .unwrap_or(file.server.connect_path),
  };

  let mut log_level = args
    .log_level
    .or(env.warp_log_level)
    .map(|raw| parse_log_level(&raw))
    .unwrap_or(file.logging.level);
  if env.debug.as_deref() == Some("1") {
    log_level = logger::LogLevel::Debug;
  }

  let logging = LogConfig { level: log_level, ..file.logging };

  Ok((server, logging))
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
