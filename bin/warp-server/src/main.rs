mod config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();

  let (server_config, log_config) = config::load()?;
  logger::init(&log_config)?;

  tracing::info!("warp-server v{}", env!("CARGO_PKG_VERSION"));
  tracing::info!("{server_config:?}");

  warp_server::serve(server_config).await
}
