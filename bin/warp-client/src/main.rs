mod config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();

  let (client_config, log_config) = config::load()?;
  logger::init(&log_config)?;

  tracing::info!("warp-client v{}", env!("CARGO_PKG_VERSION"));
  tracing::info!(
    "claiming {} on {} -> {}",
    client_config.domain,
    client_config.server,
    client_config.local_addr
  );

  let connection = warp_client::connect(client_config).await?;

  match connection.registered.await {
    Ok(()) => tracing::info!("registered"),
    Err(_) => {
      anyhow::bail!("connection closed before the server acknowledged registration")
    }
  }

  match connection.closed.await {
    Ok(Some(e)) => tracing::warn!("connection closed: {e:#}"),
    Ok(None) => tracing::info!("connection closed"),
    Err(_) => tracing::info!("connection dropped"),
  }

  Ok(())
}
