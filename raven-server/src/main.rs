use std::path::Path;

use raven_core::ServerConfig;
use raven_server::server::Server;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = load_config()?;
    let server = Server::bind(config).await?;
    tracing::info!("raven listening on {}", server.local_addr()?);
    server.serve().await?;
    Ok(())
}

/// Config file via `--config <path>`, individual overrides via CLI args
/// or environment variables (CLI wins).
fn load_config() -> anyhow::Result<ServerConfig> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = match arg_value(&args, "--config") {
        Some(path) => ServerConfig::load(Path::new(&path))?,
        None => ServerConfig::default(),
    };
    if let Some(listen) = arg_value(&args, "--listen").or_else(|| std::env::var("RAVEN_LISTEN").ok())
    {
        config.listen.0 = listen;
    }
    if let Some(anchor) = arg_value(&args, "--anchor").or_else(|| std::env::var("RAVEN_ANCHOR").ok())
    {
        config.engine.anchor = anchor.into();
    }
    if let Some(master) = arg_value(&args, "--master").or_else(|| std::env::var("RAVEN_MASTER").ok())
    {
        config.engine.master = master;
    }
    Ok(config)
}

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].clone())
}
