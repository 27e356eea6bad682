use std::net::SocketAddr;

use anyhow::*;
use edgekv::config::{default_config, CompositeConfig, Config, EnvConfig};


#[tokio::main]
async fn main() -> Result<()> {
    let executable_name = std::env::args().next().unwrap_or_else(||"unknown".to_string());
    println!("starting {executable_name}...");

    let config = CompositeConfig::from_configs(
        Box::new(EnvConfig::from_env()),
        Box::new(default_config())
    );
    edgekv::init_logging(&config);

    let store = edgekv::open_store(&config).await
    .context("could not open key value store")?;

    let router = edgekv::build_router(store, config.clone())?;

    let bind_address = config.get("BIND_ADDRESS")?;

    let listener = tokio::net::TcpListener::bind(&bind_address).await
    .with_context(||format!("could not bind to {bind_address}"))?;
    log::info!("binding, server available under http://{bind_address}");
    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
    .await?;

    Ok(())
}
