//! IoT Gateway
//!
//! Bridges framed TCP/UDP/MQTT-tunneled device links to a thing-model MQTT
//! broker. This binary runs the gateway with the bundled `RawBytesHandler`;
//! embedders with a concrete device byte protocol depend on this crate as a
//! library and call `iotgateway::Gateway::new` with their own
//! `ProtocolHandler` instead of running this binary.

use anyhow::Result;
use iotgateway::config::GatewayConfig;
use iotgateway::protocol::RawBytesHandler;
use iotgateway::shutdown::ShutdownCoordinator;
use iotgateway::Gateway;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("======================================");
    info!("  IoT Gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("======================================");

    let config = match GatewayConfig::load() {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            info!("  Product key: {}", cfg.server.product_key);
            info!("  Device key: {}", cfg.server.device_key);
            info!("  Net type: {:?}", cfg.server.net_type);
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            error!("Please ensure /etc/iotgateway/config.yaml exists and is valid");
            std::process::exit(1);
        }
    };

    let shutdown = ShutdownCoordinator::install();
    let cancel = shutdown.token();

    let gateway = match Gateway::new(
        config,
        |bus| Arc::new(RawBytesHandler { bus }),
        cancel.clone(),
    )
    .await
    {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("Failed to start gateway: {}", e);
            std::process::exit(1);
        }
    };

    info!("Gateway running. Press Ctrl+C to stop.");
    gateway.run(cancel).await;

    info!("Gateway shutdown complete");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}
