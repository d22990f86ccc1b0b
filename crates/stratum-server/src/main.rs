//! stratum - HTTP API for the distributed LLM inference batching core

use std::sync::Arc;

use serde::Deserialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod error;
mod state;

use state::AppState;
use stratum_core::block::SimulatedDeviceBackend;
use stratum_core::step::SimulatedForwardRunner;
use stratum_core::{BatchManager, BlockManager, EngineConfig, ServerConfig};

/// Top-level config file shape: `[engine]` and `[server]` tables, each
/// deserialized into the core's own config structs so a deployment only
/// edits one `stratum.toml` rather than juggling two schemas.
#[derive(Debug, Deserialize, Default)]
struct Settings {
    #[serde(default)]
    engine: EngineConfig,
    #[serde(default)]
    server: ServerConfig,
}

fn load_settings() -> anyhow::Result<Settings> {
    let builder = config::Config::builder()
        .add_source(config::File::with_name("stratum").required(false))
        .add_source(
            config::Environment::with_prefix("STRATUM")
                .separator("__")
                .try_parsing(true),
        );
    let settings = builder.build()?;
    Ok(settings.try_deserialize().unwrap_or_default())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stratum_server=debug,stratum_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting stratum server");

    let Settings { engine, server } = load_settings()?;
    info!(?engine, "loaded engine config");

    // The simulated backend backs each pool with a real byte buffer sized to
    // the largest address `copy_*` ever indexes (`blocks_num * block_size`,
    // scaled by `block_host_memory_factor` for the host pool) rather than to
    // a device's nominal total/free capacity, which would allocate far more
    // memory than the configured pool ever uses.
    let device_bytes = (engine.blocks_num * engine.block_size) as u64;
    let host_bytes = (engine.blocks_num as f64 * engine.block_host_memory_factor) as u64
        * engine.block_size as u64;
    let backend = Arc::new(SimulatedDeviceBackend::new(
        engine.tensor_para_size,
        device_bytes,
        device_bytes,
        host_bytes,
    ));
    let block_manager = Arc::new(BlockManager::new(engine.clone(), backend));
    let manager = Arc::new(BatchManager::new(
        engine,
        block_manager.clone(),
        Arc::new(SimulatedForwardRunner),
        server.num_layer,
    ));
    manager.start();

    let state = AppState::new(manager.clone(), block_manager, server.cors_enabled);
    let app = api::create_router(state);

    let addr = format!("{}:{}", server.host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("server listening on http://{}", addr);

    axum::serve(listener, app).await?;

    manager.stop();
    Ok(())
}
