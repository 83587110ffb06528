//! MTAP DUT simulator
//!
//! Reads `MTAP_*` settings from the environment, serves until Ctrl-C.

use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mtap_dut::{DutResult, DutServer, ServerConfig};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match serve().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "dut failed");
            ExitCode::FAILURE
        }
    }
}

async fn serve() -> DutResult<()> {
    let config = ServerConfig::from_env()?;
    let server = DutServer::bind(&config).await?;
    let shutdown = server.shutdown_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            shutdown.shutdown();
        }
    });

    server.run().await
}
