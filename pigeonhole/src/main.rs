mod cli;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pigeonhole_core::api::{router, IpamService};
use pigeonhole_core::config::{AllocatorConfig, ServerConfig};
use pigeonhole_core::error::{Error, Result};
use pigeonhole_core::janitor::Janitor;
use pigeonhole_core::kv::{KvStore, MemoryStore, RedbStore};

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            bind,
            data_dir,
            ephemeral,
        } => serve(bind, data_dir, ephemeral).await,
    }
}

async fn serve(
    bind: Option<std::net::SocketAddr>,
    data_dir: Option<String>,
    ephemeral: bool,
) -> Result<()> {
    let mut server_config = ServerConfig::default();
    if let Some(bind) = bind {
        server_config.bind_address = bind;
    }
    if let Some(data_dir) = data_dir {
        server_config.data_dir = data_dir;
    }
    let allocator_config = AllocatorConfig::default();

    let kv: Arc<dyn KvStore> = if ephemeral {
        info!("using in-memory store; state will not survive a restart");
        Arc::new(MemoryStore::new())
    } else {
        let path = std::path::Path::new(&server_config.data_dir);
        std::fs::create_dir_all(path).map_err(|e| Error::store("create data dir", e))?;
        Arc::new(RedbStore::open(path.join("pigeonhole.redb"))?)
    };

    let janitor = Janitor::new(Arc::clone(&kv), allocator_config.clone())
        .spawn()
        .await?;

    let service = Arc::new(IpamService::new(Arc::clone(&kv), allocator_config));
    let app = router(
        service,
        Duration::from_millis(server_config.request_timeout_ms),
    );

    let listener = tokio::net::TcpListener::bind(server_config.bind_address)
        .await
        .map_err(|e| Error::store("bind listener", e))?;
    info!("listening on {}", server_config.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .map_err(|e| Error::store("serve", e))?;

    janitor.shutdown().await;
    Ok(())
}
