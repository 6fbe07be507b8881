use std::sync::Arc;

use tracing::info;
use tracing_subscriber::fmt::writer::MakeWriterExt;

use msgbridge::config::BridgeConfig;
use msgbridge::media::MediaStore;
use msgbridge::service::BridgeService;
use msgbridge::session::{HttpPushTransport, PushTransport};
use msgbridge::store::{LibSqlStore, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let config = BridgeConfig::from_env()?;

    std::fs::create_dir_all(&config.log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "msgbridge.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(file_writer.and(std::io::stderr))
        .with_ansi(false)
        .with_target(false)
        .init();

    info!("msgbridge v{}", env!("CARGO_PKG_VERSION"));

    let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_local(&config.db_path).await?);

    let media = MediaStore::new(config.media_dir.clone(), config.temp_dir.clone());
    let mut transport = HttpPushTransport::new(
        config.push_gateway_url.clone(),
        config.push_poll_timeout,
        media,
    );
    if let Some(settings) = store.relay_settings().await? {
        transport = transport.with_app_credentials(&settings);
    }
    let transport: Arc<dyn PushTransport> = Arc::new(transport);

    let service = BridgeService::new(config, Arc::clone(&store), transport);
    service.start().await?;

    let health = service.health().await;
    info!(
        sessions = health.live_push_sessions,
        digest_jobs = health.digest_jobs,
        "Bridge running, Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    service.stop().await;

    Ok(())
}
