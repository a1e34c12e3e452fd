use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // rustls needs an explicit crypto provider selection before any TLS
    // engine is built.
    let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();

    // Use JSON logs in production (RICOCHET_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("RICOCHET_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("ricochet_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }

    let config = ricochet_server::config::ServerConfig::parse();
    tracing::info!("Starting bouncer on {}", config.listen_addr);
    if config.tls_enabled() {
        tracing::info!("TLS enabled on {}", config.tls_listen_addr);
    }

    let server = ricochet_server::server::Server::new(config)?;
    server.run().await
}
