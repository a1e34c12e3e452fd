//! Listeners and the accept loops.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls;

use crate::accounts::AccountStore;
use crate::channel::ClientChannel;
use crate::commands::CommandRouter;
use crate::config::ServerConfig;
use crate::registry::SessionRegistry;
use crate::session::Session;
use crate::tls::TlsChannel;

pub struct Server {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    store: Arc<AccountStore>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let router = CommandRouter::with_builtins();
        let store = match &config.accounts_file {
            Some(path) => AccountStore::open(path.clone(), router)
                .with_context(|| format!("failed to open account store {}", path.display()))?,
            None => {
                tracing::warn!("no --accounts-file; accounts will not survive a restart");
                AccountStore::in_memory(router)
            }
        };
        Ok(Self {
            config,
            registry: SessionRegistry::new(),
            store,
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<AccountStore> {
        &self.store
    }

    /// Run until ctrl-c, then sweep every session and persist accounts.
    pub async fn run(self) -> Result<()> {
        let tls_config = self.build_tls_config()?;

        let plain_listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", self.config.listen_addr))?;
        tracing::info!("Plain listener on {}", self.config.listen_addr);

        if let Some(tls_config) = tls_config {
            let tls_listener = TcpListener::bind(&self.config.tls_listen_addr)
                .await
                .with_context(|| format!("failed to bind {}", self.config.tls_listen_addr))?;
            tracing::info!("TLS listener on {}", self.config.tls_listen_addr);

            let registry = self.registry.clone();
            let store = self.store.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                loop {
                    match tls_listener.accept().await {
                        Ok((stream, peer)) => {
                            let engine = match rustls::ServerConnection::new(tls_config.clone()) {
                                Ok(engine) => engine,
                                Err(e) => {
                                    tracing::error!("TLS engine setup failed: {e}");
                                    continue;
                                }
                            };
                            let channel = ClientChannel::tls(TlsChannel::new(stream, engine));
                            spawn_session(&registry, &store, &config, channel, &peer.to_string());
                        }
                        Err(e) => tracing::error!("TLS accept error: {e}"),
                    }
                }
            });
        }

        loop {
            tokio::select! {
                accepted = plain_listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let channel = ClientChannel::plain(stream);
                        spawn_session(
                            &self.registry,
                            &self.store,
                            &self.config,
                            channel,
                            &peer.to_string(),
                        );
                    }
                    Err(e) => tracing::error!("accept error: {e}"),
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        tracing::info!("shutting down");
        self.registry.close_all("Shutting down");
        if let Err(e) = self.store.persist_all() {
            tracing::error!("failed to persist accounts on shutdown: {e}");
        }
        Ok(())
    }

    fn build_tls_config(&self) -> Result<Option<Arc<rustls::ServerConfig>>> {
        if !self.config.tls_enabled() {
            return Ok(None);
        }

        let cert_path = self.config.tls_cert.as_deref().unwrap();
        let key_path = self.config.tls_key.as_deref().unwrap();

        let cert_pem = std::fs::read(cert_path)
            .with_context(|| format!("Failed to read TLS cert: {cert_path}"))?;
        let key_pem = std::fs::read(key_path)
            .with_context(|| format!("Failed to read TLS key: {key_path}"))?;

        let certs: Vec<_> = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to parse TLS certificates")?;
        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .context("Failed to parse TLS private key")?
            .context("No private key found in PEM file")?;

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("Invalid TLS configuration")?;

        Ok(Some(Arc::new(config)))
    }
}

fn spawn_session(
    registry: &Arc<SessionRegistry>,
    store: &Arc<AccountStore>,
    config: &ServerConfig,
    channel: ClientChannel<TcpStream>,
    peer: &str,
) {
    let (session, rx) = Session::attach(
        registry,
        store,
        &config.server_name,
        &config.bot_nick,
        peer,
    );
    tokio::spawn(session.run(channel, rx));
}
