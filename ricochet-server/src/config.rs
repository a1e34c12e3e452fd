//! Server configuration.

use std::path::PathBuf;

use clap::Parser;

/// Command-line and environment configuration for the bouncer.
#[derive(Parser, Debug, Clone)]
#[command(name = "ricochet-server", about = "Multi-user IRC bouncer")]
pub struct ServerConfig {
    /// Address for plaintext client connections.
    #[arg(long, env = "RICOCHET_LISTEN", default_value = "127.0.0.1:6667")]
    pub listen_addr: String,

    /// Address for TLS client connections (used when a cert and key are
    /// configured).
    #[arg(long, env = "RICOCHET_TLS_LISTEN", default_value = "127.0.0.1:6697")]
    pub tls_listen_addr: String,

    /// PEM file with the TLS certificate chain.
    #[arg(long, env = "RICOCHET_TLS_CERT")]
    pub tls_cert: Option<String>,

    /// PEM file with the TLS private key.
    #[arg(long, env = "RICOCHET_TLS_KEY")]
    pub tls_key: Option<String>,

    /// Name the virtual server entity presents to clients.
    #[arg(long, env = "RICOCHET_SERVER_NAME", default_value = "ricochet.bnc")]
    pub server_name: String,

    /// Nickname of the bouncer's bot; `PRIVMSG <bot>` addresses the
    /// bouncer itself.
    #[arg(long, env = "RICOCHET_BOT_NICK", default_value = "-BNC")]
    pub bot_nick: String,

    /// Path to the account store (TOML). Accounts are in-memory only
    /// when omitted.
    #[arg(long, env = "RICOCHET_ACCOUNTS")]
    pub accounts_file: Option<PathBuf>,
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }
}
