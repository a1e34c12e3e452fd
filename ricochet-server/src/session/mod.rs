//! Per-connection session handling.
//!
//! Each accepted client gets one [`Session`] running on its own task,
//! which owns the byte channel outright. The task interleaves two things:
//! bytes arriving from the client (split into protocol lines and
//! dispatched one at a time, in order) and messages other tasks have
//! queued for this client. Lines from an unauthenticated client feed the
//! registration state machine; once bound to an account, lines are either
//! bot commands or relayed upstream untouched.

mod auth;
mod shared;

pub use auth::{AuthState, Credentials, Registration};
pub use shared::{Outbound, SessionShared};

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::accounts::{Account, AccountStore};
use crate::channel::ClientChannel;
use crate::commands::DispatchOutcome;
use crate::irc;
use crate::registry::SessionRegistry;

/// Outbound queue depth per session.
pub const OUTBOUND_QUEUE: usize = 4096;

/// Longest protocol line accepted from a client.
const MAX_LINE_LEN: usize = 8192;

/// In-band escape for addressing the bouncer directly.
const BOT_ESCAPE: &str = "DFBNC";

enum Wake {
    Data(usize),
    Eof,
    ReadFailed(io::Error),
    Out(Outbound),
    QueueGone,
}

/// One client connection's protocol state.
pub struct Session {
    shared: Arc<SessionShared>,
    registry: Arc<SessionRegistry>,
    store: Arc<AccountStore>,
    state: AuthState,
    closing: bool,
}

impl Session {
    /// Create a session and register it; the caller spawns
    /// [`run`](Session::run) with the channel and the returned queue.
    pub fn attach(
        registry: &Arc<SessionRegistry>,
        store: &Arc<AccountStore>,
        server_name: &str,
        bot_nick: &str,
        peer: &str,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let server_name = server_name.to_string();
        let bot_nick = bot_nick.to_string();
        let shared = registry.register(peer, move |id| {
            SessionShared::new(id, server_name, bot_nick, tx)
        });
        let session = Self {
            shared,
            registry: registry.clone(),
            store: store.clone(),
            state: AuthState::new(),
            closing: false,
        };
        (session, rx)
    }

    pub fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    /// Serve this client until it quits, fails, or is closed from
    /// outside. Consumes the session; all cleanup happens before return.
    pub async fn run<S>(mut self, mut channel: ClientChannel<S>, mut rx: mpsc::Receiver<Outbound>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tracing::info!(session_id = %self.shared.id(), "client connected");
        self.shared
            .send_bot_message(&format!("Welcome to ricochet ({})", env!("CARGO_PKG_VERSION")));

        let mut read_buf = vec![0u8; 4096];
        let mut pending: Vec<u8> = Vec::new();

        'serve: loop {
            let wake = {
                let read = channel.read(&mut read_buf);
                tokio::pin!(read);
                tokio::select! {
                    r = &mut read => match r {
                        Ok(0) => Wake::Eof,
                        Ok(n) => Wake::Data(n),
                        Err(e) => Wake::ReadFailed(e),
                    },
                    out = rx.recv() => match out {
                        Some(out) => Wake::Out(out),
                        None => Wake::QueueGone,
                    },
                }
            };

            match wake {
                Wake::Data(n) => {
                    pending.extend_from_slice(&read_buf[..n]);
                    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                        let raw: Vec<u8> = pending.drain(..=pos).collect();
                        let line = String::from_utf8_lossy(&raw);
                        let line = line.trim_end_matches(['\r', '\n']);
                        if line.trim().is_empty() {
                            continue;
                        }
                        tracing::debug!(session_id = %self.shared.id(), "<- {line}");
                        self.process_line(line);
                        if self.closing {
                            break 'serve;
                        }
                    }
                    // An unterminated line this long is abuse; drop it.
                    if pending.len() > MAX_LINE_LEN {
                        tracing::warn!(
                            session_id = %self.shared.id(),
                            len = pending.len(),
                            "line too long, dropping"
                        );
                        self.shared
                            .send_numeric("417", &["*"], "Input line was too long");
                        pending.clear();
                    }
                }
                Wake::Eof => break,
                Wake::ReadFailed(e) => {
                    tracing::warn!(session_id = %self.shared.id(), "read error: {e}");
                    break;
                }
                Wake::Out(Outbound::Line(line)) => {
                    if channel.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                }
                Wake::Out(Outbound::Close) => break,
                Wake::QueueGone => break,
            }
        }

        self.teardown(&mut channel, &mut rx).await;
    }

    /// Flush what is already queued (auth errors, termination notices),
    /// close the channel, and drop out of the registry unless a sweep
    /// owns that cleanup.
    async fn teardown<S>(self, channel: &mut ClientChannel<S>, rx: &mut mpsc::Receiver<Outbound>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        while let Ok(out) = rx.try_recv() {
            if let Outbound::Line(line) = out {
                if channel.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        }
        let _ = channel.close().await;

        if !self.registry.sweep_in_progress() {
            self.registry.unregister(self.shared.id());
        }
        if let AuthState::Authenticated { account } = &self.state {
            account.session_disconnected(&self.shared);
        }
        tracing::info!(session_id = %self.shared.id(), "client disconnected");
    }

    /// Dispatch one complete protocol line.
    fn process_line(&mut self, line: &str) {
        let mut tokens = irc::tokenize(line);
        let Some(first) = tokens.first_mut() else {
            return;
        };
        *first = first.to_ascii_uppercase();

        // QUIT short-circuits everything, in any state.
        if tokens[0] == "QUIT" {
            self.closing = true;
            return;
        }

        if self.state.is_authenticated() {
            self.process_authenticated(line, &tokens);
        } else {
            self.process_unauthenticated(&tokens);
        }
    }

    /// Collect registration fields and attempt the login the moment all
    /// of them are present.
    fn process_unauthenticated(&mut self, tokens: &[String]) {
        if tokens.len() < 2 {
            self.shared.send_numeric(
                irc::ERR_NEEDMOREPARAMS,
                &[tokens[0].as_str()],
                "Not enough parameters",
            );
            return;
        }

        let mut prompt_for_password = false;
        let attempt = {
            let AuthState::Unauthenticated(reg) = &mut self.state else {
                return;
            };
            match tokens[0].as_str() {
                "USER" => {
                    // PASS may have supplied the username already.
                    if reg.username.is_none() {
                        reg.username = Some(tokens[1].clone());
                    }
                    reg.realname = Some(tokens[tokens.len() - 1].clone());
                    prompt_for_password = reg.nickname.is_some() && reg.password.is_none();
                }
                "NICK" => {
                    reg.nickname = Some(tokens[1].clone());
                    self.shared.set_nickname(&tokens[1]);
                    prompt_for_password = reg.realname.is_some() && reg.password.is_none();
                }
                "PASS" => {
                    let last = &tokens[tokens.len() - 1];
                    match last.split_once(':') {
                        Some((username, password)) => {
                            reg.username = Some(username.to_string());
                            reg.password = Some(password.to_string());
                        }
                        None => reg.password = Some(last.clone()),
                    }
                }
                _ => {
                    self.shared.send_numeric(
                        irc::ERR_NOTREGISTERED,
                        &[tokens[0].as_str()],
                        "You must login first.",
                    );
                }
            }
            reg.credentials()
        };

        if prompt_for_password {
            self.send_password_prompt();
        }
        if let Some(credentials) = attempt {
            self.try_login(credentials, &tokens[0]);
        }
    }

    fn send_password_prompt(&self) {
        self.shared.send_bot_message("Please enter your password.");
        self.shared.send_bot_message("This can be done using either: ");
        self.shared
            .send_bot_message("    /QUOTE PASS [<username>:]<password>");
        self.shared
            .send_bot_message("    /RAW PASS [<username>:]<password>");
    }

    /// All four registration fields are present: bootstrap the very first
    /// account if the store is empty, then verify.
    fn try_login(&mut self, credentials: Credentials, trigger: &str) {
        if self.store.count() == 0 {
            let account = self
                .store
                .create_account(&credentials.username, &credentials.password);
            account.set_admin(true);
            self.shared
                .send_bot_message("You are the first user of this bouncer, and have been made admin");
            if let Err(e) = self.store.persist_all() {
                tracing::error!("failed to persist accounts after bootstrap: {e}");
            }
        }

        if !self
            .store
            .check_password(&credentials.username, &credentials.password)
        {
            self.shared.send_numeric(
                irc::ERR_PASSWDMISMATCH,
                &[trigger],
                "Password incorrect, or account not found",
            );
            self.closing = true;
            return;
        }
        let Some(account) = self.store.get(&credentials.username) else {
            // The store verified a password for an account it cannot
            // produce; treat as a failed login.
            self.shared.send_numeric(
                irc::ERR_PASSWDMISMATCH,
                &[trigger],
                "Password incorrect, or account not found",
            );
            self.closing = true;
            return;
        };

        self.shared.bind_account(account.clone());
        self.state = AuthState::Authenticated {
            account: account.clone(),
        };
        tracing::info!(
            session_id = %self.shared.id(),
            account = %account.name(),
            "login successful"
        );

        self.shared.send_bot_message("You are now logged in");
        if account.is_admin() {
            self.shared.send_bot_message("This is an Admin account");
        }
        if account.take_first_use() {
            self.handle_bot_command(&["firsttime".to_string()]);
            if account.is_admin() {
                self.shared.send_bot_message("");
                self.handle_bot_command(&["firsttime".to_string(), "admin".to_string()]);
            }
            if let Err(e) = self.store.persist_all() {
                tracing::error!("failed to persist accounts after first use: {e}");
            }
        }
        account.session_connected(&self.shared);
    }

    /// Route an authenticated line: bot command or upstream relay.
    fn process_authenticated(&mut self, raw_line: &str, tokens: &[String]) {
        if tokens[0] == "PRIVMSG" && tokens.len() > 2 {
            if tokens[1].eq_ignore_ascii_case(self.shared.bot_nick()) {
                let bits: Vec<String> = tokens[2]
                    .split_whitespace()
                    .map(str::to_string)
                    .collect();
                self.handle_bot_command(&bits);
                return;
            }
        } else if tokens[0] == BOT_ESCAPE && tokens.len() > 1 {
            self.handle_bot_command(&tokens[1..]);
            return;
        }

        let AuthState::Authenticated { account } = &self.state else {
            return;
        };
        match account.upstream_handler() {
            Some(handler) => handler.on_line_received(&self.shared, raw_line, tokens),
            None => {
                tracing::debug!(
                    session_id = %self.shared.id(),
                    "no upstream connection; line dropped"
                );
            }
        }
    }

    /// Hand a command to the account's dispatcher. A failing command
    /// never takes the session down.
    fn handle_bot_command(&mut self, bits: &[String]) {
        let AuthState::Authenticated { account } = &self.state else {
            return;
        };
        let account: Arc<Account> = account.clone();
        let name = bits.first().map(String::as_str).unwrap_or("").to_string();
        match account.command_dispatcher().dispatch(&self.shared, bits) {
            DispatchOutcome::Handled => {}
            DispatchOutcome::NotFound => self
                .shared
                .send_bot_message(&format!("Unknown command '{name}' Please try 'ShowCommands'")),
            DispatchOutcome::Failed(message) => self
                .shared
                .send_bot_message(&format!("Exception with command '{name}': {message}")),
        }
    }
}
