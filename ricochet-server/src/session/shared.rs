//! The cross-task face of a session.
//!
//! The session task owns its channel exclusively; everything other tasks
//! (registry sweeps, broadcasts, bot commands) want to tell the client is
//! queued here and written by the owning task. This is also where the
//! three outbound message shapes live, so every sender formats lines the
//! same way:
//!
//! - before the upstream greeting: `NOTICE AUTH :- <text>`
//! - after it, contact method "server notice": `:<server> NOTICE <nick> :<text>`
//! - after it, otherwise: `:<bot>!bot@<server> <type> <nick> :<text>`

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::accounts::{Account, ContactMethod};
use crate::irc::Message;

/// Messages queued for a session's owning task.
pub enum Outbound {
    /// A complete protocol line, already framed (no terminator).
    Line(String),
    /// Stop serving this client.
    Close,
}

/// Shared, registry-visible session state.
pub struct SessionShared {
    id: String,
    server_name: String,
    bot_nick: String,
    tx: mpsc::Sender<Outbound>,
    nickname: Mutex<Option<String>>,
    /// Whether the upstream session has greeted this client yet; governs
    /// message shaping.
    post_greeting: AtomicBool,
    account: Mutex<Option<Arc<Account>>>,
}

impl SessionShared {
    pub fn new(
        id: String,
        server_name: String,
        bot_nick: String,
        tx: mpsc::Sender<Outbound>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            server_name,
            bot_nick,
            tx,
            nickname: Mutex::new(None),
            post_greeting: AtomicBool::new(false),
            account: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn bot_nick(&self) -> &str {
        &self.bot_nick
    }

    pub fn nickname(&self) -> Option<String> {
        self.nickname.lock().clone()
    }

    pub fn set_nickname(&self, nick: &str) {
        *self.nickname.lock() = Some(nick.to_string());
    }

    pub fn post_greeting(&self) -> bool {
        self.post_greeting.load(Ordering::Relaxed)
    }

    /// Flip once the upstream greeting has been relayed; bot messages
    /// switch from auth notices to normal framing.
    pub fn set_post_greeting(&self, value: bool) {
        self.post_greeting.store(value, Ordering::Relaxed);
    }

    pub fn bound_account(&self) -> Option<Arc<Account>> {
        self.account.lock().clone()
    }

    /// Bind the account this session authenticated into. A session binds
    /// at most once; later calls are ignored.
    pub fn bind_account(&self, account: Arc<Account>) {
        let mut slot = self.account.lock();
        if slot.is_none() {
            *slot = Some(account);
        }
    }

    /// Queue one already-framed protocol line for the client.
    pub fn send_line(&self, line: String) {
        tracing::trace!(session_id = %self.id, "-> {line}");
        if self.tx.try_send(Outbound::Line(format!("{line}\r\n"))).is_err() {
            tracing::warn!(session_id = %self.id, "outbound queue full or closed; line dropped");
        }
    }

    /// Ask the owning task to stop serving this client.
    pub fn request_close(&self) {
        let _ = self.tx.try_send(Outbound::Close);
    }

    fn nick_or_star(&self) -> String {
        self.nickname.lock().clone().unwrap_or_else(|| "*".to_string())
    }

    /// A message from the bouncer itself, shaped by connection phase and
    /// the account's contact preference.
    pub fn send_bot_message(&self, text: &str) {
        if !self.post_greeting() {
            self.send_line(format!("NOTICE AUTH :- {text}"));
            return;
        }
        match self.bound_account() {
            Some(account) => match account.contact_method() {
                ContactMethod::ServerNotice => self.send_server_line("NOTICE", text),
                method => self.send_bot_line(method.line_type(), text),
            },
            None => self.send_server_line("NOTICE", text),
        }
    }

    /// A line framed as coming from the virtual bot entity.
    pub fn send_bot_line(&self, line_type: &str, text: &str) {
        let source = format!("{}!bot@{}", self.bot_nick, self.server_name);
        let nick = self.nick_or_star();
        self.send_line(
            Message::from_source(&source, line_type, vec![nick.as_str(), text]).to_string(),
        );
    }

    /// A line framed as coming from the virtual server entity.
    pub fn send_server_line(&self, line_type: &str, text: &str) {
        let nick = self.nick_or_star();
        self.send_line(
            Message::from_server(&self.server_name, line_type, vec![nick.as_str(), text])
                .to_string(),
        );
    }

    /// A numeric-coded protocol reply.
    pub fn send_numeric(&self, numeric: &str, params: &[&str], text: &str) {
        let mut all: Vec<&str> = params.to_vec();
        all.push(text);
        self.send_line(Message::from_server(&self.server_name, numeric, all).to_string());
    }

    /// The notice sent ahead of an administrative shutdown sweep.
    pub fn send_termination_notice(&self, reason: &str) {
        self.send_line(format!(
            ":{} NOTICE :Connection terminating ({reason})",
            self.server_name
        ));
    }
}
