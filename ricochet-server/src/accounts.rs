//! Accounts and the account store.
//!
//! An [`Account`] is the persistent identity a client authenticates into;
//! any number of live sessions may be bound to the same account at once.
//! The store keeps salted SHA-256 password digests in a TOML file and
//! rewrites the whole file on [`AccountStore::persist_all`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::commands::CommandDispatcher;
use crate::session::SessionShared;
use crate::upstream::UpstreamHandler;

/// How bot messages reach this account's clients once the upstream
/// greeting has gone out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContactMethod {
    /// Notices framed as coming from the virtual server.
    ServerNotice,
    /// Notices framed as coming from the bot.
    #[default]
    BotNotice,
    /// Private messages framed as coming from the bot.
    BotPrivmsg,
}

impl ContactMethod {
    pub fn from_config(value: &str) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "SNOTICE" => Self::ServerNotice,
            "PRIVMSG" => Self::BotPrivmsg,
            _ => Self::BotNotice,
        }
    }

    pub fn as_config(self) -> &'static str {
        match self {
            Self::ServerNotice => "SNOTICE",
            Self::BotNotice => "NOTICE",
            Self::BotPrivmsg => "PRIVMSG",
        }
    }

    /// The IRC command used for bot-framed lines.
    pub fn line_type(self) -> &'static str {
        match self {
            Self::BotPrivmsg => "PRIVMSG",
            _ => "NOTICE",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("account store I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("account store parse: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("account store encode: {0}")]
    Encode(#[from] toml::ser::Error),
}

/// A single bouncer user.
pub struct Account {
    name: String,
    salt: String,
    password_hash: Mutex<String>,
    admin: AtomicBool,
    /// True until the account's first successful login has run its
    /// first-time help.
    first_use: AtomicBool,
    contact_method: Mutex<ContactMethod>,
    upstream: Mutex<Option<Arc<dyn UpstreamHandler>>>,
    dispatcher: Arc<dyn CommandDispatcher>,
}

impl Account {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_admin(&self) -> bool {
        self.admin.load(Ordering::Relaxed)
    }

    pub fn set_admin(&self, admin: bool) {
        self.admin.store(admin, Ordering::Relaxed);
    }

    pub fn is_first_use(&self) -> bool {
        self.first_use.load(Ordering::Relaxed)
    }

    /// Consume the first-use flag: true exactly once, on the first call.
    pub fn take_first_use(&self) -> bool {
        self.first_use.swap(false, Ordering::Relaxed)
    }

    pub fn contact_method(&self) -> ContactMethod {
        *self.contact_method.lock()
    }

    pub fn set_contact_method(&self, method: ContactMethod) {
        *self.contact_method.lock() = method;
    }

    pub fn upstream_handler(&self) -> Option<Arc<dyn UpstreamHandler>> {
        self.upstream.lock().clone()
    }

    pub fn set_upstream_handler(&self, handler: Option<Arc<dyn UpstreamHandler>>) {
        *self.upstream.lock() = handler;
    }

    pub fn command_dispatcher(&self) -> Arc<dyn CommandDispatcher> {
        self.dispatcher.clone()
    }

    /// A session finished authenticating against this account.
    pub fn session_connected(&self, session: &Arc<SessionShared>) {
        tracing::info!(account = %self.name, session_id = %session.id(), "session bound");
    }

    /// A session bound to this account went away.
    pub fn session_disconnected(&self, session: &Arc<SessionShared>) {
        tracing::info!(account = %self.name, session_id = %session.id(), "session unbound");
    }

    fn matches_password(&self, password: &str) -> bool {
        *self.password_hash.lock() == hash_password(&self.salt, password)
    }
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn new_salt() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct StoreFile {
    #[serde(default)]
    accounts: Vec<AccountRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AccountRecord {
    name: String,
    salt: String,
    password_hash: String,
    admin: bool,
    first_use: bool,
    contact_method: String,
}

/// The process-wide account collection. Lookup keys are lowercased
/// account names.
pub struct AccountStore {
    path: Option<PathBuf>,
    dispatcher: Arc<dyn CommandDispatcher>,
    accounts: Mutex<HashMap<String, Arc<Account>>>,
}

impl AccountStore {
    /// An empty store with no backing file (accounts live only for the
    /// process lifetime).
    pub fn in_memory(dispatcher: Arc<dyn CommandDispatcher>) -> Arc<Self> {
        Arc::new(Self {
            path: None,
            dispatcher,
            accounts: Mutex::new(HashMap::new()),
        })
    }

    /// Open a file-backed store, loading any existing accounts.
    pub fn open(path: PathBuf, dispatcher: Arc<dyn CommandDispatcher>) -> Result<Arc<Self>, StoreError> {
        let mut accounts = HashMap::new();
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let file: StoreFile = toml::from_str(&raw)?;
            for record in file.accounts {
                let account = Arc::new(Account {
                    salt: record.salt,
                    password_hash: Mutex::new(record.password_hash),
                    admin: AtomicBool::new(record.admin),
                    first_use: AtomicBool::new(record.first_use),
                    contact_method: Mutex::new(ContactMethod::from_config(&record.contact_method)),
                    upstream: Mutex::new(None),
                    dispatcher: dispatcher.clone(),
                    name: record.name,
                });
                accounts.insert(account.name.to_lowercase(), account);
            }
            tracing::info!(count = accounts.len(), path = %path.display(), "loaded accounts");
        }
        Ok(Arc::new(Self {
            path: Some(path),
            dispatcher,
            accounts: Mutex::new(accounts),
        }))
    }

    pub fn count(&self) -> usize {
        self.accounts.lock().len()
    }

    /// Create an account. An existing account with the same name is
    /// replaced; callers check for duplicates first if that matters.
    pub fn create_account(&self, username: &str, password: &str) -> Arc<Account> {
        let salt = new_salt();
        let account = Arc::new(Account {
            password_hash: Mutex::new(hash_password(&salt, password)),
            salt,
            admin: AtomicBool::new(false),
            first_use: AtomicBool::new(true),
            contact_method: Mutex::new(ContactMethod::default()),
            upstream: Mutex::new(None),
            dispatcher: self.dispatcher.clone(),
            name: username.to_string(),
        });
        self.accounts
            .lock()
            .insert(username.to_lowercase(), account.clone());
        tracing::info!(account = %username, "account created");
        account
    }

    pub fn check_password(&self, username: &str, password: &str) -> bool {
        self.accounts
            .lock()
            .get(&username.to_lowercase())
            .is_some_and(|account| account.matches_password(password))
    }

    pub fn get(&self, username: &str) -> Option<Arc<Account>> {
        self.accounts.lock().get(&username.to_lowercase()).cloned()
    }

    /// Rewrite the backing file with the current account set. A store
    /// without a backing file persists nothing and succeeds.
    pub fn persist_all(&self) -> Result<(), StoreError> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let file = {
            let accounts = self.accounts.lock();
            let mut records: Vec<AccountRecord> = accounts
                .values()
                .map(|account| AccountRecord {
                    name: account.name.clone(),
                    salt: account.salt.clone(),
                    password_hash: account.password_hash.lock().clone(),
                    admin: account.is_admin(),
                    first_use: account.is_first_use(),
                    contact_method: account.contact_method().as_config().to_string(),
                })
                .collect();
            records.sort_by(|a, b| a.name.cmp(&b.name));
            StoreFile { accounts: records }
        };
        let encoded = toml::to_string_pretty(&file)?;
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, encoded)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}
