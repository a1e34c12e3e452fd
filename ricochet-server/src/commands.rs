//! Bot command dispatch.
//!
//! Commands are addressed to the bouncer itself (`PRIVMSG <bot>` or the
//! `DFBNC` escape) rather than relayed upstream. The router maps the
//! first token to a handler; everything a command says back to the user
//! goes through the invoking session's bot-message shaping.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::session::SessionShared;

/// What became of a dispatched command.
pub enum DispatchOutcome {
    /// The command ran; any output has already been sent.
    Handled,
    /// No command under that name.
    NotFound,
    /// The command started but failed.
    Failed(String),
}

pub trait CommandDispatcher: Send + Sync {
    fn dispatch(&self, session: &Arc<SessionShared>, tokens: &[String]) -> DispatchOutcome;
}

/// A single bot command.
pub trait BotCommand: Send + Sync {
    fn name(&self) -> &'static str;
    fn summary(&self) -> &'static str;
    fn execute(&self, session: &Arc<SessionShared>, args: &[String]) -> anyhow::Result<()>;
}

/// Name-keyed command table.
pub struct CommandRouter {
    commands: BTreeMap<&'static str, Arc<dyn BotCommand>>,
}

impl CommandRouter {
    pub fn new() -> Self {
        Self {
            commands: BTreeMap::new(),
        }
    }

    /// The standard command set.
    pub fn with_builtins() -> Arc<Self> {
        let mut router = Self::new();
        router.register(Arc::new(FirstTime));
        router.register(Arc::new(Version));
        // ShowCommands carries a snapshot of the table, itself included.
        let mut listing: Vec<(&'static str, &'static str)> = router
            .commands
            .values()
            .map(|c| (c.name(), c.summary()))
            .collect();
        listing.push(("showcommands", SHOWCOMMANDS_SUMMARY));
        listing.sort();
        router.register(Arc::new(ShowCommands { listing }));
        Arc::new(router)
    }

    pub fn register(&mut self, command: Arc<dyn BotCommand>) {
        self.commands.insert(command.name(), command);
    }

    fn lookup(&self, name: &str) -> Option<&Arc<dyn BotCommand>> {
        let name = name.to_ascii_lowercase();
        self.commands.get(name.as_str())
    }
}

impl Default for CommandRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandDispatcher for CommandRouter {
    fn dispatch(&self, session: &Arc<SessionShared>, tokens: &[String]) -> DispatchOutcome {
        let Some(name) = tokens.first() else {
            return DispatchOutcome::NotFound;
        };
        match self.lookup(name) {
            None => DispatchOutcome::NotFound,
            Some(command) => match command.execute(session, &tokens[1..]) {
                Ok(()) => DispatchOutcome::Handled,
                Err(e) => DispatchOutcome::Failed(e.to_string()),
            },
        }
    }
}

const SHOWCOMMANDS_SUMMARY: &str = "List the commands the bouncer understands";

struct ShowCommands {
    listing: Vec<(&'static str, &'static str)>,
}

impl BotCommand for ShowCommands {
    fn name(&self) -> &'static str {
        "showcommands"
    }

    fn summary(&self) -> &'static str {
        SHOWCOMMANDS_SUMMARY
    }

    fn execute(&self, session: &Arc<SessionShared>, _args: &[String]) -> anyhow::Result<()> {
        session.send_bot_message("Available commands:");
        for (name, summary) in &self.listing {
            session.send_bot_message(&format!("  {name} - {summary}"));
        }
        Ok(())
    }
}

struct FirstTime;

impl BotCommand for FirstTime {
    fn name(&self) -> &'static str {
        "firsttime"
    }

    fn summary(&self) -> &'static str {
        "Show the getting-started help"
    }

    fn execute(&self, session: &Arc<SessionShared>, args: &[String]) -> anyhow::Result<()> {
        let admin = args.first().is_some_and(|a| a.eq_ignore_ascii_case("admin"));
        if admin {
            session.send_bot_message("As an admin you can manage this bouncer from any client:");
            session.send_bot_message("  - 'ShowCommands' lists everything available to you");
            session.send_bot_message("  - closing all connections and other administration is done here, not on the network");
        } else {
            session.send_bot_message("Welcome! This bouncer keeps your connection to the network alive while you are away.");
            session.send_bot_message("Talk to the bouncer at any time by messaging the bot, or with the DFBNC command.");
            session.send_bot_message("Try 'ShowCommands' to see what it understands.");
        }
        Ok(())
    }
}

struct Version;

impl BotCommand for Version {
    fn name(&self) -> &'static str {
        "version"
    }

    fn summary(&self) -> &'static str {
        "Show the bouncer version"
    }

    fn execute(&self, session: &Arc<SessionShared>, _args: &[String]) -> anyhow::Result<()> {
        session.send_bot_message(&format!("ricochet {}", env!("CARGO_PKG_VERSION")));
        Ok(())
    }
}
