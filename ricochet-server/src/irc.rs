//! IRC line tokenization and reply formatting.
//!
//! Only the small protocol surface the bouncer itself speaks lives here:
//! splitting inbound lines into tokens (trailing-parameter aware) and
//! framing outbound server replies. Relayed traffic passes through the
//! session untouched.

use std::fmt;

/// ERR_NOTREGISTERED
pub const ERR_NOTREGISTERED: &str = "451";
/// ERR_NEEDMOREPARAMS
pub const ERR_NEEDMOREPARAMS: &str = "461";
/// ERR_PASSWDMISMATCH
pub const ERR_PASSWDMISMATCH: &str = "464";

/// Split an IRC line into tokens.
///
/// Whitespace-separated, except that a parameter starting with `:` absorbs
/// the rest of the line (without the colon). `tokens[0]` is the command.
pub fn tokenize(line: &str) -> Vec<String> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut tokens = Vec::new();
    let mut rest = line.trim_start();
    while !rest.is_empty() {
        if rest.starts_with(':') && !tokens.is_empty() {
            tokens.push(rest[1..].to_string());
            break;
        }
        match rest.split_once(' ') {
            Some((tok, tail)) => {
                if !tok.is_empty() {
                    tokens.push(tok.to_string());
                }
                rest = tail.trim_start();
            }
            None => {
                tokens.push(rest.to_string());
                break;
            }
        }
    }
    tokens
}

/// An outbound IRC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Source prefix, without the leading `:`.
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl Message {
    /// Build a message originating from the (virtual) server.
    pub fn from_server(server_name: &str, command: &str, params: Vec<&str>) -> Self {
        Self {
            prefix: Some(server_name.to_string()),
            command: command.to_string(),
            params: params.into_iter().map(str::to_string).collect(),
        }
    }

    /// Build a message with an arbitrary prefix (e.g. the bot hostmask).
    pub fn from_source(source: &str, command: &str, params: Vec<&str>) -> Self {
        Self {
            prefix: Some(source.to_string()),
            command: command.to_string(),
            params: params.into_iter().map(str::to_string).collect(),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref prefix) = self.prefix {
            write!(f, ":{prefix} ")?;
        }
        write!(f, "{}", self.command)?;
        let last = self.params.len().saturating_sub(1);
        for (i, param) in self.params.iter().enumerate() {
            if i == last && (param.is_empty() || param.contains(' ') || param.starts_with(':')) {
                write!(f, " :{param}")?;
            } else {
                write!(f, " {param}")?;
            }
        }
        Ok(())
    }
}
