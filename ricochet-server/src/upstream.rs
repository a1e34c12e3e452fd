//! The relay boundary toward the remote IRC network.
//!
//! The bouncer core does not interpret relayed traffic; everything an
//! authenticated client sends that is not a bot command crosses this
//! trait. An account with no handler attached simply drops relayed lines.

use std::sync::Arc;

use crate::session::SessionShared;

/// Receives authenticated, non-bot-command lines on behalf of an account.
pub trait UpstreamHandler: Send + Sync {
    /// One protocol line from `session`, as received (`raw_line`) and in
    /// tokenized form (`tokens[0]` is the uppercased command).
    fn on_line_received(&self, session: &Arc<SessionShared>, raw_line: &str, tokens: &[String]);
}
