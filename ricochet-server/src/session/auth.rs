//! Session authentication state.
//!
//! A session is either collecting registration fields or bound to an
//! account; there is nothing in between. The readiness check is a single
//! pure predicate over the collected fields, evaluated after every
//! update.

use std::sync::Arc;

use crate::accounts::Account;

/// Where a session is in its life: still collecting credentials, or
/// bound to an account for good.
pub enum AuthState {
    Unauthenticated(Registration),
    Authenticated { account: Arc<Account> },
}

impl AuthState {
    pub fn new() -> Self {
        Self::Unauthenticated(Registration::default())
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated { .. })
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::new()
    }
}

/// Registration fields collected before authentication. All four must be
/// present before a login attempt fires.
#[derive(Debug, Default, Clone)]
pub struct Registration {
    pub username: Option<String>,
    pub realname: Option<String>,
    pub nickname: Option<String>,
    pub password: Option<String>,
}

/// A complete login attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Registration {
    /// The authentication precondition: every field present. Returns the
    /// credentials to verify, or `None` while anything is missing.
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.realname, &self.nickname, &self.password) {
            (Some(username), Some(_), Some(_), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_registrations_do_not_authenticate() {
        let mut reg = Registration::default();
        assert!(reg.credentials().is_none());
        reg.username = Some("alice".into());
        reg.realname = Some("Alice".into());
        reg.nickname = Some("al".into());
        assert!(reg.credentials().is_none(), "no password yet");
        reg.password = Some("pw".into());
        assert!(reg.credentials().is_some());
    }

    #[test]
    fn field_order_does_not_matter() {
        let mut a = Registration::default();
        a.password = Some("pw".into());
        a.username = Some("alice".into());
        a.nickname = Some("al".into());
        a.realname = Some("Alice".into());

        let mut b = Registration::default();
        b.realname = Some("Alice".into());
        b.nickname = Some("al".into());
        b.username = Some("alice".into());
        b.password = Some("pw".into());

        assert_eq!(a.credentials(), b.credentials());
    }
}
