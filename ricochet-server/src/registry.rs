//! The live-session registry.
//!
//! One injected, process-wide map from session id to the session's
//! cross-task handle. A single lock covers registration, removal,
//! enumeration, and the close-all sweep; enumeration hands out snapshots,
//! never live views. While a sweep is running, sessions skip their own
//! deregistration; the sweep is authoritative for registry cleanup.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::accounts::Account;
use crate::session::SessionShared;

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Arc<SessionShared>>,
    sweeping: bool,
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert a new session under a collision-free id derived from the
    /// peer description. Id choice and insertion happen under one lock
    /// acquisition.
    pub fn register(
        &self,
        peer: &str,
        make: impl FnOnce(String) -> Arc<SessionShared>,
    ) -> Arc<SessionShared> {
        let mut inner = self.inner.lock();
        let mut id = peer.to_string();
        while inner.sessions.contains_key(&id) {
            id = format!("{peer}-{:04x}", rand::random::<u16>());
        }
        let shared = make(id.clone());
        inner.sessions.insert(id, shared.clone());
        shared
    }

    /// Remove a session. Quietly does nothing if it is already gone.
    pub fn unregister(&self, id: &str) {
        self.inner.lock().sessions.remove(id);
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionShared>> {
        self.inner.lock().sessions.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().sessions.is_empty()
    }

    /// Whether a close-all sweep currently owns registry cleanup.
    pub fn sweep_in_progress(&self) -> bool {
        self.inner.lock().sweeping
    }

    /// Snapshot of every session bound to `account` right now.
    pub fn all_for_account(&self, account: &Arc<Account>) -> Vec<Arc<SessionShared>> {
        self.inner
            .lock()
            .sessions
            .values()
            .filter(|s| {
                s.bound_account()
                    .is_some_and(|bound| Arc::ptr_eq(&bound, account))
            })
            .cloned()
            .collect()
    }

    /// Tell every session why it is going away, ask it to close, and
    /// clear the registry in one sweep.
    pub fn close_all(&self, reason: &str) {
        let mut inner = self.inner.lock();
        inner.sweeping = true;
        let snapshot: Vec<Arc<SessionShared>> = inner.sessions.values().cloned().collect();
        for session in &snapshot {
            session.send_termination_notice(reason);
            session.request_close();
        }
        inner.sessions.clear();
        inner.sweeping = false;
        tracing::info!(count = snapshot.len(), %reason, "closed all sessions");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountStore;
    use crate::commands::CommandRouter;
    use crate::session::Outbound;
    use tokio::sync::mpsc;

    fn make_session(
        registry: &SessionRegistry,
        peer: &str,
    ) -> (Arc<SessionShared>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(64);
        let shared = registry.register(peer, move |id| {
            SessionShared::new(id, "bnc.local".into(), "-bnc".into(), tx)
        });
        (shared, rx)
    }

    #[test]
    fn ids_are_unique_even_for_identical_peers() {
        let registry = SessionRegistry::new();
        let (a, _rx_a) = make_session(&registry, "127.0.0.1:5000");
        let (b, _rx_b) = make_session(&registry, "127.0.0.1:5000");
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.len(), 2);
        assert!(b.id().starts_with("127.0.0.1:5000-"));
    }

    #[test]
    fn unregister_is_a_no_op_when_absent() {
        let registry = SessionRegistry::new();
        let (a, _rx) = make_session(&registry, "peer");
        registry.unregister(a.id());
        registry.unregister(a.id());
        assert!(registry.is_empty());
    }

    #[test]
    fn enumeration_by_account_is_a_snapshot_of_bound_sessions() {
        let registry = SessionRegistry::new();
        let store = AccountStore::in_memory(CommandRouter::with_builtins());
        let alice = store.create_account("alice", "pw");
        let bob = store.create_account("bob", "pw");

        let (s1, _rx1) = make_session(&registry, "one");
        let (s2, _rx2) = make_session(&registry, "two");
        let (s3, _rx3) = make_session(&registry, "three");
        s1.bind_account(alice.clone());
        s2.bind_account(alice.clone());
        s3.bind_account(bob);

        let sessions = registry.all_for_account(&alice);
        assert_eq!(sessions.len(), 2);
        let ids: Vec<&str> = sessions.iter().map(|s| s.id()).collect();
        assert!(ids.contains(&s1.id()));
        assert!(ids.contains(&s2.id()));
    }

    #[test]
    fn close_all_notifies_closes_and_empties() {
        let registry = SessionRegistry::new();
        let (_a, mut rx_a) = make_session(&registry, "one");
        let (_b, mut rx_b) = make_session(&registry, "two");

        registry.close_all("Shutting down");
        assert!(registry.is_empty());
        assert!(!registry.sweep_in_progress());

        for rx in [&mut rx_a, &mut rx_b] {
            match rx.try_recv().unwrap() {
                Outbound::Line(line) => {
                    assert_eq!(line, ":bnc.local NOTICE :Connection terminating (Shutting down)\r\n");
                }
                Outbound::Close => panic!("notice must precede close"),
            }
            assert!(matches!(rx.try_recv().unwrap(), Outbound::Close));
        }
    }
}
