//! End-to-end session tests.
//!
//! Each test drives a real session task over an in-memory duplex pipe,
//! exactly as the accept loop would over TCP: registration in any order,
//! first-account bootstrap, failed logins, bot command routing, upstream
//! relay, and the close-all sweep.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

use ricochet_server::accounts::AccountStore;
use ricochet_server::channel::ClientChannel;
use ricochet_server::commands::CommandRouter;
use ricochet_server::registry::SessionRegistry;
use ricochet_server::session::{Session, SessionShared};
use ricochet_server::upstream::UpstreamHandler;

const SERVER_NAME: &str = "bnc.local";
const BOT_NICK: &str = "-bnc";

struct Harness {
    registry: Arc<SessionRegistry>,
    store: Arc<AccountStore>,
}

impl Harness {
    fn new() -> Self {
        Self {
            registry: SessionRegistry::new(),
            store: AccountStore::in_memory(CommandRouter::with_builtins()),
        }
    }

    fn connect(&self) -> TestClient {
        let (client_end, server_end) = tokio::io::duplex(16 * 1024);
        let (session, rx) =
            Session::attach(&self.registry, &self.store, SERVER_NAME, BOT_NICK, "test-peer");
        let task = tokio::spawn(session.run(ClientChannel::plain(server_end), rx));
        let (read, write) = tokio::io::split(client_end);
        TestClient {
            reader: BufReader::new(read),
            writer: write,
            task,
        }
    }
}

struct TestClient {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    task: JoinHandle<()>,
}

impl TestClient {
    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
    }

    /// Next line from the bouncer, or `None` at end-of-stream.
    async fn read_line(&mut self) -> Option<String> {
        let mut line = String::new();
        let n = tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a line")
            .expect("read failed");
        if n == 0 {
            None
        } else {
            Some(line.trim_end_matches(['\r', '\n']).to_string())
        }
    }

    /// Read lines until one contains `needle`; panics at end-of-stream.
    async fn expect_line_containing(&mut self, needle: &str) -> String {
        loop {
            match self.read_line().await {
                Some(line) if line.contains(needle) => return line,
                Some(_) => continue,
                None => panic!("stream ended before a line containing {needle:?}"),
            }
        }
    }

    /// Drain until end-of-stream.
    async fn expect_eof(&mut self) {
        while self.read_line().await.is_some() {}
    }

    async fn login(&mut self, nick: &str, user: &str, pass: &str) {
        self.send(&format!("NICK {nick}")).await;
        self.send(&format!("USER {user} 0 * :Test User")).await;
        self.send(&format!("PASS {pass}")).await;
        self.expect_line_containing("You are now logged in").await;
    }
}

#[derive(Default)]
struct RecordingUpstream {
    lines: Mutex<Vec<(String, Vec<String>)>>,
}

impl UpstreamHandler for RecordingUpstream {
    fn on_line_received(&self, _session: &Arc<SessionShared>, raw_line: &str, tokens: &[String]) {
        self.lines
            .lock()
            .push((raw_line.to_string(), tokens.to_vec()));
    }
}

#[tokio::test]
async fn registration_works_in_any_field_order() {
    let harness = Harness::new();
    harness.store.create_account("bob", "secret");

    // PASS (user:pass form) before NICK/USER.
    let mut first = harness.connect();
    first.send("PASS bob:secret").await;
    first.send("NICK x").await;
    first.send("USER u 0 * :Real Name").await;
    first.expect_line_containing("You are now logged in").await;

    // NICK/USER first, password-only PASS last; username from USER.
    let mut second = harness.connect();
    second.send("NICK y").await;
    second.send("USER bob 0 * :Real Name").await;
    second.expect_line_containing("Please enter your password").await;
    second.send("PASS secret").await;
    second.expect_line_containing("You are now logged in").await;
}

#[tokio::test]
async fn first_registration_bootstraps_an_admin_account() {
    let harness = Harness::new();
    assert_eq!(harness.store.count(), 0);

    let mut client = harness.connect();
    client.send("NICK al").await;
    client.send("USER alice 0 * :Alice").await;
    client.send("PASS secret").await;
    client
        .expect_line_containing("first user of this bouncer")
        .await;
    client.expect_line_containing("You are now logged in").await;
    client.expect_line_containing("This is an Admin account").await;
    // First-ever use triggers the first-time help, admin flavor included.
    client.expect_line_containing("As an admin").await;

    assert_eq!(harness.store.count(), 1);
    assert!(harness.store.get("alice").unwrap().is_admin());

    // Bootstrap fires exactly once: a second, unknown registration must
    // authenticate on its own merits, and fails here.
    let mut intruder = harness.connect();
    intruder.send("NICK m").await;
    intruder.send("USER mallory 0 * :Mallory").await;
    intruder.send("PASS letmein").await;
    intruder.expect_line_containing("464").await;
    intruder.expect_eof().await;
    assert_eq!(harness.store.count(), 1);
}

#[tokio::test]
async fn wrong_password_gets_one_numeric_then_disconnect() {
    let harness = Harness::new();
    harness.store.create_account("alice", "secret");

    let mut client = harness.connect();
    client.send("PASS alice:wrong").await;
    client.send("NICK al").await;
    client.send("USER alice 0 * :Alice").await;
    let line = client.expect_line_containing("464").await;
    assert!(line.contains("Password incorrect"));
    client.expect_eof().await;
    client.task.await.unwrap();

    // The account itself is untouched.
    assert!(harness.store.check_password("alice", "secret"));
    assert!(harness.registry.is_empty());
}

#[tokio::test]
async fn pre_auth_commands_are_rejected_with_numerics() {
    let harness = Harness::new();
    let mut client = harness.connect();

    // Too few tokens: "need more parameters", session stays up.
    client.send("JOIN").await;
    client.expect_line_containing("461").await;
    // Enough tokens but not a registration command: "not registered".
    client.send("JOIN #chan").await;
    client.expect_line_containing("451").await;

    // Still alive and able to register afterwards.
    harness.store.create_account("bob", "secret");
    client.send("PASS bob:secret").await;
    client.send("NICK b").await;
    client.send("USER b 0 * :B").await;
    client.expect_line_containing("You are now logged in").await;
}

#[tokio::test]
async fn unknown_bot_command_is_reported_and_session_survives() {
    let harness = Harness::new();
    harness.store.create_account("alice", "secret");

    let mut client = harness.connect();
    client.login("al", "alice", "alice:secret").await;

    client.send("DFBNC bogus").await;
    let line = client.expect_line_containing("Unknown command 'bogus'").await;
    assert!(line.contains("ShowCommands"));

    // Still connected and authenticated: a real command works.
    client.send("DFBNC version").await;
    client.expect_line_containing("ricochet").await;
}

#[tokio::test]
async fn privmsg_to_the_bot_routes_commands_case_insensitively() {
    let harness = Harness::new();
    harness.store.create_account("alice", "secret");

    let mut client = harness.connect();
    client.login("al", "alice", "alice:secret").await;

    client.send("PRIVMSG -BNC :version").await;
    client.expect_line_containing("ricochet").await;

    client.send("PRIVMSG -bnc :showcommands").await;
    client.expect_line_containing("Available commands").await;
    client.expect_line_containing("firsttime").await;
}

#[tokio::test]
async fn authenticated_lines_relay_to_the_upstream_handler() {
    let harness = Harness::new();
    let account = harness.store.create_account("alice", "secret");
    let upstream = Arc::new(RecordingUpstream::default());
    account.set_upstream_handler(Some(upstream.clone()));

    let mut client = harness.connect();
    client.login("al", "alice", "alice:secret").await;

    client.send("JOIN #chan").await;
    client.send("PRIVMSG friend :hello there").await;
    // Bot traffic must not reach the upstream.
    client.send("DFBNC version").await;
    client.expect_line_containing("ricochet").await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        {
            let lines = upstream.lines.lock();
            if lines.len() >= 2 {
                assert_eq!(lines[0].0, "JOIN #chan");
                assert_eq!(lines[0].1, vec!["JOIN", "#chan"]);
                assert_eq!(lines[1].0, "PRIVMSG friend :hello there");
                assert_eq!(lines[1].1, vec!["PRIVMSG", "friend", "hello there"]);
                break;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "relay never reached the upstream handler"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(upstream.lines.lock().len(), 2);
}

#[tokio::test]
async fn close_all_broadcasts_to_every_session_of_an_account() {
    let harness = Harness::new();
    harness.store.create_account("alice", "secret");

    let mut first = harness.connect();
    first.login("al1", "alice", "alice:secret").await;
    let mut second = harness.connect();
    second.login("al2", "alice", "alice:secret").await;

    let account = harness.store.get("alice").unwrap();
    assert_eq!(harness.registry.all_for_account(&account).len(), 2);

    harness.registry.close_all("Server stopping");

    first
        .expect_line_containing("Connection terminating (Server stopping)")
        .await;
    first.expect_eof().await;
    second
        .expect_line_containing("Connection terminating (Server stopping)")
        .await;
    second.expect_eof().await;

    first.task.await.unwrap();
    second.task.await.unwrap();
    assert!(harness.registry.is_empty());
    assert!(harness.registry.all_for_account(&account).is_empty());
}

#[tokio::test]
async fn quit_closes_immediately_in_any_state() {
    let harness = Harness::new();

    let mut client = harness.connect();
    client.expect_line_containing("Welcome to ricochet").await;
    client.send("QUIT").await;
    client.expect_eof().await;
    client.task.await.unwrap();
    assert!(harness.registry.is_empty());
}

#[tokio::test]
async fn disconnect_deregisters_the_session() {
    let harness = Harness::new();

    let client = harness.connect();
    // Give the session a beat to register and greet.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.registry.len(), 1);

    drop(client.reader);
    drop(client.writer);
    client.task.await.unwrap();
    assert!(harness.registry.is_empty());
}
