// Test-only host and peer wrappers for multiplayer integration tests.
//
// `TestHost` starts a real host on a free loopback port, with its lock file
// in a private temp directory. `TestPeer` wraps a real `Peer` connected to
// it. All networking goes through the same code paths as the game; the
// only test-specific code here is the blocking poll loops around the
// non-blocking `poll()`/`snapshot()` accessors.
//
// See also: `tests/full_pipeline.rs` for the scenarios.

use std::thread;
use std::time::{Duration, Instant};

use lifesim_protocol::{AttributeBag, Message};
use lifesim_session::{
    GameClock, HostConfig, HostHandle, HostLock, Peer, PeerConfig, Phase, RegistrySnapshot,
    start_host,
};
use tempfile::TempDir;

/// Default timeout for blocking poll operations.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between poll attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Idle timeout used by test links so shutdown is quick.
const TEST_IDLE_MS: u64 = 20;

/// Block until `cond` holds, panicking with `what` after `POLL_TIMEOUT`.
pub fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < POLL_TIMEOUT, "timed out waiting for {what}");
        thread::sleep(POLL_INTERVAL);
    }
}

/// A running host plus the temp directory holding its lock file.
pub struct TestHost {
    pub handle: HostHandle,
    dir: TempDir,
}

impl TestHost {
    pub fn start() -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let config = HostConfig {
            port: 0,
            idle_timeout_ms: TEST_IDLE_MS,
            monitor_interval_ms: 50,
            lock_path: dir.path().join("server.lock"),
            ..HostConfig::default()
        };
        let lock = HostLock::acquire(&config.lock_path).expect("acquire host lock");
        let handle = start_host(&config, lock, GameClock::default()).expect("start host");
        TestHost { handle, dir }
    }

    pub fn lock_path(&self) -> std::path::PathBuf {
        self.dir.path().join("server.lock")
    }

    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            port: self.handle.local_addr().port(),
            idle_timeout_ms: TEST_IDLE_MS,
            connect_timeout_ms: 2_000,
            ..PeerConfig::default()
        }
    }

    pub fn wait_for_participants(&self, n: usize) {
        wait_for(&format!("{n} participants at host"), || {
            self.handle.participant_count() == n
        });
    }

    /// Blocking poll of the host inbox until `pred` matches a message.
    pub fn poll_until(&self, what: &str, mut pred: impl FnMut(&Message) -> bool) -> Message {
        let mut found = None;
        wait_for(what, || {
            found = self.handle.poll().into_iter().find(|m| pred(m));
            found.is_some()
        });
        found.expect("wait_for returned without a match")
    }

    pub fn stop(self) {
        self.handle.stop();
    }
}

/// A real peer with blocking helpers.
pub struct TestPeer {
    pub peer: Peer,
    /// Messages drained by earlier helpers, kept for later assertions.
    seen: Vec<Message>,
}

impl TestPeer {
    /// Connect and join, then wait for the roster reply.
    pub fn join(host: &TestHost, name: &str, attributes: AttributeBag) -> Self {
        let mut peer =
            Peer::connect(&host.peer_config(), GameClock::default()).expect("connect to host");
        peer.join(name, attributes).expect("send join");
        let mut this = TestPeer {
            peer,
            seen: Vec::new(),
        };
        this.poll_until(&format!("roster for {name}"), |m| {
            matches!(m, Message::Roster { .. })
        });
        this
    }

    /// Blocking poll until `pred` matches, consuming the match. Other
    /// messages polled on the way are kept for later calls.
    pub fn poll_until(&mut self, what: &str, mut pred: impl FnMut(&Message) -> bool) -> Message {
        let start = Instant::now();
        loop {
            if let Some(idx) = self.seen.iter().position(&mut pred) {
                return self.seen.remove(idx);
            }
            assert!(start.elapsed() < POLL_TIMEOUT, "timed out waiting for {what}");
            let fresh = self.peer.poll();
            if fresh.is_empty() {
                thread::sleep(POLL_INTERVAL);
            }
            self.seen.extend(fresh);
        }
    }

    /// Everything polled so far, plus whatever is waiting now.
    pub fn drain(&mut self) -> Vec<Message> {
        self.seen.extend(self.peer.poll());
        std::mem::take(&mut self.seen)
    }

    pub fn wait_for_phase(&self, phase: Phase) {
        wait_for(&format!("peer phase {phase}"), || self.peer.phase() == phase);
    }

    pub fn wait_for_roster(&self, names: &[&str]) -> RegistrySnapshot {
        let mut snapshot = RegistrySnapshot::new();
        wait_for(&format!("roster {names:?}"), || {
            snapshot = self.peer.snapshot();
            snapshot.keys().map(String::as_str).eq(names.iter().copied())
        });
        snapshot
    }
}
