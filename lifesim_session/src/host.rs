// Host role: listener, per-link workers, and the handle the game drives.
//
// Threads:
// - **Accept thread**: polls the non-blocking `Listener`, attaches every new
//   link to the `Relay` and spawns that link's worker. Sleeps briefly when
//   nothing is pending so it can notice `running` going false.
// - **Link workers** (one per accepted link): block in `Incoming::recv` and
//   hand each message to `Relay::on_message`, strictly in arrival order. When
//   the link ends (remote close, bad frame, protocol violation) the worker
//   calls `Relay::disconnect`, which prunes the link and announces `left`.
//   The accept thread joins finished workers whenever it accepts a new link;
//   the rest are joined on stop.
// - **Monitor thread**: samples the registry size for the log. Read-only.
//
// The game thread talks to the host through `HostHandle`: its own
// participant, starting the game, host-originated messages, and `poll` for
// everything peers sent. `stop` (or drop) clears `running`, closes every
// link, joins all threads and finally releases the single-host lock.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use lifesim_protocol::{AttributeBag, Message};
use tracing::{debug, info, warn};

use crate::clock::GameClock;
use crate::config::HostConfig;
use crate::error::{PreconditionError, SessionError};
use crate::host_lock::HostLock;
use crate::phase::{Phase, PhaseCell};
use crate::registry::{Registry, RegistrySnapshot, UpsertMode};
use crate::relay::Relay;
use crate::transport::{Incoming, LinkEnd, Listener};

/// Accept-loop back-off when no connection is pending.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Upper bound on how long the monitor sleeps between `running` checks.
const MONITOR_TICK: Duration = Duration::from_millis(50);

/// State shared by the handle and every host thread.
struct HostShared {
    relay: Relay,
    registry: Arc<Registry>,
    phase: Arc<PhaseCell>,
    running: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Control handle for a running host.
pub struct HostHandle {
    shared: Arc<HostShared>,
    inbox: Receiver<Message>,
    clock: GameClock,
    local_addr: SocketAddr,
    threads: Vec<JoinHandle<()>>,
    lock: Option<HostLock>,
}

/// Bind, enter the lobby, and start the accept and monitor threads.
///
/// The host owns `lock` until it stops. On a bind failure nothing is
/// started and the lock is released on return.
pub fn start_host(
    config: &HostConfig,
    mut lock: HostLock,
    clock: GameClock,
) -> Result<HostHandle, SessionError> {
    let listener = Listener::bind(&config.listen_addr(), config.timeouts())?;
    let local_addr = listener.local_addr();
    lock.record(local_addr)?;

    let registry = Arc::new(Registry::new());
    let phase = Arc::new(PhaseCell::new());
    phase.enter_lobby()?;
    let (relay, inbox) = Relay::new(Arc::clone(&registry), Arc::clone(&phase), clock.clone());
    let shared = Arc::new(HostShared {
        relay,
        registry,
        phase,
        running: AtomicBool::new(true),
        workers: Mutex::new(Vec::new()),
    });
    info!(addr = %local_addr, "hosting session");

    // From here on, an early return drops the handle, which stops whatever
    // was already spawned.
    let mut host = HostHandle {
        shared,
        inbox,
        clock,
        local_addr,
        threads: Vec::new(),
        lock: Some(lock),
    };
    let spawn_err = |source| SessionError::Bind {
        addr: local_addr.to_string(),
        source,
    };

    let shared = Arc::clone(&host.shared);
    host.threads.push(
        thread::Builder::new()
            .name("lifesim-accept".into())
            .spawn(move || accept_loop(&shared, &listener))
            .map_err(spawn_err)?,
    );
    let shared = Arc::clone(&host.shared);
    let interval = config.monitor_interval();
    host.threads.push(
        thread::Builder::new()
            .name("lifesim-monitor".into())
            .spawn(move || monitor_loop(&shared, interval))
            .map_err(spawn_err)?,
    );
    Ok(host)
}

fn accept_loop(shared: &Arc<HostShared>, listener: &Listener) {
    while shared.running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok(Some((conn, incoming))) => {
                info!(
                    connection = %conn.id(),
                    remote = ?conn.remote_addr(),
                    "accepted connection"
                );
                shared.relay.attach(conn);
                let worker_shared = Arc::clone(shared);
                let spawned = thread::Builder::new()
                    .name(format!("lifesim-{}", incoming.id()))
                    .spawn(move || link_worker(&worker_shared, incoming));
                let mut workers = shared.workers.lock().unwrap_or_else(PoisonError::into_inner);
                reap_finished(&mut workers);
                match spawned {
                    Ok(handle) => workers.push(handle),
                    Err(e) => warn!(error = %e, "could not spawn link worker"),
                }
            }
            Ok(None) => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                warn!(error = %e, "accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    debug!("accept loop stopped");
}

/// Join the workers whose links already ended, keeping the rest.
fn reap_finished(workers: &mut Vec<JoinHandle<()>>) {
    let (done, live): (Vec<_>, Vec<_>) = workers.drain(..).partition(JoinHandle::is_finished);
    *workers = live;
    for handle in done {
        let _ = handle.join();
    }
}

fn link_worker(shared: &HostShared, mut incoming: Incoming) {
    let id = incoming.id().clone();
    loop {
        match incoming.recv(&shared.running) {
            Ok(msg) => {
                if let Err(err) = shared.relay.on_message(&id, msg) {
                    warn!(connection = %id, %err, "dropping connection");
                    break;
                }
            }
            // Teardown is driven by `HostHandle::stop`.
            Err(LinkEnd::Shutdown) => return,
            Err(LinkEnd::Closed) => {
                debug!(connection = %id, "closed by peer");
                break;
            }
            Err(LinkEnd::Failed(err)) => {
                warn!(connection = %id, %err, "link failed");
                break;
            }
        }
    }
    shared.relay.disconnect(&id);
}

fn monitor_loop(shared: &HostShared, interval: Duration) {
    let mut last_seen = None;
    let mut next_sample = Instant::now();
    while shared.running.load(Ordering::SeqCst) {
        if Instant::now() >= next_sample {
            let participants = shared.registry.len();
            if last_seen != Some(participants) {
                info!(
                    participants,
                    connections = shared.relay.connection_count(),
                    phase = %shared.phase.get(),
                    "registry size"
                );
                last_seen = Some(participants);
            }
            next_sample = Instant::now() + interval;
        }
        thread::sleep(MONITOR_TICK.min(interval));
    }
}

impl HostHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Add the host's own participant (lobby only).
    pub fn join_local(&self, name: &str, attributes: AttributeBag) -> Result<(), PreconditionError> {
        self.shared.relay.join_local(name, attributes)
    }

    /// Lobby → Active. Needs at least two registered participants.
    pub fn start_game(&self, message: &str) -> Result<(), PreconditionError> {
        self.shared.relay.start_game(message)
    }

    fn local_name(&self, action: &'static str) -> Result<String, PreconditionError> {
        self.shared
            .relay
            .local_name()
            .ok_or(PreconditionError::NotJoined(action))
    }

    pub fn send_chat(&self, text: &str) -> Result<(), PreconditionError> {
        let sender = self.local_name("chat")?;
        self.shared.relay.publish(&Message::Chat {
            sender,
            text: text.to_owned(),
            at: self.clock.now(),
        })
    }

    /// Push the host participant's changed state to everyone.
    pub fn publish_update(
        &self,
        attributes: AttributeBag,
        mode: UpsertMode,
    ) -> Result<(), PreconditionError> {
        let name = self.local_name("update")?;
        self.shared.relay.publish(&Message::Update {
            name,
            attributes,
            replace: mode == UpsertMode::Replace,
        })
    }

    pub fn send_social(&self, to: &str, kind: &str, text: &str) -> Result<(), PreconditionError> {
        let from = self.local_name("social_interaction")?;
        self.shared.relay.publish(&Message::SocialInteraction {
            from,
            to: to.to_owned(),
            kind: kind.to_owned(),
            text: text.to_owned(),
        })
    }

    pub fn announce_death(&self, reason: &str) -> Result<(), PreconditionError> {
        let name = self.local_name("death")?;
        self.shared.relay.publish(&Message::Death {
            name,
            reason: reason.to_owned(),
            at: self.clock.now(),
        })
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.shared.registry.snapshot()
    }

    pub fn participant_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.relay.connection_count()
    }

    pub fn phase(&self) -> Phase {
        self.shared.phase.get()
    }

    pub fn clock(&self) -> &GameClock {
        &self.clock
    }

    /// Drain everything peers sent since the last poll (non-blocking).
    pub fn poll(&self) -> Vec<Message> {
        self.inbox.try_iter().collect()
    }

    /// Stop hosting: close every link, join all threads, release the lock.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let left = self.shared.phase.terminate();
        self.shared.relay.shutdown();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        let workers = std::mem::take(
            &mut *self
                .shared
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in workers {
            let _ = handle.join();
        }
        // Workers that ended by shutdown skip their own disconnect; make sure
        // nothing survived.
        self.shared.registry.clear();
        drop(self.lock.take());
        info!(from = %left, "host stopped");
    }
}

impl Drop for HostHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
