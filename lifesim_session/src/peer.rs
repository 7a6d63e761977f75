// Peer role: one outbound link to the host.
//
// - `Peer::connect` opens the link (bounded by the connect timeout), enters
//   the lobby and spawns the reader thread.
// - The reader thread mirrors the host's registry from `roster`, `joined`,
//   `left`, `update` and `death`, flips the phase to Active on `game_start`,
//   and queues every message for `poll`.
// - Sends happen on the caller's thread through the owned `Connection`. The
//   host never echoes a peer's own traffic back, so the peer applies its own
//   `update`/`death` to its mirror directly.
//
// A peer has exactly one link, so losing it ends the session: the reader (or
// a failed send) clears `running`, empties the registry and moves the phase
// to Terminated.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use lifesim_protocol::{AttributeBag, Message};
use tracing::{debug, info, warn};

use crate::clock::GameClock;
use crate::config::PeerConfig;
use crate::error::{PreconditionError, SessionError};
use crate::phase::{Phase, PhaseCell};
use crate::registry::{Registry, RegistrySnapshot, UpsertMode};
use crate::transport::{Closer, Connection, Incoming, LinkEnd};

struct PeerShared {
    registry: Registry,
    phase: PhaseCell,
    running: AtomicBool,
    closer: Closer,
}

impl PeerShared {
    /// Tear the session down after the link is gone (or on request).
    fn terminate(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.closer.close();
        self.registry.clear();
        let left = self.phase.terminate();
        if left != Phase::Terminated {
            info!(from = %left, "peer session terminated");
        }
    }
}

pub struct Peer {
    conn: Connection,
    shared: Arc<PeerShared>,
    inbox: Receiver<Message>,
    clock: GameClock,
    name: Option<String>,
    reader: Option<JoinHandle<()>>,
}

impl Peer {
    /// Connect to a host and enter its lobby. Nothing is sent until `join`.
    pub fn connect(config: &PeerConfig, clock: GameClock) -> Result<Peer, SessionError> {
        let addr = config.host_addr();
        let (conn, incoming) =
            Connection::connect(&addr, config.connect_timeout(), config.timeouts())?;
        let shared = Arc::new(PeerShared {
            registry: Registry::new(),
            phase: PhaseCell::new(),
            running: AtomicBool::new(true),
            closer: conn.closer(),
        });
        shared.phase.enter_lobby()?;
        info!(%addr, "connected to host");

        let (tx, inbox) = mpsc::channel();
        let reader_shared = Arc::clone(&shared);
        let reader_clock = clock.clone();
        let reader = thread::Builder::new()
            .name("lifesim-peer-reader".into())
            .spawn(move || reader_loop(&reader_shared, incoming, &reader_clock, &tx))
            .map_err(|source| SessionError::Connect {
                addr: addr.clone(),
                source,
            })?;

        Ok(Peer {
            conn,
            shared,
            inbox,
            clock,
            name: None,
            reader: Some(reader),
        })
    }

    /// Announce this participant to the host. Its `roster` reply replaces the
    /// local registry mirror when it arrives.
    pub fn join(&mut self, name: &str, attributes: AttributeBag) -> Result<(), SessionError> {
        let phase = self.phase();
        if phase != Phase::Lobby {
            return Err(PreconditionError::WrongPhase {
                action: "join",
                phase,
            }
            .into());
        }
        self.send(&Message::Join {
            name: name.to_owned(),
            attributes,
        })?;
        self.name = Some(name.to_owned());
        Ok(())
    }

    /// Ask the host to start. The host decides; the outcome arrives as a
    /// `game_start` (or nothing, if refused).
    pub fn request_start(&mut self, message: &str) -> Result<(), SessionError> {
        let host = self.require_name("game_start")?;
        self.send_checked(Message::GameStart {
            host,
            message: message.to_owned(),
        })
    }

    pub fn send_chat(&mut self, text: &str) -> Result<(), SessionError> {
        let sender = self.require_name("chat")?;
        self.send_checked(Message::Chat {
            sender,
            text: text.to_owned(),
            at: self.clock.now(),
        })
    }

    /// Push this participant's changed state to the session.
    pub fn publish_update(
        &mut self,
        attributes: AttributeBag,
        mode: UpsertMode,
    ) -> Result<(), SessionError> {
        let name = self.require_name("update")?;
        let msg = Message::Update {
            name: name.clone(),
            attributes: attributes.clone(),
            replace: mode == UpsertMode::Replace,
        };
        self.send_checked(msg)?;
        self.mirror_own_update(&name, attributes, mode);
        Ok(())
    }

    /// Apply our own update to the mirror. The reader may have terminated the
    /// session since the send; `update` never re-creates an entry in the
    /// cleared registry.
    fn mirror_own_update(&self, name: &str, attributes: AttributeBag, mode: UpsertMode) {
        self.shared
            .registry
            .update(name, attributes, mode, self.clock.now());
    }

    pub fn send_social(&mut self, to: &str, kind: &str, text: &str) -> Result<(), SessionError> {
        let from = self.require_name("social_interaction")?;
        self.send_checked(Message::SocialInteraction {
            from,
            to: to.to_owned(),
            kind: kind.to_owned(),
            text: text.to_owned(),
        })
    }

    /// Announce this participant's death. The link stays open so the game
    /// can keep watching, but nothing more can be sent as this participant.
    pub fn announce_death(&mut self, reason: &str) -> Result<(), SessionError> {
        let name = self.require_name("death")?;
        self.send_checked(Message::Death {
            name: name.clone(),
            reason: reason.to_owned(),
            at: self.clock.now(),
        })?;
        self.shared.registry.remove(&name);
        self.name = None;
        Ok(())
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.shared.registry.snapshot()
    }

    pub fn phase(&self) -> Phase {
        self.shared.phase.get()
    }

    pub fn clock(&self) -> &GameClock {
        &self.clock
    }

    pub fn is_connected(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Drain every message received since the last poll (non-blocking).
    pub fn poll(&self) -> Vec<Message> {
        self.inbox.try_iter().collect()
    }

    /// Close the link and end the session.
    pub fn disconnect(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.shared.terminate();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }

    fn require_name(&self, action: &'static str) -> Result<String, PreconditionError> {
        self.name.clone().ok_or(PreconditionError::NotJoined(action))
    }

    /// Send a gameplay message if the current phase allows it.
    fn send_checked(&mut self, msg: Message) -> Result<(), SessionError> {
        let phase = self.phase();
        if !phase.permits(&msg) {
            return Err(PreconditionError::WrongPhase {
                action: msg.tag(),
                phase,
            }
            .into());
        }
        self.send(&msg)
    }

    fn send(&mut self, msg: &Message) -> Result<(), SessionError> {
        self.conn.send(msg).inspect_err(|err| {
            warn!(%err, tag = msg.tag(), "send to host failed");
            self.shared.terminate();
        })
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn reader_loop(shared: &PeerShared, mut incoming: Incoming, clock: &GameClock, tx: &Sender<Message>) {
    loop {
        match incoming.recv(&shared.running) {
            Ok(msg) => {
                if !apply(shared, &msg, clock) {
                    warn!(tag = msg.tag(), "host sent a peer-only message");
                    break;
                }
                // The game may have stopped polling; the mirror stays current.
                let _ = tx.send(msg);
            }
            Err(LinkEnd::Shutdown) => return,
            Err(LinkEnd::Closed) => {
                info!("host closed the connection");
                break;
            }
            Err(LinkEnd::Failed(err)) => {
                warn!(%err, "link to host failed");
                break;
            }
        }
    }
    shared.terminate();
}

/// Mirror one host message into the local registry and phase. Returns false
/// for messages a host never sends.
fn apply(shared: &PeerShared, msg: &Message, clock: &GameClock) -> bool {
    let now = clock.now();
    match msg {
        Message::Roster { participants } => {
            debug!(participants = participants.len(), "roster received");
            shared.registry.replace_all(participants.clone(), now);
        }
        Message::Joined { name, attributes } => {
            shared
                .registry
                .upsert(name, attributes.clone(), UpsertMode::Replace, now);
        }
        Message::Left { name } | Message::Death { name, .. } => {
            shared.registry.remove(name);
        }
        Message::Update {
            name,
            attributes,
            replace,
        } => {
            shared.registry.update(
                name,
                attributes.clone(),
                UpsertMode::from_replace_flag(*replace),
                now,
            );
        }
        Message::GameStart { host, .. } => {
            if shared.phase.activate() {
                info!(%host, "game started");
            }
        }
        Message::Chat { .. } | Message::SocialInteraction { .. } => {}
        Message::Join { .. } => return false,
    }
    true
}
