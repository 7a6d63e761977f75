// Relay engine: the host's message router.
//
// Every accepted link's worker thread hands each inbound message to
// `Relay::on_message`, which applies the registry effect (if any) and then
// fans a copy out to the right subset of links. A message is encoded once
// before the fan-out and the same bytes go to every target, so a message
// that cannot be framed is the sender's fault and never a target's. A failed
// send never aborts a fan-out: failures are collected and the failed links
// are pruned only after the whole pass, each prune producing a `left`
// broadcast of its own.
//
// Shared state and lock order:
// - `links` (the live-connection set) and the `Registry` are the two shared
//   structures, one mutex each. When both are needed, `links` is taken first.
// - Each link's `Connection` sits behind its own mutex so that two workers
//   relaying to the same peer never interleave frames. That mutex is only
//   ever held for one `send`; the shared locks are never held across a send,
//   with one exception: `join` locks the joiner's connection before releasing
//   `links`, which guarantees its `roster` reply is the first frame it sees.
//   On a first join nothing else can hold that lock, since unjoined links
//   receive no broadcasts. On a re-join an in-flight fan-out may hold it, and
//   `links` then stays locked until that send ends (at most the write
//   timeout).
//
// Only joined links (those with a bound participant name) are fan-out
// targets; a link that never joined has no participant and learns the
// session state from its `roster`. Gameplay from a participant that already
// died is dropped. The host itself is a local recipient of everything peers
// send: relayed messages are also pushed to the host's inbox for its UI.

use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lifesim_protocol::{AttributeBag, Message, encode};
use tracing::{debug, info, warn};

use crate::clock::GameClock;
use crate::error::{PreconditionError, ProtocolViolation, SessionError};
use crate::phase::{Phase, PhaseCell};
use crate::registry::{Registry, UpsertMode};
use crate::transport::{Closer, Connection, ConnectionId};

/// Name used in `game_start` when the host never joined as a participant.
const ANONYMOUS_HOST: &str = "host";

type SharedConnection = Arc<Mutex<Connection>>;

struct Link {
    conn: SharedConnection,
    closer: Closer,
    /// Participant name bound by this link's `join`.
    name: Option<String>,
}

#[derive(Default)]
struct Links {
    by_id: BTreeMap<ConnectionId, Link>,
    /// The host's own participant, which has no link.
    local_name: Option<String>,
}

impl Links {
    /// Whether `name` belongs to someone other than `claimant`.
    fn name_taken(&self, name: &str, claimant: &ConnectionId) -> bool {
        self.local_name.as_deref() == Some(name)
            || self
                .by_id
                .iter()
                .any(|(id, link)| id != claimant && link.name.as_deref() == Some(name))
    }
}

/// The participant a gameplay message claims to come from.
fn speaker(msg: &Message) -> Option<&str> {
    match msg {
        Message::Update { name, .. } | Message::Death { name, .. } => Some(name),
        Message::Chat { sender, .. } => Some(sender),
        Message::SocialInteraction { from, .. } => Some(from),
        _ => None,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Encode a message received on `from` for relaying. A message that cannot
/// be framed is the sender's protocol violation.
fn encode_from(from: &ConnectionId, msg: &Message) -> Result<Vec<u8>, SessionError> {
    encode(msg).map_err(|err| SessionError::from_codec(from, err))
}

/// Encode a host-originated message, refusing it locally if it cannot be
/// framed.
fn encode_local(msg: &Message) -> Result<Vec<u8>, PreconditionError> {
    encode(msg).map_err(|err| PreconditionError::Unencodable {
        tag: msg.tag(),
        reason: err.to_string(),
    })
}

pub struct Relay {
    links: Mutex<Links>,
    registry: Arc<Registry>,
    phase: Arc<PhaseCell>,
    clock: GameClock,
    inbox: Sender<Message>,
}

impl Relay {
    /// Create a relay over the session's shared state. The receiver is the
    /// host's local inbox.
    pub fn new(
        registry: Arc<Registry>,
        phase: Arc<PhaseCell>,
        clock: GameClock,
    ) -> (Relay, Receiver<Message>) {
        let (inbox, rx) = mpsc::channel();
        let relay = Relay {
            links: Mutex::new(Links::default()),
            registry,
            phase,
            clock,
            inbox,
        };
        (relay, rx)
    }

    /// Add a freshly accepted link to the live set.
    pub fn attach(&self, conn: Connection) {
        let id = conn.id().clone();
        let closer = conn.closer();
        let link = Link {
            conn: Arc::new(Mutex::new(conn)),
            closer,
            name: None,
        };
        lock(&self.links).by_id.insert(id, link);
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.links).by_id.len()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        lock(&self.links).by_id.keys().cloned().collect()
    }

    /// Participant name bound to a link, if it has joined.
    pub fn name_of(&self, id: &ConnectionId) -> Option<String> {
        lock(&self.links).by_id.get(id).and_then(|l| l.name.clone())
    }

    pub fn local_name(&self) -> Option<String> {
        lock(&self.links).local_name.clone()
    }

    /// Route one message received on `from`.
    ///
    /// An `Err` means the link misbehaved and must be dropped by its worker;
    /// nothing else in the session is affected.
    pub fn on_message(&self, from: &ConnectionId, msg: Message) -> Result<(), SessionError> {
        let phase = self.phase.get();
        debug!(connection = %from, tag = msg.tag(), %phase, "inbound");
        match msg {
            Message::Join { name, attributes } => {
                if phase != Phase::Lobby {
                    return Err(SessionError::protocol(
                        from,
                        ProtocolViolation::UnexpectedInPhase { tag: "join", phase },
                    ));
                }
                self.join(from, name, attributes)
            }
            Message::Roster { .. } | Message::Joined { .. } | Message::Left { .. } => Err(
                SessionError::protocol(from, ProtocolViolation::HostOnly(msg.tag())),
            ),
            Message::GameStart { .. } => {
                self.require_joined(from, &msg)?;
                let frame = encode_from(from, &msg)?;
                match self.phase.try_start(self.registry.len()) {
                    Ok(()) => {
                        info!(connection = %from, "game started by peer request");
                        // The requester learns the outcome from the echo.
                        self.broadcast_frame(msg.tag(), &frame, None);
                        self.deliver_local(msg);
                    }
                    Err(err) => warn!(connection = %from, %err, "ignoring game_start"),
                }
                Ok(())
            }
            _ if !phase.permits(&msg) => {
                debug!(connection = %from, tag = msg.tag(), %phase, "dropping out-of-phase message");
                Ok(())
            }
            Message::Update { .. }
            | Message::Chat { .. }
            | Message::SocialInteraction { .. }
            | Message::Death { .. } => {
                let speaker = self.require_joined(from, &msg)?;
                if !self.registry.contains(&speaker) {
                    debug!(
                        connection = %from,
                        participant = %speaker,
                        tag = msg.tag(),
                        "dropping message from a departed participant"
                    );
                    return Ok(());
                }
                let frame = encode_from(from, &msg)?;
                self.apply(&msg);
                self.broadcast_frame(msg.tag(), &frame, Some(from));
                self.deliver_local(msg);
                Ok(())
            }
        }
    }

    /// A link may only speak for the participant it joined as. Returns that
    /// participant's name.
    fn require_joined(&self, from: &ConnectionId, msg: &Message) -> Result<String, SessionError> {
        let Some(bound) = self.name_of(from) else {
            return Err(SessionError::protocol(
                from,
                ProtocolViolation::NotJoined(msg.tag()),
            ));
        };
        match speaker(msg) {
            Some(claimed) if claimed != bound => Err(SessionError::protocol(
                from,
                ProtocolViolation::NameMismatch {
                    claimed: claimed.to_owned(),
                    bound,
                },
            )),
            _ => Ok(bound),
        }
    }

    /// Registry effect of a gameplay message. An update never re-creates a
    /// participant that is gone.
    fn apply(&self, msg: &Message) {
        match msg {
            Message::Update {
                name,
                attributes,
                replace,
            } => {
                self.registry.update(
                    name,
                    attributes.clone(),
                    UpsertMode::from_replace_flag(*replace),
                    self.clock.now(),
                );
            }
            Message::Death { name, reason, .. } => {
                if self.registry.remove(name).is_some() {
                    info!(participant = %name, %reason, "participant died");
                }
            }
            _ => {}
        }
    }

    fn join(
        &self,
        from: &ConnectionId,
        name: String,
        attributes: AttributeBag,
    ) -> Result<(), SessionError> {
        let joined = Message::Joined {
            name: name.clone(),
            attributes: attributes.clone(),
        };
        let joined_frame = encode_from(from, &joined)?;

        let mut links = lock(&self.links);
        if links.name_taken(&name, from) {
            return Err(SessionError::protocol(
                from,
                ProtocolViolation::DuplicateName(name),
            ));
        }
        let Some(link) = links.by_id.get_mut(from) else {
            // Pruned while this message was in flight.
            return Ok(());
        };
        let renamed_from = link.name.replace(name.clone()).filter(|prev| *prev != name);
        let conn = Arc::clone(&link.conn);
        if let Some(prev) = &renamed_from {
            self.registry.remove(prev);
        }
        let is_new = self
            .registry
            .upsert(&name, attributes, UpsertMode::Replace, self.clock.now());
        let participants = self.registry.roster();
        let mut writer = lock(&conn);
        drop(links);

        let reply = writer.send(&Message::Roster { participants });
        drop(writer);
        if is_new {
            info!(connection = %from, participant = %name, "participant joined");
        } else {
            debug!(connection = %from, participant = %name, "participant re-joined");
        }
        if let Err(err) = reply {
            warn!(connection = %from, %err, "roster reply failed");
            self.prune(vec![from.clone()]);
            return Ok(());
        }

        if let Some(prev) = renamed_from {
            self.broadcast(&Message::Left { name: prev.clone() }, Some(from));
            self.deliver_local(Message::Left { name: prev });
        }
        self.broadcast_frame(joined.tag(), &joined_frame, Some(from));
        self.deliver_local(joined);
        Ok(())
    }

    /// Register the host's own participant and announce it.
    pub fn join_local(&self, name: &str, attributes: AttributeBag) -> Result<(), PreconditionError> {
        let phase = self.phase.get();
        if phase != Phase::Lobby {
            return Err(PreconditionError::WrongPhase {
                action: "join",
                phase,
            });
        }
        let joined = Message::Joined {
            name: name.to_owned(),
            attributes: attributes.clone(),
        };
        let frame = encode_local(&joined)?;
        let renamed_from = {
            let mut links = lock(&self.links);
            if links
                .by_id
                .values()
                .any(|link| link.name.as_deref() == Some(name))
            {
                return Err(PreconditionError::NameTaken(name.to_owned()));
            }
            let renamed_from = links
                .local_name
                .replace(name.to_owned())
                .filter(|prev| prev != name);
            if let Some(prev) = &renamed_from {
                self.registry.remove(prev);
            }
            self.registry
                .upsert(name, attributes, UpsertMode::Replace, self.clock.now());
            renamed_from
        };
        info!(participant = %name, "host joined as participant");
        if let Some(prev) = renamed_from {
            self.broadcast(&Message::Left { name: prev }, None);
        }
        self.broadcast_frame(joined.tag(), &frame, None);
        Ok(())
    }

    /// Lobby → Active on the host's own command, then tell everyone.
    pub fn start_game(&self, message: &str) -> Result<(), PreconditionError> {
        let host = self
            .local_name()
            .unwrap_or_else(|| ANONYMOUS_HOST.to_owned());
        let start = Message::GameStart {
            host: host.clone(),
            message: message.to_owned(),
        };
        let frame = encode_local(&start)?;
        self.phase.try_start(self.registry.len())?;
        info!(%host, participants = self.registry.len(), "game started");
        self.broadcast_frame(start.tag(), &frame, None);
        Ok(())
    }

    /// Apply and send a message that originates on the host.
    ///
    /// A `death` for the host's own participant also ends its membership:
    /// later host messages are refused as not joined.
    pub fn publish(&self, msg: &Message) -> Result<(), PreconditionError> {
        let phase = self.phase.get();
        if !phase.permits(msg) {
            return Err(PreconditionError::WrongPhase {
                action: msg.tag(),
                phase,
            });
        }
        let frame = encode_local(msg)?;
        self.apply(msg);
        if let Message::Death { name, .. } = msg {
            let mut links = lock(&self.links);
            if links.local_name.as_deref() == Some(name) {
                links.local_name = None;
            }
        }
        self.broadcast_frame(msg.tag(), &frame, None);
        Ok(())
    }

    /// Send `msg` to every joined link except `excluding`.
    ///
    /// Returns the links that failed; by the time this returns they have
    /// already been pruned. A message that cannot be framed goes nowhere.
    pub fn broadcast(&self, msg: &Message, excluding: Option<&ConnectionId>) -> Vec<ConnectionId> {
        match encode(msg) {
            Ok(frame) => self.broadcast_frame(msg.tag(), &frame, excluding),
            Err(err) => {
                warn!(tag = msg.tag(), %err, "not broadcasting unencodable message");
                Vec::new()
            }
        }
    }

    fn broadcast_frame(
        &self,
        tag: &'static str,
        frame: &[u8],
        excluding: Option<&ConnectionId>,
    ) -> Vec<ConnectionId> {
        let failed = self.fan_out(tag, frame, excluding);
        if !failed.is_empty() {
            self.prune(failed.clone());
        }
        failed
    }

    /// One pass over a snapshot of the joined links, writing the same frame
    /// to each. Never shrinks the target list mid-pass; failures are only
    /// collected.
    fn fan_out(
        &self,
        tag: &'static str,
        frame: &[u8],
        excluding: Option<&ConnectionId>,
    ) -> Vec<ConnectionId> {
        let targets: Vec<(ConnectionId, SharedConnection)> = {
            let links = lock(&self.links);
            links
                .by_id
                .iter()
                .filter(|(id, link)| link.name.is_some() && Some(*id) != excluding)
                .map(|(id, link)| (id.clone(), Arc::clone(&link.conn)))
                .collect()
        };

        let mut failed = Vec::new();
        for (id, conn) in targets {
            if let Err(err) = lock(&conn).send_frame(frame) {
                warn!(connection = %id, %err, tag, "send failed");
                failed.push(id);
            }
        }
        failed
    }

    /// Drop failed links, then tell the survivors who left. A `left`
    /// broadcast can itself fail, so this runs until no new failures appear.
    fn prune(&self, mut pending: Vec<ConnectionId>) {
        while let Some(id) = pending.pop() {
            let Some(name) = self.detach(&id) else {
                continue;
            };
            let left = Message::Left { name };
            match encode(&left) {
                Ok(frame) => pending.extend(self.fan_out(left.tag(), &frame, None)),
                Err(err) => warn!(%err, "could not frame `left`"),
            }
            self.deliver_local(left);
        }
    }

    /// Remove a link and its participant; close its socket. Returns the
    /// participant name if the link had joined and was still live.
    ///
    /// A participant that already died is no longer in the registry but
    /// still produces a `left`.
    fn detach(&self, id: &ConnectionId) -> Option<String> {
        let link = {
            let mut links = lock(&self.links);
            let link = links.by_id.remove(id)?;
            if let Some(name) = &link.name {
                self.registry.remove(name);
            }
            link
        };
        link.closer.close();
        info!(
            connection = %id,
            participant = link.name.as_deref().unwrap_or("-"),
            "connection dropped"
        );
        link.name
    }

    /// A link's receive loop ended. Safe to call for links already pruned.
    pub fn disconnect(&self, id: &ConnectionId) {
        self.prune(vec![id.clone()]);
    }

    fn deliver_local(&self, msg: Message) {
        // The host may have stopped polling; relaying carries on regardless.
        let _ = self.inbox.send(msg);
    }

    /// Close every link and forget every participant.
    pub fn shutdown(&self) {
        let links = {
            let mut links = lock(&self.links);
            links.local_name = None;
            let drained = std::mem::take(&mut links.by_id);
            self.registry.clear();
            drained
        };
        for link in links.values() {
            link.closer.close();
        }
        if !links.is_empty() {
            info!(connections = links.len(), "closed all connections");
        }
    }
}
