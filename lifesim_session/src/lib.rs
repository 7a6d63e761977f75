// lifesim_session: peer-to-peer session layer for the life-simulation game.
//
// One machine hosts: it listens on a TCP port, accepts peers, keeps the
// canonical participant registry and relays every peer's traffic to the
// others. Every other machine is a peer with a single link to the host and a
// mirrored copy of the registry. The game loop drives either role through a
// small handle and never touches sockets.
//
// Module overview:
// - `transport.rs`: One TCP link split into a write half (`Connection`) and
//                   a read half (`Incoming`), plus the host's `Listener`.
// - `registry.rs`:  Participant name → attribute bag, behind one mutex.
// - `relay.rs`:     Host-side message routing, fan-out and pruning.
// - `phase.rs`:     Idle → Lobby → Active → Terminated state machine.
// - `host.rs`:      Accept loop, per-link workers, monitor, `HostHandle`.
// - `peer.rs`:      Outbound link, reader thread, registry mirror, `Peer`.
// - `session.rs`:   `Session` facade over the two roles.
// - `host_lock.rs`: Single-host advisory lock file.
// - `clock.rs`:     Shared logical game clock.
// - `config.rs`:    Host/peer settings and TOML loading.
// - `error.rs`:     `SessionError` and friends.
//
// Dependencies: `lifesim_protocol` for the wire format. Threads and blocking
// `std::net` sockets throughout; no async runtime.

pub mod clock;
pub mod config;
pub mod error;
pub mod host;
pub mod host_lock;
pub mod peer;
pub mod phase;
pub mod registry;
pub mod relay;
pub mod session;
pub mod transport;

pub use clock::GameClock;
pub use config::{HostConfig, PeerConfig, SessionFileConfig};
pub use error::{PreconditionError, ProtocolViolation, SessionError};
pub use host::{HostHandle, start_host};
pub use host_lock::HostLock;
pub use peer::Peer;
pub use phase::{MIN_PARTICIPANTS, Phase};
pub use registry::{ParticipantState, Registry, RegistrySnapshot, UpsertMode};
pub use session::{Role, Session};
