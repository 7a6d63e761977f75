// Session facade: one multiplayer attempt, in whichever role was chosen.
//
// `Session::Idle` until `host` or `join` succeeds. A failed start leaves the
// session Idle. `disconnect` tears the active role down (its threads are
// joined and its links closed) and returns the session to Idle, ready for
// the next attempt.

use std::mem;

use crate::clock::GameClock;
use crate::config::{HostConfig, PeerConfig};
use crate::error::{PreconditionError, SessionError};
use crate::host::{HostHandle, start_host};
use crate::host_lock::HostLock;
use crate::peer::Peer;
use crate::phase::Phase;
use crate::registry::RegistrySnapshot;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Host,
    Peer,
}

#[derive(Default)]
pub enum Session {
    #[default]
    Idle,
    Host(HostHandle),
    Peer(Peer),
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the single-host lock and start hosting.
    pub fn host(&mut self, config: &HostConfig, clock: GameClock) -> Result<(), SessionError> {
        self.ensure_idle("host")?;
        let lock = HostLock::acquire(&config.lock_path)?;
        *self = Session::Host(start_host(config, lock, clock)?);
        Ok(())
    }

    /// Connect to a host as a peer. Call `Peer::join` to enter the roster.
    pub fn join(&mut self, config: &PeerConfig, clock: GameClock) -> Result<(), SessionError> {
        self.ensure_idle("join")?;
        *self = Session::Peer(Peer::connect(config, clock)?);
        Ok(())
    }

    pub fn as_host(&self) -> Option<&HostHandle> {
        match self {
            Session::Host(host) => Some(host),
            _ => None,
        }
    }

    pub fn as_peer_mut(&mut self) -> Option<&mut Peer> {
        match self {
            Session::Peer(peer) => Some(peer),
            _ => None,
        }
    }

    fn ensure_idle(&self, action: &'static str) -> Result<(), SessionError> {
        match self.phase() {
            Phase::Idle => Ok(()),
            phase => Err(PreconditionError::WrongPhase { action, phase }.into()),
        }
    }

    pub fn role(&self) -> Option<Role> {
        match self {
            Session::Idle => None,
            Session::Host(_) => Some(Role::Host),
            Session::Peer(_) => Some(Role::Peer),
        }
    }

    /// Phase of the active role. A peer whose link died reads Terminated
    /// until `disconnect` resets the session.
    pub fn phase(&self) -> Phase {
        match self {
            Session::Idle => Phase::Idle,
            Session::Host(host) => host.phase(),
            Session::Peer(peer) => peer.phase(),
        }
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        match self {
            Session::Idle => RegistrySnapshot::new(),
            Session::Host(host) => host.snapshot(),
            Session::Peer(peer) => peer.snapshot(),
        }
    }

    /// Tear the active role down and return to Idle.
    pub fn disconnect(&mut self) {
        match mem::take(self) {
            Session::Idle => {}
            Session::Host(host) => host.stop(),
            Session::Peer(peer) => peer.disconnect(),
        }
    }
}
