// Session phase state machine.
//
//   Idle ──bind/connect──▶ Lobby ──game_start──▶ Active
//                            │                     │
//                            └──────disconnect─────┴──▶ Terminated
//
// `PhaseCell` stores the phase in an atomic so every connection worker can
// read it without taking a lock. Transitions are compare-and-swap, so two
// racing start requests cannot both succeed and nothing ever moves Active
// back to Lobby.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use lifesim_protocol::Message;

use crate::error::PreconditionError;

/// Participants required before the host may start the game.
pub const MIN_PARTICIPANTS: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// No network role chosen yet.
    Idle,
    /// Role chosen; participants are joining.
    Lobby,
    /// Gameplay messages flow; joining and starting are closed.
    Active,
    /// All connections closed and the registry cleared.
    Terminated,
}

impl Phase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Phase::Idle,
            1 => Phase::Lobby,
            2 => Phase::Active,
            _ => Phase::Terminated,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Phase::Idle => 0,
            Phase::Lobby => 1,
            Phase::Active => 2,
            Phase::Terminated => 3,
        }
    }

    /// Whether a relayed message is meaningful in this phase.
    ///
    /// `join` is lobby-only. Social interactions and deaths belong to active
    /// play. Chat and state updates flow in both.
    pub fn permits(self, msg: &Message) -> bool {
        match (self, msg) {
            (Phase::Idle | Phase::Terminated, _) => false,
            (Phase::Lobby, Message::SocialInteraction { .. } | Message::Death { .. }) => false,
            (Phase::Active, Message::Join { .. } | Message::GameStart { .. }) => false,
            _ => true,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Lobby => "in the lobby",
            Phase::Active => "active",
            Phase::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Shared, lock-free holder of the current phase.
#[derive(Debug)]
pub struct PhaseCell {
    state: AtomicU8,
}

impl Default for PhaseCell {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(Phase::Idle.as_u8()),
        }
    }

    pub fn get(&self) -> Phase {
        Phase::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: Phase, to: Phase) -> Result<(), Phase> {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(Phase::from_u8)
    }

    /// Idle → Lobby, after a successful bind (host) or connect (peer).
    pub fn enter_lobby(&self) -> Result<(), PreconditionError> {
        self.transition(Phase::Idle, Phase::Lobby)
            .map_err(|phase| PreconditionError::WrongPhase {
                action: "open a lobby",
                phase,
            })
    }

    /// Lobby → Active for the host. Requires `MIN_PARTICIPANTS` registered
    /// participants; on failure the phase is left untouched.
    pub fn try_start(&self, participants: usize) -> Result<(), PreconditionError> {
        let phase = self.get();
        if phase != Phase::Lobby {
            return Err(PreconditionError::WrongPhase {
                action: "start the game",
                phase,
            });
        }
        if participants < MIN_PARTICIPANTS {
            return Err(PreconditionError::NotEnoughParticipants {
                have: participants,
                need: MIN_PARTICIPANTS,
            });
        }
        self.transition(Phase::Lobby, Phase::Active)
            .map_err(|phase| PreconditionError::WrongPhase {
                action: "start the game",
                phase,
            })
    }

    /// Lobby → Active for a peer that observed `game_start`. Returns whether
    /// the phase actually changed (a repeated start is a no-op).
    pub fn activate(&self) -> bool {
        self.transition(Phase::Lobby, Phase::Active).is_ok()
    }

    /// Any phase → Terminated. Returns the phase that was left.
    pub fn terminate(&self) -> Phase {
        Phase::from_u8(self.state.swap(Phase::Terminated.as_u8(), Ordering::SeqCst))
    }
}
