// Error taxonomy for the session layer.
//
// - `Bind` / `Connect`: the session could not start. Surfaced to the caller;
//   no session object exists afterwards.
// - `Transport`: a send or accept failed on one connection. Handled locally
//   (host prunes the link, peer terminates its session).
// - `Protocol`: malformed/oversized frame or an illegal message for the
//   current role or phase. Handled exactly like a transport failure.
// - `Precondition`: a local request that the session refused (e.g. starting
//   with a single participant). Never touches network state.
// - `HostLocked` / `Lock`: the single-host lock file could not be taken.

use std::io;
use std::path::PathBuf;

use lifesim_protocol::CodecError;
use thiserror::Error;

use crate::phase::Phase;
use crate::transport::ConnectionId;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("could not listen on {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("could not connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("transport failure on {connection}: {source}")]
    Transport {
        connection: ConnectionId,
        source: io::Error,
    },

    #[error("protocol violation on {connection}: {reason}")]
    Protocol {
        connection: ConnectionId,
        reason: ProtocolViolation,
    },

    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error("another host already holds {}", path.display())]
    HostLocked { path: PathBuf },

    #[error("lock file {}: {source}", path.display())]
    Lock { path: PathBuf, source: io::Error },

    #[error("config {}: {reason}", path.display())]
    Config { path: PathBuf, reason: String },
}

impl SessionError {
    /// Wrap a codec failure for one connection, splitting stream errors from
    /// bad bytes.
    pub(crate) fn from_codec(connection: &ConnectionId, err: CodecError) -> Self {
        match err {
            CodecError::Io(source) => SessionError::Transport {
                connection: connection.clone(),
                source,
            },
            other => SessionError::Protocol {
                connection: connection.clone(),
                reason: ProtocolViolation::Codec(other),
            },
        }
    }

    pub(crate) fn protocol(connection: &ConnectionId, reason: ProtocolViolation) -> Self {
        SessionError::Protocol {
            connection: connection.clone(),
            reason,
        }
    }

    /// True for failures confined to a single connection.
    pub fn is_link_local(&self) -> bool {
        matches!(
            self,
            SessionError::Transport { .. } | SessionError::Protocol { .. }
        )
    }
}

/// Why a connection's traffic was refused.
#[derive(Debug, Error)]
pub enum ProtocolViolation {
    #[error(transparent)]
    Codec(CodecError),
    #[error("name {0:?} is already taken by another participant")]
    DuplicateName(String),
    #[error("`{tag}` is not accepted during {phase}")]
    UnexpectedInPhase { tag: &'static str, phase: Phase },
    #[error("`{0}` may only be sent by the host")]
    HostOnly(&'static str),
    #[error("`{0}` sent before `join`")]
    NotJoined(&'static str),
    #[error("link joined as {bound:?} but spoke for {claimed:?}")]
    NameMismatch { claimed: String, bound: String },
}

/// A local request refused by the session state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreconditionError {
    #[error("need at least {need} participants to start, have {have}")]
    NotEnoughParticipants { have: usize, need: usize },
    #[error("cannot {action} while the session is {phase}")]
    WrongPhase { action: &'static str, phase: Phase },
    #[error("join the session before sending {0}")]
    NotJoined(&'static str),
    #[error("name {0:?} is already taken")]
    NameTaken(String),
    #[error("cannot send {tag}: {reason}")]
    Unencodable { tag: &'static str, reason: String },
}
