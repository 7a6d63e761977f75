// Core value types for the multiplayer protocol.
//
// These are shared by `message.rs` (wire messages) and the session layer's
// participant registry (`lifesim_session::registry`). The session core treats
// attribute bags as opaque: it stores, merges and forwards them but never
// interprets the values. Only `Archetype` reads a single well-known key so the
// simulation collaborator can pick per-kind behaviour coefficients.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical game time in minutes since the simulation epoch. Derived from the
/// owning process's game clock, never from wall-clock time.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LogicalTime(pub u64);

impl LogicalTime {
    pub fn plus_minutes(self, minutes: u64) -> Self {
        Self(self.0.saturating_add(minutes))
    }
}

impl fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let days = self.0 / (24 * 60);
        let hours = (self.0 / 60) % 24;
        let minutes = self.0 % 60;
        write!(f, "day {days}, {hours:02}:{minutes:02}")
    }
}

/// One value inside an attribute bag. The set is closed: the session layer
/// only ever has to carry numbers, text and flags.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Flag(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        Self::Flag(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for AttrValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Opaque per-participant state: attribute name to value. Ordered so that
/// rosters serialize deterministically.
pub type AttributeBag = BTreeMap<String, AttrValue>;

/// Bag key carrying the participant's archetype.
pub const ARCHETYPE_KEY: &str = "character_type";

/// Participant kind, chosen once at character creation.
///
/// Each kind differs from the others only through its `Coefficients`; there is
/// no per-kind behaviour code in the session layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Archetype {
    Ambitious,
    Social,
    Creative,
    #[default]
    Balanced,
}

/// Behaviour-affecting multipliers for one archetype. Applied by the
/// simulation, carried here so both roles agree on them.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Coefficients {
    /// Multiplier on job experience gained per shift.
    pub experience: f64,
    /// Multiplier on positive relationship changes.
    pub relationship_gain: f64,
    /// Multiplier on salary when working as an artist.
    pub artist_income: f64,
    /// Multiplier on negative need deltas (energy, hunger, hygiene).
    pub need_decay: f64,
}

impl Archetype {
    pub const ALL: [Archetype; 4] = [
        Archetype::Ambitious,
        Archetype::Social,
        Archetype::Creative,
        Archetype::Balanced,
    ];

    pub fn coefficients(self) -> Coefficients {
        let neutral = Coefficients {
            experience: 1.0,
            relationship_gain: 1.0,
            artist_income: 1.0,
            need_decay: 1.0,
        };
        match self {
            Archetype::Ambitious => Coefficients {
                experience: 1.2,
                ..neutral
            },
            Archetype::Social => Coefficients {
                relationship_gain: 1.5,
                ..neutral
            },
            Archetype::Creative => Coefficients {
                artist_income: 1.3,
                ..neutral
            },
            Archetype::Balanced => Coefficients {
                need_decay: 0.8,
                ..neutral
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Archetype::Ambitious => "ambitious",
            Archetype::Social => "social",
            Archetype::Creative => "creative",
            Archetype::Balanced => "balanced",
        }
    }

    /// Parse a bag value. Unknown names fall back to `Balanced`.
    pub fn from_name(name: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str().eq_ignore_ascii_case(name))
            .unwrap_or_default()
    }

    /// Read the archetype out of an attribute bag.
    pub fn from_bag(bag: &AttributeBag) -> Self {
        match bag.get(ARCHETYPE_KEY) {
            Some(AttrValue::Text(name)) => Self::from_name(name),
            _ => Self::default(),
        }
    }
}
