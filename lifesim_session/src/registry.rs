// Participant registry: who is in the session and their last-known state.
//
// One `Registry` per session, shared by every connection worker behind a
// single mutex. Every method is a short, pure map edit; callers must never do
// socket I/O while a registry method is running, and nothing here calls out
// to the network. Read-only consumers get an owned `snapshot()` copy.
//
// Keyed by display name: at most one `ParticipantState` per name.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use lifesim_protocol::{Archetype, AttributeBag, LogicalTime};

/// Last-known state of one participant.
#[derive(Clone, Debug, PartialEq)]
pub struct ParticipantState {
    pub name: String,
    pub attributes: AttributeBag,
    /// Game-clock time of the last upsert.
    pub updated_at: LogicalTime,
}

impl ParticipantState {
    pub fn archetype(&self) -> Archetype {
        Archetype::from_bag(&self.attributes)
    }

    fn apply(&mut self, attributes: AttributeBag, mode: UpsertMode, at: LogicalTime) {
        match mode {
            UpsertMode::Merge => self.attributes.extend(attributes),
            UpsertMode::Replace => self.attributes = attributes,
        }
        self.updated_at = at;
    }
}

/// How an upsert combines with an existing entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertMode {
    /// Overlay only the provided keys; keep the rest.
    Merge,
    /// Replace the whole bag.
    Replace,
}

impl UpsertMode {
    pub fn from_replace_flag(replace: bool) -> Self {
        if replace {
            UpsertMode::Replace
        } else {
            UpsertMode::Merge
        }
    }
}

/// Point-in-time copy of the registry, ordered by name.
pub type RegistrySnapshot = BTreeMap<String, ParticipantState>;

#[derive(Debug, Default)]
pub struct Registry {
    entries: Mutex<BTreeMap<String, ParticipantState>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic in another worker cannot leave the map half-edited (all edits
    // are single map operations), so a poisoned lock is still usable.
    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, ParticipantState>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or update `name`. Returns true if the entry is new.
    pub fn upsert(
        &self,
        name: &str,
        attributes: AttributeBag,
        mode: UpsertMode,
        at: LogicalTime,
    ) -> bool {
        let mut entries = self.entries();
        match entries.get_mut(name) {
            Some(state) => {
                state.apply(attributes, mode, at);
                false
            }
            None => {
                entries.insert(
                    name.to_owned(),
                    ParticipantState {
                        name: name.to_owned(),
                        attributes,
                        updated_at: at,
                    },
                );
                true
            }
        }
    }

    /// Update `name` only if it is still registered. Returns false (and
    /// changes nothing) for a participant that left, died or was never here.
    pub fn update(
        &self,
        name: &str,
        attributes: AttributeBag,
        mode: UpsertMode,
        at: LogicalTime,
    ) -> bool {
        let mut entries = self.entries();
        let Some(state) = entries.get_mut(name) else {
            return false;
        };
        state.apply(attributes, mode, at);
        true
    }

    /// Remove `name`. Removing an absent name is a no-op.
    pub fn remove(&self, name: &str) -> Option<ParticipantState> {
        self.entries().remove(name)
    }

    /// Replace the whole registry with a roster received from the host.
    pub fn replace_all(&self, roster: BTreeMap<String, AttributeBag>, at: LogicalTime) {
        let fresh = roster
            .into_iter()
            .map(|(name, attributes)| {
                let state = ParticipantState {
                    name: name.clone(),
                    attributes,
                    updated_at: at,
                };
                (name, state)
            })
            .collect();
        *self.entries() = fresh;
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries().contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<ParticipantState> {
        self.entries().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries().keys().cloned().collect()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.entries().clone()
    }

    /// Name → bag view, the payload of a `roster` message.
    pub fn roster(&self) -> BTreeMap<String, AttributeBag> {
        self.entries()
            .iter()
            .map(|(name, state)| (name.clone(), state.attributes.clone()))
            .collect()
    }
}
