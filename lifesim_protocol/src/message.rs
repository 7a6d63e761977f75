// Protocol messages exchanged between the host and its peers.
//
// A single closed enum covers both directions. Each variant serializes as a
// JSON object tagged by `"type"` (snake_case), so the wire stays
// self-describing while the session layer matches on variants instead of
// strings. Decoding happens once, at the transport boundary (`framing.rs`).
//
// Direction per tag:
//   join                  peer -> host
//   roster                host -> one peer (reply to its join)
//   joined, left          host -> everyone else
//   update, chat, social_interaction, death
//                         either side -> everyone else
//   game_start            host -> everyone

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{AttributeBag, LogicalTime};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// A participant asks to enter the session.
    Join {
        name: String,
        attributes: AttributeBag,
    },
    /// Full registry contents, sent only to a participant that just joined.
    Roster {
        participants: BTreeMap<String, AttributeBag>,
    },
    /// Someone else entered the session.
    Joined {
        name: String,
        attributes: AttributeBag,
    },
    /// Someone left the session (disconnect or broken link).
    Left { name: String },
    /// New state for a participant. Merged over the existing bag unless
    /// `replace` is set.
    Update {
        name: String,
        attributes: AttributeBag,
        #[serde(default)]
        replace: bool,
    },
    Chat {
        sender: String,
        text: String,
        at: LogicalTime,
    },
    /// The host moved the session from lobby to active play.
    GameStart { host: String, message: String },
    SocialInteraction {
        from: String,
        to: String,
        kind: String,
        text: String,
    },
    /// A participant died; receivers drop it from their registry.
    Death {
        name: String,
        reason: String,
        at: LogicalTime,
    },
}

impl Message {
    /// Wire tag of this message, as it appears in the `"type"` field.
    pub fn tag(&self) -> &'static str {
        match self {
            Message::Join { .. } => "join",
            Message::Roster { .. } => "roster",
            Message::Joined { .. } => "joined",
            Message::Left { .. } => "left",
            Message::Update { .. } => "update",
            Message::Chat { .. } => "chat",
            Message::GameStart { .. } => "game_start",
            Message::SocialInteraction { .. } => "social_interaction",
            Message::Death { .. } => "death",
        }
    }

    /// Partial state update (merge semantics).
    pub fn update(name: impl Into<String>, attributes: AttributeBag) -> Self {
        Message::Update {
            name: name.into(),
            attributes,
            replace: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AttrValue;

    #[test]
    fn wire_tags_are_snake_case() {
        let msg = Message::SocialInteraction {
            from: "Aylin".into(),
            to: "Kerem".into(),
            kind: "chat".into(),
            text: "merhaba".into(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "social_interaction");
        assert_eq!(value["type"], msg.tag());
    }

    #[test]
    fn update_without_replace_field_defaults_to_merge() {
        let json = r#"{"type":"update","name":"Aylin","attributes":{"mood":55}}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        match msg {
            Message::Update {
                name,
                attributes,
                replace,
            } => {
                assert_eq!(name, "Aylin");
                assert!(!replace);
                assert_eq!(attributes["mood"], AttrValue::Int(55));
            }
            other => panic!("expected Update, got {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let json = r#"{"type":"player_join","player_name":"Aylin"}"#;
        assert!(serde_json::from_str::<Message>(json).is_err());
    }
}
