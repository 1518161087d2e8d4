use crate::identity::Profile;
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// The canonical 1:1 thread between two users.
///
/// The participant pair is stored in normalized (sorted) order so that the
/// uniqueness constraint on `(participant_a, participant_b)` holds regardless
/// of which side initiated contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub participant_a: Uuid,
    pub participant_b: Uuid,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
}

impl Conversation {
    pub fn involves(&self, user_id: Uuid) -> bool {
        self.participant_a == user_id || self.participant_b == user_id
    }

    /// The participant that is not `user_id`, or `None` if `user_id` is not
    /// part of this conversation.
    pub fn other_participant(&self, user_id: Uuid) -> Option<Uuid> {
        if self.participant_a == user_id {
            Some(self.participant_b)
        } else if self.participant_b == user_id {
            Some(self.participant_a)
        } else {
            None
        }
    }
}

/// A single direct message. Immutable after append, except for the
/// recipient's read flag which only ever transitions false to true.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub read_by_recipient: bool,
}

/// Per-user view of one conversation: the other side's identity, the latest
/// message, and the unread count. Always derived from message rows, never
/// stored independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: Uuid,
    pub other_participant: Profile,
    pub last_message: Option<Message>,
    pub last_message_at: DateTime<Utc>,
    pub unread_count: i64,
}

/// One bounded page of a conversation's message log.
#[derive(Debug, Clone, Serialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    /// Present when the page was full; pass it back to continue the scan.
    pub next_cursor: Option<Cursor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Restartable position in a conversation's message log, encoded as
/// `<created_at>/<message_id>`. Ties on `created_at` are broken by the
/// message id so every reader sees one total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.created_at.to_rfc3339(), self.id)
    }
}

impl FromStr for Cursor {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (created_at, id) = s
            .split_once('/')
            .ok_or_else(|| anyhow!("cursor must be '<created_at>/<message_id>'"))?;
        Ok(Self {
            created_at: DateTime::parse_from_rfc3339(created_at)?.with_timezone(&Utc),
            id: Uuid::parse_str(id)?,
        })
    }
}

impl Serialize for Cursor {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cursor {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(a: Uuid, b: Uuid) -> Conversation {
        let now = Utc::now();
        Conversation {
            id: Uuid::new_v4(),
            participant_a: a,
            participant_b: b,
            created_at: now,
            last_message_at: now,
        }
    }

    #[test]
    fn test_other_participant() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv = conversation(a, b);
        assert_eq!(conv.other_participant(a), Some(b));
        assert_eq!(conv.other_participant(b), Some(a));
        assert_eq!(conv.other_participant(Uuid::new_v4()), None);
        assert!(conv.involves(a));
        assert!(!conv.involves(Uuid::new_v4()));
    }

    #[test]
    fn test_cursor_round_trip() {
        let cursor = Cursor {
            created_at: Utc::now(),
            id: Uuid::new_v4(),
        };
        let parsed: Cursor = cursor.to_string().parse().unwrap();
        assert_eq!(parsed, cursor);
    }

    #[test]
    fn test_cursor_rejects_garbage() {
        assert!("not-a-cursor".parse::<Cursor>().is_err());
        assert!("2024-01-01T00:00:00Z/not-a-uuid".parse::<Cursor>().is_err());
    }
}
