pub mod contacts;
pub mod transcript;
pub mod window;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use contacts::ContactBook;
pub use window::ConversationWindow;

/// Identifier of an event.
///
/// `seq` is the row id assigned by the message source. `local` is zero for every
/// source event; synthetic self events recorded right after a send reuse the latest
/// `seq` and take a non-zero `local`, so they sort directly after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId {
    pub seq: i64,
    pub local: u32,
}

impl EventId {
    pub fn source(seq: i64) -> Self {
        Self { seq, local: 0 }
    }

    pub fn local(after_seq: i64, local: u32) -> Self {
        Self {
            seq: after_seq,
            local,
        }
    }

    pub fn is_local(&self) -> bool {
        self.local != 0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.local == 0 {
            write!(f, "{}", self.seq)
        } else {
            write!(f, "{}+{}", self.seq, self.local)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionGlyph {
    Love,
    Like,
    Dislike,
    Laugh,
    Emphasize,
    Question,
}

impl ReactionGlyph {
    pub fn emoji(self) -> &'static str {
        match self {
            ReactionGlyph::Love => "❤️",
            ReactionGlyph::Like => "👍",
            ReactionGlyph::Dislike => "👎",
            ReactionGlyph::Laugh => "😂",
            ReactionGlyph::Emphasize => "‼️",
            ReactionGlyph::Question => "❓",
        }
    }

    /// Index in the Messages tapback table (0 = love .. 5 = question).
    pub fn from_tapback_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(ReactionGlyph::Love),
            1 => Some(ReactionGlyph::Like),
            2 => Some(ReactionGlyph::Dislike),
            3 => Some(ReactionGlyph::Laugh),
            4 => Some(ReactionGlyph::Emphasize),
            5 => Some(ReactionGlyph::Question),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Text(String),
    Reaction {
        glyph: ReactionGlyph,
        /// The reaction was withdrawn rather than added.
        removed: bool,
        target: Option<EventId>,
    },
}

/// One unit of conversation activity. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub sender: String,
    pub kind: EventKind,
    pub is_self: bool,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn text(
        id: EventId,
        sender: impl Into<String>,
        text: impl Into<String>,
        is_self: bool,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            sender: sender.into(),
            kind: EventKind::Text(text.into()),
            is_self,
            timestamp,
        }
    }

    pub fn reaction(
        id: EventId,
        sender: impl Into<String>,
        glyph: ReactionGlyph,
        target: Option<EventId>,
        is_self: bool,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            sender: sender.into(),
            kind: EventKind::Reaction {
                glyph,
                removed: false,
                target,
            },
            is_self,
            timestamp,
        }
    }

    pub fn ordering_key(&self) -> (DateTime<Utc>, EventId) {
        (self.timestamp, self.id)
    }

    pub fn body(&self) -> Option<&str> {
        match &self.kind {
            EventKind::Text(text) => Some(text.as_str()),
            EventKind::Reaction { .. } => None,
        }
    }

    pub fn is_reaction(&self) -> bool {
        matches!(self.kind, EventKind::Reaction { .. })
    }

    pub fn is_foreign(&self) -> bool {
        !self.is_self
    }
}

/// Watermark of the last source row already incorporated.
///
/// Only moves forward; [`Cursor::reset`] is the single explicit rewind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cursor(i64);

impl Cursor {
    pub fn at(seq: i64) -> Self {
        Self(seq)
    }

    pub fn seq(&self) -> i64 {
        self.0
    }

    /// Moves to `seq` if it lies ahead. Returns whether the cursor moved.
    pub fn advance_to(&mut self, seq: i64) -> bool {
        if seq > self.0 {
            self.0 = seq;
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self, seq: i64) {
        self.0 = seq;
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_ids_sort_after_their_source_row() {
        let source = EventId::source(10);
        let local = EventId::local(10, 1);
        assert!(source < local);
        assert!(local < EventId::source(11));
        assert_eq!(local.to_string(), "10+1");
    }

    #[test]
    fn cursor_never_moves_backwards() {
        let mut cursor = Cursor::at(5);
        assert!(cursor.advance_to(7));
        assert!(!cursor.advance_to(3));
        assert_eq!(cursor.seq(), 7);

        cursor.reset(2);
        assert_eq!(cursor.seq(), 2);
    }

    #[test]
    fn tapback_indices_map_to_glyphs() {
        assert_eq!(ReactionGlyph::from_tapback_index(0), Some(ReactionGlyph::Love));
        assert_eq!(ReactionGlyph::from_tapback_index(5).map(|g| g.emoji()), Some("❓"));
        assert_eq!(ReactionGlyph::from_tapback_index(6), None);
    }
}
