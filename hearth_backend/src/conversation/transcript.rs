//! Prompt-facing renderings of the window.
//!
//! `transcript` yields alias-labelled lines for summaries; `chat_messages`
//! builds the alternating user/assistant turns the response models expect.

use super::{ContactBook, ConversationWindow, Event, EventId, EventKind, ReactionGlyph};
use crate::llm_client::Message;

const TARGET_PREVIEW_CHARS: usize = 60;

impl ConversationWindow {
    /// Formatted lines for the most recent `max_n` events, oldest first.
    ///
    /// The iterator is lazy and cheap to clone; call again to restart.
    pub fn transcript<'a>(
        &'a self,
        max_n: usize,
        contacts: &'a ContactBook,
    ) -> impl Iterator<Item = String> + Clone + 'a {
        let skip = self.len().saturating_sub(max_n);
        self.iter().skip(skip).map(move |event| {
            let alias = contacts.resolve(&event.sender, event.is_self);
            format!("{}{}", alias, self.describe(event, ": "))
        })
    }

    /// Multi-turn conversation for the most recent `max_n` events.
    ///
    /// Self events become assistant turns. Consecutive foreign events are merged
    /// into one user turn, each line tagged with the sender's role. The result
    /// always starts with a user turn.
    pub fn chat_messages(&self, max_n: usize, contacts: &ContactBook) -> Vec<Message> {
        let skip = self.len().saturating_sub(max_n);
        let mut messages = Vec::new();
        let mut pending_user: Vec<String> = Vec::new();

        for event in self.iter().skip(skip) {
            if event.is_self {
                if !pending_user.is_empty() {
                    messages.push(Message::user(pending_user.join("\n")));
                    pending_user.clear();
                }
                let content = match &event.kind {
                    EventKind::Text(text) => text.clone(),
                    EventKind::Reaction { .. } => format!("({})", self.describe(event, "").trim()),
                };
                messages.push(Message::assistant(content));
            } else {
                let role = contacts.role(&event.sender, false);
                pending_user.push(format!("[{}]{}", role, self.describe(event, " ")));
            }
        }

        if !pending_user.is_empty() {
            messages.push(Message::user(pending_user.join("\n")));
        }

        if messages.first().is_some_and(|m| m.role == "assistant") {
            messages.insert(0, Message::user("[context] Conversation started"));
        }

        messages
    }

    /// Body of a line without the sender. Text events are prefixed with
    /// `text_separator`; reactions always start with a space.
    fn describe(&self, event: &Event, text_separator: &str) -> String {
        match &event.kind {
            EventKind::Text(text) => format!("{}{}", text_separator, text),
            EventKind::Reaction {
                glyph,
                removed,
                target,
            } => format!(" {}", self.reaction_phrase(*glyph, *removed, *target)),
        }
    }

    fn reaction_phrase(&self, glyph: ReactionGlyph, removed: bool, target: Option<EventId>) -> String {
        let verb = if removed { "removed" } else { "reacted" };
        let preposition = if removed { "from" } else { "to" };

        // Targets that were evicted (or never seen) render as a bare reaction.
        match target.and_then(|id| self.get(id)).and_then(Event::body) {
            Some(body) => format!(
                "{} {} {} \"{}\"",
                verb,
                glyph.emoji(),
                preposition,
                preview(body, TARGET_PREVIEW_CHARS)
            ),
            None => format!("{} {}", verb, glyph.emoji()),
        }
    }
}

pub fn preview(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContactEntry;
    use chrono::{TimeZone, Utc};

    fn contacts() -> ContactBook {
        ContactBook::new(
            &[
                ContactEntry {
                    alias: "Mom".to_string(),
                    handles: vec!["mom@example.com".to_string()],
                    role: Some("mom".to_string()),
                },
                ContactEntry {
                    alias: "Dad".to_string(),
                    handles: vec!["+15550002222".to_string()],
                    role: Some("dad".to_string()),
                },
            ],
            "Meg",
        )
    }

    fn at(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn sample_window() -> ConversationWindow {
        let mut window = ConversationWindow::new(3);
        window.ingest(vec![
            Event::text(EventId::source(1), "mom@example.com", "dinner at 7?", false, at(1)),
            Event::text(EventId::source(2), "me", "sounds good", true, at(2)),
            Event::reaction(
                EventId::source(3),
                "+15550002222",
                ReactionGlyph::Like,
                Some(EventId::source(2)),
                false,
                at(3),
            ),
            Event::text(EventId::source(4), "+15550002222", "bring dessert", false, at(4)),
        ]);
        window
    }

    #[test]
    fn transcript_resolves_aliases_and_reaction_targets() {
        let window = sample_window();
        let book = contacts();
        let lines: Vec<String> = window.transcript(10, &book).collect();
        assert_eq!(
            lines,
            vec![
                "Meg: sounds good".to_string(),
                "Dad reacted 👍 to \"sounds good\"".to_string(),
                "Dad: bring dessert".to_string(),
            ]
        );

        let tail: Vec<String> = window.transcript(1, &book).collect();
        assert_eq!(tail, vec!["Dad: bring dessert".to_string()]);
    }

    #[test]
    fn transcript_is_restartable() {
        let window = sample_window();
        let book = contacts();
        let lines = window.transcript(2, &book);
        let first: Vec<String> = lines.clone().collect();
        let second: Vec<String> = lines.collect();
        assert_eq!(first, second);
    }

    #[test]
    fn reaction_to_evicted_target_uses_generic_line() {
        let mut window = ConversationWindow::new(2);
        window.ingest(vec![
            Event::text(EventId::source(1), "mom@example.com", "photo", false, at(1)),
            Event::text(EventId::source(2), "mom@example.com", "so pretty", false, at(2)),
            Event {
                id: EventId::source(3),
                sender: "mom@example.com".to_string(),
                kind: EventKind::Reaction {
                    glyph: ReactionGlyph::Love,
                    removed: true,
                    target: Some(EventId::source(1)),
                },
                is_self: false,
                timestamp: at(3),
            },
        ]);
        let book = contacts();
        let last = window.transcript(1, &book).next();
        assert_eq!(last.as_deref(), Some("Mom removed ❤️"));
    }

    #[test]
    fn chat_messages_merge_foreign_turns_and_start_with_user() {
        let window = sample_window();
        let messages = window.chat_messages(10, &contacts());

        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[0].content, "[context] Conversation started");
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].content, "sounds good");
        assert_eq!(messages[2].role, "user");
        assert_eq!(
            messages[2].content,
            "[dad] reacted 👍 to \"sounds good\"\n[dad] bring dessert"
        );
    }

    #[test]
    fn preview_truncates_on_char_boundaries() {
        assert_eq!(preview("  short  ", 10), "short");
        assert_eq!(preview("今天天气不错啊", 4), "今天天气...");
    }
}
