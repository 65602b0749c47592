use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::Local;
use regex_lite::Regex;

use super::planner::Plan;
use super::prompts::{catch_up_instruction, live_instruction, response_system_prompt, startup_topic_prompt};
use super::summarizer::Summary;
use super::WindowView;
use crate::knowledge::KnowledgeBase;
use crate::llm_client::{generate_within, GenerationProvider, GenerationRequest, Message};

pub const LIVE_REPLY_TOKENS: u32 = 100;
pub const CATCH_UP_REPLY_TOKENS: u32 = 80;
pub const STARTUP_TOPIC_TOKENS: u32 = 100;
const SKIP_TOKEN: &str = "SKIP";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyDecision {
    Send(String),
    Skip(String),
}

impl ReplyDecision {
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::Skip(reason.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// Reacting to messages that just arrived.
    Live,
    /// Startup pass over the backlog; the model may answer `SKIP`.
    CatchUp,
}

impl ResponseMode {
    fn max_tokens(self) -> u32 {
        match self {
            Self::Live => LIVE_REPLY_TOKENS,
            Self::CatchUp => CATCH_UP_REPLY_TOKENS,
        }
    }
}

pub struct Responder {
    provider: Arc<dyn GenerationProvider>,
    model: Option<String>,
    persona: String,
    bot_name: String,
    knowledge: KnowledgeBase,
    timeout: Duration,
}

impl Responder {
    pub fn new(
        provider: Arc<dyn GenerationProvider>,
        model: Option<String>,
        persona: impl Into<String>,
        bot_name: impl Into<String>,
        knowledge: KnowledgeBase,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            model,
            persona: persona.into(),
            bot_name: bot_name.into(),
            knowledge,
            timeout,
        }
    }

    /// Skip rules that need no model call.
    pub fn skip_before_generation(view: &WindowView<'_>, summary: &Summary) -> Option<&'static str> {
        let pending = view.pending_foreign();
        if pending.is_empty() {
            return Some("no new message since last reply");
        }
        if pending.iter().all(|event| event.is_reaction()) && !summary.has_unanswered() {
            return Some("reaction-only tail");
        }
        None
    }

    pub async fn respond(
        &self,
        view: &WindowView<'_>,
        summary: &Summary,
        plan: &Plan,
        mode: ResponseMode,
    ) -> ReplyDecision {
        if let Some(reason) = Self::skip_before_generation(view, summary) {
            return ReplyDecision::skip(reason);
        }

        let instruction = match mode {
            ResponseMode::Live => {
                let asks = view
                    .pending_foreign()
                    .iter()
                    .rev()
                    .find_map(|event| event.body())
                    .is_some_and(looks_like_question);
                live_instruction(plan, asks)
            }
            ResponseMode::CatchUp => catch_up_instruction(plan, summary),
        };

        let mut messages = view.chat_messages();
        match messages.last_mut() {
            Some(last) if last.role == "user" => {
                last.content.push_str("\n\n");
                last.content.push_str(&instruction);
            }
            _ => messages.push(Message::user(instruction)),
        }
        tracing::debug!("Responder: {:?} mode, {} turn(s)", mode, messages.len());

        let request = GenerationRequest::new(messages, mode.max_tokens())
            .with_system(self.system_prompt())
            .with_model(self.model.clone());

        match generate_within(self.provider.as_ref(), &request, self.timeout).await {
            Ok(raw) => self.finish(&raw, view.last_reply()),
            Err(e) => {
                tracing::warn!("Responder failed ({}): {}", e.category(), e);
                ReplyDecision::skip("provider error")
            }
        }
    }

    /// One opener for a quiet chat, steering away from the summarized topics.
    pub async fn startup_topic(&self, summary: &Summary, last_reply: Option<&str>) -> ReplyDecision {
        let request = GenerationRequest::new(
            vec![Message::user(startup_topic_prompt(summary))],
            STARTUP_TOPIC_TOKENS,
        )
        .with_system(self.system_prompt())
        .with_model(self.model.clone())
        .with_temperature(0.9);

        match generate_within(self.provider.as_ref(), &request, self.timeout).await {
            Ok(raw) => self.finish(&raw, last_reply),
            Err(e) => {
                tracing::warn!("Startup topic failed ({}): {}", e.category(), e);
                ReplyDecision::skip("provider error")
            }
        }
    }

    fn system_prompt(&self) -> String {
        response_system_prompt(&self.persona, &self.bot_name, self.knowledge.as_str(), Local::now())
    }

    fn finish(&self, raw: &str, last_reply: Option<&str>) -> ReplyDecision {
        tracing::debug!("Responder raw output: {}", raw);
        let reply = clean_reply(raw, &self.bot_name);

        if reply.is_empty() {
            return ReplyDecision::skip("empty generation");
        }
        if reply
            .trim_matches(|c: char| !c.is_alphanumeric())
            .eq_ignore_ascii_case(SKIP_TOKEN)
        {
            return ReplyDecision::skip("model declined");
        }
        if last_reply.is_some_and(|last| last.trim() == reply) {
            return ReplyDecision::skip("duplicate of last reply");
        }
        ReplyDecision::Send(reply)
    }
}

/// Strips role labels, a leading `Name:` and wrapping quotes the model sometimes adds.
fn clean_reply(raw: &str, bot_name: &str) -> String {
    let mut text = raw.trim();

    if text.starts_with('[') {
        if let Some(end) = text.find(']').filter(|&end| end <= 24) {
            text = text[end + 1..].trim_start_matches(':').trim();
        }
    }

    let name_prefix = format!("{}:", bot_name.to_lowercase());
    if text.to_lowercase().starts_with(&name_prefix) {
        // Lowercasing can change byte lengths, so cut by chars.
        let skip = bot_name.chars().count() + 1;
        text = match text.char_indices().nth(skip) {
            Some((idx, _)) => text[idx..].trim(),
            None => "",
        };
    }

    for (open, close) in [('"', '"'), ('“', '”')] {
        if text.len() > 1 && text.starts_with(open) && text.ends_with(close) {
            text = text[open.len_utf8()..text.len() - close.len_utf8()].trim();
            break;
        }
    }

    text.to_string()
}

fn question_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"(?i)(\?|？|吗|呢|怎么|什么|\b(what|when|where|who|why|how|can you|could you|are you|do you|did you|will you)\b)",
            )
            .ok()
        })
        .as_ref()
}

pub fn looks_like_question(text: &str) -> bool {
    match question_pattern() {
        Some(re) => re.is_match(text),
        None => text.contains('?'),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{reaction_event, text_event, ScriptedProvider, SlowProvider};
    use crate::conversation::{ContactBook, ConversationWindow};

    fn responder(provider: Arc<dyn GenerationProvider>) -> Responder {
        Responder::new(
            provider,
            None,
            "Be warm.",
            "Meg",
            KnowledgeBase::from_text("city: Seattle"),
            Duration::from_millis(200),
        )
    }

    fn contacts() -> ContactBook {
        ContactBook::new(&[], "Meg")
    }

    #[tokio::test]
    async fn reaction_only_tail_is_skipped_without_calling_out() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok("hi".to_string())]));
        let mut window = ConversationWindow::new(10);
        window.ingest(vec![
            text_event(1, "mom@example.com", "look at this", false),
            text_event(2, "me", "so cute", true),
            reaction_event(3, "mom@example.com", Some(2)),
        ]);
        let book = contacts();
        let view = WindowView::new(&window, &book, 10);

        let decision = responder(provider.clone())
            .respond(&view, &Summary::empty(), &Plan::default(), ResponseMode::Live)
            .await;
        assert_eq!(decision, ReplyDecision::skip("reaction-only tail"));
        assert_eq!(provider.calls(), 0);

        let pending = Summary {
            unanswered_questions: vec!["Did you eat?".to_string()],
            ..Summary::empty()
        };
        assert_eq!(Responder::skip_before_generation(&view, &pending), None);
    }

    #[tokio::test]
    async fn nothing_pending_after_own_reply() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let mut window = ConversationWindow::new(10);
        window.ingest(vec![
            text_event(1, "mom@example.com", "night!", false),
            text_event(2, "me", "night night", true),
        ]);
        let book = contacts();
        let decision = responder(provider.clone())
            .respond(
                &WindowView::new(&window, &book, 10),
                &Summary::empty(),
                &Plan::default(),
                ResponseMode::Live,
            )
            .await;
        assert_eq!(decision, ReplyDecision::skip("no new message since last reply"));
    }

    #[tokio::test]
    async fn generation_outcomes_are_normalized() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok("   \n ".to_string()),
            Ok("SKIP.".to_string()),
            Ok("[assistant] sounds good".to_string()),
            Ok("Meg: \"on my way\"".to_string()),
        ]));
        let mut window = ConversationWindow::new(10);
        window.ingest(vec![
            text_event(1, "me", "sounds good", true),
            text_event(2, "mom@example.com", "are you coming for dinner?", false),
        ]);
        let book = contacts();
        let view = WindowView::new(&window, &book, 10);
        let responder = responder(provider.clone());
        let summary = Summary::empty();
        let plan = Plan::default();

        let outcomes = [
            responder.respond(&view, &summary, &plan, ResponseMode::Live).await,
            responder.respond(&view, &summary, &plan, ResponseMode::CatchUp).await,
            responder.respond(&view, &summary, &plan, ResponseMode::Live).await,
            responder.respond(&view, &summary, &plan, ResponseMode::Live).await,
        ];
        assert_eq!(outcomes[0], ReplyDecision::skip("empty generation"));
        assert_eq!(outcomes[1], ReplyDecision::skip("model declined"));
        assert_eq!(outcomes[2], ReplyDecision::skip("duplicate of last reply"));
        assert_eq!(outcomes[3], ReplyDecision::Send("on my way".to_string()));

        let request = provider.last_request().unwrap();
        let last_turn = request.messages.last().unwrap();
        assert_eq!(last_turn.role, "user");
        assert!(last_turn.content.contains("asks you something"));
        assert!(request.system.unwrap().contains("city: Seattle"));
        assert_eq!(request.max_tokens, LIVE_REPLY_TOKENS);
    }

    #[tokio::test]
    async fn timeout_becomes_provider_error_skip() {
        let mut window = ConversationWindow::new(10);
        window.ingest(vec![text_event(1, "mom@example.com", "hello?", false)]);
        let book = contacts();
        let decision = responder(Arc::new(SlowProvider))
            .respond(
                &WindowView::new(&window, &book, 10),
                &Summary::empty(),
                &Plan::default(),
                ResponseMode::Live,
            )
            .await;
        assert_eq!(decision, ReplyDecision::skip("provider error"));
    }

    #[tokio::test]
    async fn startup_topic_avoids_summarized_topics() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok("Anyone tried the new bakery?".to_string())]));
        let summary = Summary {
            topic_digest: "Talked about the garden.".to_string(),
            ..Summary::empty()
        };
        let decision = responder(provider.clone()).startup_topic(&summary, None).await;
        assert_eq!(decision, ReplyDecision::Send("Anyone tried the new bakery?".to_string()));

        let request = provider.last_request().unwrap();
        assert!(request.messages[0].content.contains("Talked about the garden."));
        assert_eq!(request.max_tokens, STARTUP_TOPIC_TOKENS);
    }

    #[test]
    fn question_detection_covers_punctuation_and_words() {
        assert!(looks_like_question("when do you land"));
        assert!(looks_like_question("吃饭了吗"));
        assert!(looks_like_question("really？"));
        assert!(!looks_like_question("see you tomorrow"));
        assert!(!looks_like_question("showhow"));
    }

    #[test]
    fn clean_reply_strips_labels_and_quotes() {
        assert_eq!(clean_reply("  “ok!” ", "Meg"), "ok!");
        assert_eq!(clean_reply("[meg]: hi", "Meg"), "hi");
        assert_eq!(clean_reply("MEG: hi", "Meg"), "hi");
        assert_eq!(clean_reply("\"", "Meg"), "\"");
    }
}
