use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::prompts::SUMMARY_SYSTEM_PROMPT;
use super::WindowView;
use crate::llm_client::{extract_json_object, generate_within, GenerationProvider, GenerationRequest, Message};

pub const MAX_SUMMARY_TOKENS: u32 = 300;

/// Digest of the window. Recomputed wholesale, never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub topic_digest: String,
    pub unanswered_questions: Vec<String>,
    pub produced_at: DateTime<Utc>,
}

impl Summary {
    pub fn empty() -> Self {
        Self {
            topic_digest: String::new(),
            unanswered_questions: Vec::new(),
            produced_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.topic_digest.is_empty() && self.unanswered_questions.is_empty()
    }

    pub fn has_unanswered(&self) -> bool {
        !self.unanswered_questions.is_empty()
    }

    /// Reads the model's JSON answer. Text without any JSON becomes the digest.
    pub fn parse(raw: &str, produced_at: DateTime<Utc>) -> Self {
        let Some(value) = extract_json_object(raw) else {
            return Self {
                topic_digest: raw.trim().to_string(),
                unanswered_questions: Vec::new(),
                produced_at,
            };
        };

        let topic_digest = ["digest", "topic_digest", "summary"]
            .iter()
            .find_map(|key| value.get(*key).and_then(|v| v.as_str()))
            .unwrap_or_default()
            .trim()
            .to_string();
        let unanswered_questions = value
            .get("unanswered_questions")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str())
                    .map(str::trim)
                    .filter(|q| !q.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            topic_digest,
            unanswered_questions,
            produced_at,
        }
    }

    pub fn render(&self) -> String {
        let mut text = if self.topic_digest.is_empty() {
            "(no summary)".to_string()
        } else {
            self.topic_digest.clone()
        };
        if self.has_unanswered() {
            text.push_str("\nUnanswered:");
            for question in &self.unanswered_questions {
                text.push_str("\n- ");
                text.push_str(question);
            }
        }
        text
    }
}

pub struct Summarizer {
    provider: Arc<dyn GenerationProvider>,
    model: Option<String>,
    threshold: usize,
    timeout: Duration,
}

impl Summarizer {
    pub fn new(
        provider: Arc<dyn GenerationProvider>,
        model: Option<String>,
        threshold: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            model,
            threshold,
            timeout,
        }
    }

    /// Summarizes the whole window. Never fails: short windows and provider
    /// errors both yield an empty summary.
    pub async fn summarize(&self, view: &WindowView<'_>) -> Summary {
        let window = view.window();
        if window.is_empty() || window.len() < self.threshold {
            tracing::debug!(
                "Summarizer: {} event(s) below threshold {}, skipping",
                window.len(),
                self.threshold
            );
            return Summary::empty();
        }

        let lines: Vec<String> = window.transcript(window.len(), view.contacts()).collect();
        tracing::info!("Summarizer: summarizing {} event(s)", lines.len());

        let request = GenerationRequest::new(
            vec![Message::user(format!("Chat history:\n{}", lines.join("\n")))],
            MAX_SUMMARY_TOKENS,
        )
        .with_system(SUMMARY_SYSTEM_PROMPT)
        .with_model(self.model.clone())
        .with_temperature(0.3);

        match generate_within(self.provider.as_ref(), &request, self.timeout).await {
            Ok(raw) => {
                tracing::debug!("Summarizer raw output: {}", raw);
                let summary = Summary::parse(&raw, Utc::now());
                tracing::info!(
                    "Summary ready ({} chars, {} unanswered question(s))",
                    summary.topic_digest.len(),
                    summary.unanswered_questions.len()
                );
                summary
            }
            Err(e) => {
                tracing::warn!("Summarizer failed ({}): {}", e.category(), e);
                Summary::empty()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{text_event, ScriptedProvider};
    use crate::conversation::{ContactBook, ConversationWindow};
    use crate::error::ProviderError;

    fn window_with(n: i64) -> ConversationWindow {
        let mut window = ConversationWindow::new(50);
        window.ingest((1..=n).map(|i| text_event(i, "mom@example.com", "hello", false)));
        window
    }

    #[test]
    fn parses_json_and_falls_back_to_raw_text() {
        let now = Utc::now();
        let parsed = Summary::parse(
            "Sure!\n```json\n{\"digest\": \"Dinner plans.\", \"unanswered_questions\": [\"When do you land?\", \" \"],}\n```",
            now,
        );
        assert_eq!(parsed.topic_digest, "Dinner plans.");
        assert_eq!(parsed.unanswered_questions, vec!["When do you land?".to_string()]);

        let plain = Summary::parse("  They talked about the weather.  ", now);
        assert_eq!(plain.topic_digest, "They talked about the weather.");
        assert!(!plain.has_unanswered());
    }

    #[tokio::test]
    async fn short_window_skips_the_provider() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok("{}".to_string())]));
        let summarizer = Summarizer::new(provider.clone(), None, 20, Duration::from_secs(1));
        let window = window_with(5);
        let contacts = ContactBook::new(&[], "Meg");

        let summary = summarizer.summarize(&WindowView::new(&window, &contacts, 10)).await;
        assert!(summary.is_empty());
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn provider_failure_degrades_to_empty_summary() {
        let provider = Arc::new(ScriptedProvider::new(vec![Err(ProviderError::RateLimited(
            "slow down".to_string(),
        ))]));
        let summarizer = Summarizer::new(provider.clone(), None, 3, Duration::from_secs(1));
        let window = window_with(4);
        let contacts = ContactBook::new(&[], "Meg");

        let summary = summarizer.summarize(&WindowView::new(&window, &contacts, 10)).await;
        assert!(summary.is_empty());
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn summary_covers_the_whole_window() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(
            r#"{"digest": "Greetings.", "unanswered_questions": ["Are you coming home?"]}"#.to_string(),
        )]));
        let summarizer = Summarizer::new(provider.clone(), Some("small".to_string()), 3, Duration::from_secs(1));
        let window = window_with(12);
        let contacts = ContactBook::new(&[], "Meg");

        let summary = summarizer.summarize(&WindowView::new(&window, &contacts, 2)).await;
        assert_eq!(summary.unanswered_questions.len(), 1);

        let request = provider.last_request().unwrap();
        assert_eq!(request.model.as_deref(), Some("small"));
        assert_eq!(request.messages[0].content.matches("hello").count(), 12);
    }
}
