//! Prompt text for the summarizer, planner and responder.

use chrono::{DateTime, Local, Timelike};

use super::planner::{Intent, Length, Plan};
use super::summarizer::Summary;

pub const SUMMARY_SYSTEM_PROMPT: &str = r#"You summarize a family group chat so the assistant knows what needs a reply.

Lines are labelled with the speaker's name. The assistant's own lines are labelled with its name.

Return ONLY a JSON object:
{
  "digest": "2-4 sentences covering the main topics, plans and concerns",
  "unanswered_questions": ["questions or requests directed at the assistant that nobody has answered yet"]
}

Stay objective. Use an empty list when nothing is pending."#;

pub const PLANNER_SYSTEM_PROMPT: &str = r#"You are a dialogue planner for a family group chat. The assistant replies as a member of the family.

Plan the response strategy for the latest messages.

Context:
{context}

Return JSON with these fields:
- should_respond: true/false (whether to reply at all)
- intent: "ack" | "ask_followup" | "share_story" | "reflect" | "answer_question"
- tone: "playful" | "caring" | "neutral" | "enthusiastic"
- response_length: "minimal" | "short" | "medium"
- topic: short noun (e.g. "family", "work")
- hint: one instruction (e.g. "be encouraging")

Intent guide:
- ack: simple acknowledgement (use sparingly)
- ask_followup: ask a follow-up question
- share_story: share a related experience
- reflect: thoughtful response
- answer_question: the message asks something

Set should_respond=false for filler messages ("ok", "haha"), content the assistant already replied to, or greetings already acknowledged.

Return only JSON."#;

/// Morning, afternoon or evening for the given local time.
pub fn time_of_day(now: DateTime<Local>) -> &'static str {
    match now.hour() {
        6..=11 => "morning",
        12..=17 => "afternoon",
        _ => "evening",
    }
}

pub fn time_context(now: DateTime<Local>) -> String {
    format!("{} ({})", now.format("%A %H:%M"), time_of_day(now))
}

pub fn planner_system_prompt(now: DateTime<Local>, last_reply: Option<&str>) -> String {
    let mut context = vec![format!("Time: {}", time_of_day(now))];
    if let Some(reply) = last_reply {
        context.push(format!("Assistant's last reply: \"{}\"", reply.trim()));
    }
    PLANNER_SYSTEM_PROMPT.replace("{context}", &context.join("\n"))
}

pub fn response_system_prompt(
    persona: &str,
    bot_name: &str,
    knowledge: &str,
    now: DateTime<Local>,
) -> String {
    let mut prompt = format!(
        "{}\n\n\
         You are {} in this chat. Time: {}.\n\
         Messages arrive labelled with the speaker's role, e.g. `[mom] how was work?`. \
         Reply with the message text only: no labels, no quotes, no narration.",
        persona.trim(),
        bot_name,
        time_context(now)
    );

    if !knowledge.trim().is_empty() {
        prompt.push_str(
            "\n\nUse the personal knowledge below as implicit background. \
             Do not recite facts from it unless someone asks directly, and keep it simple even then.\n\
             ---\n",
        );
        prompt.push_str(knowledge.trim());
        prompt.push_str("\n---");
    }
    prompt
}

pub fn length_instruction(intent: Intent, length: Length) -> &'static str {
    match (intent, length) {
        (Intent::AnswerQuestion, Length::Minimal) => {
            "Answer briefly in 1-2 sentences. If you don't know, say so honestly and ask them to explain."
        }
        (Intent::AnswerQuestion, Length::Short) => {
            "Answer in 1-2 sentences. If uncertain, admit it naturally and invite more context."
        }
        (Intent::AnswerQuestion, Length::Medium) => {
            "Answer thoughtfully in 2-3 sentences. If you lack the details, be honest and ask them to share more."
        }
        (_, Length::Minimal) => "Reply in 1 very short sentence only.",
        (_, Length::Short) => "Reply in 1-2 brief sentences.",
        (_, Length::Medium) => "Reply in 2-3 sentences; you can be more thoughtful.",
    }
}

pub fn planning_context(plan: &Plan) -> String {
    format!(
        "PLANNING CONTEXT:\n\
         - Intent: {}\n\
         - Tone: {}\n\
         - Response length: {} ({})\n\
         - Topic: {}\n\
         - Hint: {}",
        plan.intent.as_str(),
        plan.tone.as_str(),
        plan.length.as_str(),
        length_instruction(plan.intent, plan.length),
        plan.topic,
        plan.hint
    )
}

pub fn live_instruction(plan: &Plan, asks_question: bool) -> String {
    let mut text = planning_context(plan);
    if asks_question {
        text.push_str("\n\nThe latest message asks you something. Answer it.");
    }
    text.push_str("\n\nNow respond. Be brief and natural.");
    text
}

pub fn catch_up_instruction(plan: &Plan, summary: &Summary) -> String {
    format!(
        "Conversation summary:\n{}\n\n{}\n\n\
         Task: if the summary or the messages above leave questions or requests for you, \
         respond briefly (1 sentence). Otherwise reply with exactly SKIP.",
        summary.render(),
        planning_context(plan)
    )
}

pub fn startup_topic_prompt(summary: &Summary) -> String {
    let mut prompt = String::from(
        "The chat has been quiet for a while. Write ONE natural conversation starter to send to the family. \
         Output only the message text.",
    );
    if !summary.is_empty() {
        prompt.push_str("\n\nRecent conversation summary:\n");
        prompt.push_str(&summary.render());
        prompt.push_str("\n\nAvoid the topics above. Start something new.");
    }
    prompt
}
