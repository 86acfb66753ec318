//! Prompt assembly for the Thinking pipeline (§4.5). Pure and idempotent: given the same
//! agent snapshot, retrieved passages, and history, it always builds the same message list.
//! No provider call lives here — this module only shapes what [`crate::ai::llm`] sends.

use crate::db::models::{AgentSnapshot, Speaker, TranscriptTurn};
use crate::ai::llm::ChatMessage;
use crate::retrieval::RetrievedPassage;

/// Rough token estimate (~4 chars/token for English) used only to bound history size.
/// Good enough for a budget heuristic; exact tokenization is provider-specific and out of
/// scope for the orchestrator (§1 non-goals).
fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4).max(1)
}

/// Section 1 (§4.5): a static paragraph constraining the model to short, speakable
/// replies. Fixed across all agents; the per-agent voice comes from the persona section.
const GLOBAL_PHONE_RULES: &str = "You are speaking on a live phone call. Reply in 2-3 short, \
conversational sentences. Never use lists, headings, or markdown formatting, and never prefix \
your reply with a speaker label.";

fn persona_section(agent: &AgentSnapshot) -> String {
    agent.persona.clone()
}

fn knowledge_section(passages: &[RetrievedPassage]) -> Option<String> {
    if passages.is_empty() {
        return None;
    }
    let mut section = String::from(
        "Use the following reference material if it helps answer the caller; ignore it if irrelevant:\n",
    );
    for (i, passage) in passages.iter().enumerate() {
        section.push_str(&format!("[{}] {}\n", i + 1, passage.text));
    }
    Some(section)
}

/// Build the fixed-order system message (global rules, persona, retrieved context) plus
/// the trimmed rolling history plus the caller's current utterance (§4.5).
pub fn build_messages(
    agent: &AgentSnapshot,
    history: &[TranscriptTurn],
    retrieved: &[RetrievedPassage],
    caller_utterance: &str,
    history_token_budget: usize,
) -> Vec<ChatMessage> {
    let mut system = GLOBAL_PHONE_RULES.to_string();
    system.push('\n');
    system.push('\n');
    system.push_str(&persona_section(agent));
    if let Some(knowledge) = knowledge_section(retrieved) {
        system.push('\n');
        system.push('\n');
        system.push_str(&knowledge);
    }

    let mut messages = vec![ChatMessage::system(system)];
    messages.extend(trim_history_to_budget(history, history_token_budget));
    messages.push(ChatMessage::user(caller_utterance));
    messages
}

/// Convert transcript turns to chat messages, dropping the oldest pair first whenever the
/// running token estimate exceeds `budget` (§4.5: "rolling history trimmed oldest-first in
/// caller/agent pairs so context never straddles a half-removed turn").
fn trim_history_to_budget(history: &[TranscriptTurn], budget: usize) -> Vec<ChatMessage> {
    let mut converted: Vec<ChatMessage> = history
        .iter()
        .map(|turn| match Speaker::from_str(&turn.speaker) {
            Some(Speaker::Agent) => ChatMessage::assistant(turn.text.clone()),
            _ => ChatMessage::user(turn.text.clone()),
        })
        .collect();

    let mut total: usize = converted.iter().map(|m| estimate_tokens(&m.text)).sum();
    while total > budget && converted.len() >= 2 {
        let removed_a = converted.remove(0);
        total -= estimate_tokens(&removed_a.text);
        if !converted.is_empty() {
            let removed_b = converted.remove(0);
            total -= estimate_tokens(&removed_b.text);
        }
    }
    // A single oversized remaining turn is kept rather than dropped entirely; the caller's
    // current utterance must never be the thing silently lost.
    converted
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn snapshot() -> AgentSnapshot {
        AgentSnapshot {
            agent_id: "agent-1".into(),
            persona: "a friendly scheduling assistant".into(),
            greeting: "Hi, how can I help?".into(),
            language: "English".into(),
            llm_model: "gpt-test".into(),
            llm_temperature: 0.7,
            llm_max_tokens: Some(200),
            tts_provider: "test".into(),
            tts_voice_id: "voice-1".into(),
            end_call_phrases: vec!["goodbye".into()],
            knowledge_base_id: None,
        }
    }

    fn turn(speaker: Speaker, text: &str, ordinal: i64) -> TranscriptTurn {
        TranscriptTurn {
            id: ordinal,
            call_id: "call-1".into(),
            speaker: speaker.as_str().to_string(),
            text: text.to_string(),
            ordinal,
            turn_at: Utc::now(),
        }
    }

    #[test]
    fn build_messages_puts_global_rules_before_persona() {
        let agent = snapshot();
        let messages = build_messages(&agent, &[], &[], "hello", 1000);
        assert_eq!(messages.len(), 2);
        assert!(messages[0].text.starts_with("You are speaking on a live phone call"));
        assert!(messages[0].text.contains("a friendly scheduling assistant"));
        let rules_idx = messages[0].text.find("live phone call").unwrap();
        let persona_idx = messages[0].text.find("friendly scheduling assistant").unwrap();
        assert!(rules_idx < persona_idx);
        assert_eq!(messages[1].text, "hello");
    }

    #[test]
    fn build_messages_includes_knowledge_section_only_when_present() {
        let agent = snapshot();
        let passages = vec![RetrievedPassage {
            chunk_id: "c1".into(),
            doc_id: "d1".into(),
            text: "Office hours are 9 to 6.".into(),
            score: 0.9,
        }];
        let messages = build_messages(&agent, &[], &passages, "when are you open", 1000);
        assert!(messages[0].text.contains("Office hours are 9 to 6."));
        let persona_idx = messages[0].text.find("friendly scheduling assistant").unwrap();
        let knowledge_idx = messages[0].text.find("Office hours").unwrap();
        assert!(persona_idx < knowledge_idx);

        let no_kb = build_messages(&agent, &[], &[], "when are you open", 1000);
        assert!(!no_kb[0].text.contains("reference material"));
    }

    #[test]
    fn history_is_trimmed_oldest_pair_first_under_budget_pressure() {
        let agent = snapshot();
        let history = vec![
            turn(Speaker::Caller, "message one from caller, somewhat long text", 1),
            turn(Speaker::Agent, "message one reply from agent, also fairly long", 2),
            turn(Speaker::Caller, "most recent caller message", 3),
            turn(Speaker::Agent, "most recent agent reply", 4),
        ];
        let messages = build_messages(&agent, &history, &[], "current utterance", 12);
        let texts: Vec<&str> = messages.iter().map(|m| m.text.as_str()).collect();
        assert!(!texts.iter().any(|t| t.contains("message one")));
        assert!(texts.iter().any(|t| t.contains("most recent")));
    }
}
