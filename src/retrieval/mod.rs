//! Knowledge retrieval: embed the caller's utterance, score it against an agent's
//! knowledge chunks, and return the top-k passages above a minimum relevance threshold
//! (§4.4). Feeds the Prompt Builder (§4.5); an empty result means "ground nothing", not an
//! error — the agent still answers from persona and conversation history alone.

use crate::ai::embeddings::Embedder;
use crate::ai::UpstreamError;
use crate::db::models::KnowledgeChunk;
use crate::db::{DbPool, KnowledgeChunkRepo};

#[derive(Debug, Clone)]
pub struct RetrievedPassage {
    pub chunk_id: String,
    pub doc_id: String,
    pub text: String,
    pub score: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub min_score: f32,
}

/// Cosine similarity between two equal-length f32 vectors, clamped into `[-1.0, 1.0]` to
/// absorb floating-point drift at the extremes.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn encode_embedding(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Rank a fixed candidate set against a query embedding, keeping only passages at or
/// above `min_score`, highest score first, truncated to `top_k` (§4.4 edge case: fewer
/// than `top_k` qualifying passages is not an error).
pub fn rank_chunks(
    query_embedding: &[f32],
    chunks: &[KnowledgeChunk],
    config: RetrievalConfig,
) -> Vec<RetrievedPassage> {
    let mut scored: Vec<RetrievedPassage> = chunks
        .iter()
        .map(|chunk| {
            let embedding = decode_embedding(&chunk.embedding);
            let score = cosine_similarity(query_embedding, &embedding);
            RetrievedPassage {
                chunk_id: chunk.id.clone(),
                doc_id: chunk.doc_id.clone(),
                text: chunk.text.clone(),
                score,
            }
        })
        .filter(|p| p.score >= config.min_score)
        .collect();

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(config.top_k);
    scored
}

/// Words that, on their own, are enough evidence a turn is a greeting or goodbye and must
/// never trigger retrieval even if they happen to be long (§4.4 relevance gate).
const NON_KNOWLEDGE_MARKERS: &[&str] = &[
    "hello", "hi", "hey", "goodbye", "bye", "thanks", "thank you", "yes", "no", "okay", "ok",
];

/// Cheap keyword + length heuristic deciding whether a caller turn is "knowledge-seeking"
/// enough to justify a retrieval round-trip (§4.4). A short turn, or one that is wholly a
/// greeting/farewell/acknowledgement, is gated out; anything else that asks a question or
/// carries enough content words is let through.
pub fn is_knowledge_seeking(normalized_transcript: &str) -> bool {
    let trimmed = normalized_transcript.trim();
    if trimmed.is_empty() {
        return false;
    }
    let words: Vec<&str> = trimmed.split_whitespace().collect();
    if words.len() <= 3 && NON_KNOWLEDGE_MARKERS.iter().any(|m| trimmed == *m || trimmed.starts_with(m)) {
        return false;
    }
    let has_question_mark = normalized_transcript.contains('?');
    has_question_mark || words.len() >= 4
}

/// Embed `query` and retrieve the top-ranked knowledge chunks for `agent_id`. A retrieval
/// failure against the embeddings provider is reported to the caller via `UpstreamError`
/// rather than silently degrading to an empty result, so the Thinking pipeline can decide
/// whether to proceed ungrounded or fail the turn (§4.7).
pub async fn retrieve(
    pool: &DbPool,
    embedder: &dyn Embedder,
    agent_id: &str,
    query: &str,
    config: RetrievalConfig,
) -> Result<Vec<RetrievedPassage>, UpstreamError> {
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }
    let query_embedding = embedder.embed(query).await?;
    let chunks = KnowledgeChunkRepo::by_agent(pool, agent_id)
        .await
        .map_err(|e| UpstreamError::Fatal(format!("knowledge chunk lookup failed: {e}")))?;
    Ok(rank_chunks(&query_embedding, &chunks, config))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, text: &str, embedding: Vec<f32>) -> KnowledgeChunk {
        KnowledgeChunk {
            id: id.to_string(),
            agent_id: "agent-1".to_string(),
            doc_id: "doc-1".to_string(),
            ordinal: 0,
            text: text.to_string(),
            embedding: encode_embedding(&embedding),
        }
    }

    #[test]
    fn cosine_similarity_is_one_for_identical_vectors() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_is_zero_for_orthogonal_vectors() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn rank_chunks_drops_below_threshold_and_caps_at_top_k() {
        let query = vec![1.0, 0.0];
        let chunks = vec![
            chunk("1", "exact match", vec![1.0, 0.0]),
            chunk("2", "close match", vec![0.9, 0.1]),
            chunk("3", "unrelated", vec![0.0, 1.0]),
        ];
        let config = RetrievalConfig { top_k: 1, min_score: 0.5 };
        let results = rank_chunks(&query, &chunks, config);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, "1");
    }

    #[test]
    fn rank_chunks_returns_empty_when_nothing_qualifies() {
        let query = vec![1.0, 0.0];
        let chunks = vec![chunk("1", "unrelated", vec![0.0, 1.0])];
        let config = RetrievalConfig { top_k: 5, min_score: 0.7 };
        assert!(rank_chunks(&query, &chunks, config).is_empty());
    }

    #[test]
    fn relevance_gate_rejects_greeting_and_goodbye_turns() {
        assert!(!is_knowledge_seeking("hello"));
        assert!(!is_knowledge_seeking("hi there"));
        assert!(!is_knowledge_seeking("goodbye"));
        assert!(!is_knowledge_seeking("thanks"));
        assert!(!is_knowledge_seeking(""));
    }

    #[test]
    fn relevance_gate_admits_questions_and_longer_turns() {
        assert!(is_knowledge_seeking("what are your office hours?"));
        assert!(is_knowledge_seeking("can you tell me about the warranty policy"));
        assert!(!is_knowledge_seeking("yes"));
    }
}
