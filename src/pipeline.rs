//! Synthesis pipeline — prompt construction and bounded-retry parsing.
//!
//! The pipeline is pure given its inputs: its only side effect is the
//! outbound generator call. Inputs are truncated before prompt construction
//! to bound both token cost and the prompt buffer, and model output goes
//! through a strict-then-fenced JSON parse with linear backoff between
//! attempts.

use std::time::Duration;

use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::KbError;
use crate::generator::Generator;
use crate::record::{Record, RecordMetadata, now_iso};
use crate::retriever::Snippet;

const SYSTEM_PROMPT: &str =
    "You are a helpful assistant that builds knowledge documents in JSON format. \
     Keep responses concise.";

/// The section vocabulary requested from the model on first synthesis.
const SECTION_VOCABULARY: &str =
    "userProfile, actionPlan, marketInsights, skillDevelopment, actionableSteps";

const MAX_OUTPUT_TOKENS: u32 = 3000;

/// One call-and-parse cycle against the generator. Ephemeral — lives only in
/// the retry loop, never persisted.
struct GenerationAttempt {
    prompt_hash: String,
    attempt: u32,
}

/// Builds prompts, invokes the generator, and parses the result with bounded
/// retries.
#[derive(Debug)]
pub struct SynthesisPipeline {
    generator: Generator,
    model: String,
    temperature: f32,
    max_attempts: u32,
    retry_base_delay: Duration,
    max_input_chars: usize,
    history_fan_in: usize,
}

impl SynthesisPipeline {
    pub fn new(
        generator: Generator,
        model: String,
        temperature: f32,
        max_attempts: u32,
        retry_base_delay: Duration,
        max_input_chars: usize,
        history_fan_in: usize,
    ) -> Self {
        Self {
            generator,
            model,
            temperature,
            max_attempts: max_attempts.max(1),
            retry_base_delay,
            max_input_chars,
            history_fan_in,
        }
    }

    /// First-time synthesis: produce a brand-new record from seed inputs.
    pub async fn build(&self, key: &str, seed: &Map<String, Value>) -> Result<Record, KbError> {
        let seed_str = self.truncate(&serialize_compact(seed));
        let prompt = format!(
            "You are an AI coach building a knowledge document for one entity. \
             Create a JSON response with these sections: {SECTION_VOCABULARY}.\n\n\
             SEED DATA:\n{seed_str}\n\n\
             Return ONLY valid JSON. Keep responses concise."
        );

        info!(key, "building knowledge record");
        let data = self.generate_with_retry(&prompt).await?;
        let output_estimate = serialize_compact(&data).len() as u64 / 4;
        let now = now_iso();

        Ok(Record {
            key: key.to_string(),
            version: "1.0.0".to_string(),
            created_at: now.clone(),
            last_updated: now,
            data,
            update_history: Vec::new(),
            metadata: RecordMetadata {
                source: self.model.clone(),
                input_tokens: prompt.len() as u64 / 4,
                output_tokens: output_estimate,
                model_parameters: json!({
                    "temperature": self.temperature,
                    "maxOutputTokens": MAX_OUTPUT_TOKENS,
                }),
            },
        })
    }

    /// Full re-synthesis for an existing record: regenerate the whole section
    /// map from the current document plus merged new inputs. Prior history is
    /// capped to the most recent entries before it reaches the prompt.
    pub async fn regenerate(
        &self,
        record: &Record,
        merged: &Map<String, Value>,
    ) -> Result<Map<String, Value>, KbError> {
        let current = self.truncate(&serialize_compact(merged));
        let recent_history: Vec<String> = record
            .update_history
            .iter()
            .rev()
            .take(self.history_fan_in)
            .map(|e| format!("{} ({}): {}", e.timestamp, e.update_type, e.changes.join("; ")))
            .collect();

        let prompt = format!(
            "You are an AI coach refreshing an existing knowledge document. \
             Rewrite it as a JSON response with these sections: {SECTION_VOCABULARY}.\n\n\
             CURRENT DOCUMENT (with new material merged in):\n{current}\n\n\
             RECENT UPDATES:\n{}\n\n\
             Return ONLY valid JSON. Keep responses concise.",
            if recent_history.is_empty() { "none".to_string() } else { recent_history.join("\n") }
        );

        info!(key = %record.key, version = %record.version, "regenerating knowledge record");
        self.generate_with_retry(&prompt).await
    }

    /// Retrieval-augmented answer: the question plus ranked snippets, one
    /// round-trip, free-text reply.
    pub async fn answer(&self, question: &str, snippets: &[Snippet]) -> Result<String, KbError> {
        let context = if snippets.is_empty() {
            "none".to_string()
        } else {
            snippets
                .iter()
                .map(|s| format!("[{}] {}", s.section, s.text))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let prompt = self.truncate(&format!(
            "Answer the question using only the knowledge document excerpts below. \
             Be direct and concise.\n\nEXCERPTS:\n{context}\n\nQUESTION: {question}"
        ));
        self.generator.complete(&prompt, Some(SYSTEM_PROMPT)).await
    }

    /// Invoke the generator and parse its output as a JSON object, retrying
    /// with linear backoff (`attempt * base_delay`) up to the configured
    /// maximum number of attempts.
    ///
    /// Parse failures after the last attempt surface as `GenerationParse`;
    /// if every attempt failed in transport instead, the last transport error
    /// wins.
    pub async fn generate_with_retry(&self, prompt: &str) -> Result<Map<String, Value>, KbError> {
        let prompt_hash = hash_prompt(prompt);
        let mut last_transport: Option<KbError> = None;

        for attempt in 1..=self.max_attempts {
            let att = GenerationAttempt { prompt_hash: prompt_hash.clone(), attempt };
            debug!(prompt_hash = %att.prompt_hash, attempt = att.attempt, "generation attempt");

            match self.generator.complete(prompt, Some(SYSTEM_PROMPT)).await {
                Ok(text) => match parse_document(&text) {
                    Some(map) => {
                        debug!(prompt_hash = %att.prompt_hash, attempt = att.attempt, "parsed generator output");
                        return Ok(map);
                    }
                    None => {
                        warn!(
                            prompt_hash = %att.prompt_hash,
                            attempt = att.attempt,
                            output_len = text.len(),
                            "generator output unparsable"
                        );
                        last_transport = None;
                    }
                },
                Err(e) => {
                    warn!(prompt_hash = %att.prompt_hash, attempt = att.attempt, error = %e, "generation attempt failed");
                    last_transport = Some(e);
                }
            }

            if attempt < self.max_attempts && !self.retry_base_delay.is_zero() {
                tokio::time::sleep(self.retry_base_delay * attempt).await;
            }
        }

        match last_transport {
            Some(e) => Err(e),
            None => Err(KbError::GenerationParse { attempts: self.max_attempts }),
        }
    }

    fn truncate(&self, s: &str) -> String {
        truncate_chars(s, self.max_input_chars)
    }
}

/// Strict JSON object parse first; fall back to the interior of a fenced
/// code block.
fn parse_document(text: &str) -> Option<Map<String, Value>> {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(text) {
        return Some(map);
    }
    let inner = extract_fenced(text)?;
    match serde_json::from_str::<Value>(inner) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Interior of the first fenced code block, tolerating a language tag after
/// the opening fence.
fn extract_fenced(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_fence = &text[open + 3..];
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let close = body.find("```")?;
    Some(body[..close].trim())
}

/// Character-boundary-safe prefix of at most `max` characters.
fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}

fn hash_prompt(prompt: &str) -> String {
    let digest = Sha256::digest(prompt.as_bytes());
    hex::encode(&digest[..8])
}

fn serialize_compact<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::ScriptedGenerator;
    use serde_json::json;

    fn pipeline(generator: ScriptedGenerator) -> SynthesisPipeline {
        SynthesisPipeline::new(
            Generator::Scripted(generator),
            "test-model".into(),
            0.2,
            3,
            Duration::ZERO,
            8000,
            5,
        )
    }

    #[test]
    fn strict_json_parses() {
        let map = parse_document(r#"{"skills": ["Go"]}"#).unwrap();
        assert_eq!(map["skills"], json!(["Go"]));
    }

    #[test]
    fn fenced_json_parses() {
        let text = "Here is the document:\n```json\n{\"skills\": [\"Go\"]}\n```\nDone.";
        let map = parse_document(text).unwrap();
        assert_eq!(map["skills"], json!(["Go"]));
    }

    #[test]
    fn fence_without_tag_parses() {
        let text = "```\n{\"a\": 1}\n```";
        assert!(parse_document(text).is_some());
    }

    #[test]
    fn garbage_does_not_parse() {
        assert!(parse_document("I could not produce JSON, sorry.").is_none());
        assert!(parse_document("```json\nstill not json\n```").is_none());
        // A bare array is not a section map.
        assert!(parse_document("[1, 2, 3]").is_none());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "héllo wörld";
        let t = truncate_chars(s, 4);
        assert_eq!(t, "héll");
        assert_eq!(truncate_chars("short", 100), "short");
    }

    #[tokio::test]
    async fn build_produces_initial_record() {
        let g = ScriptedGenerator::new();
        g.push_reply(r#"{"userProfile": {"name": "A"}, "skills": ["Go"]}"#);
        let p = pipeline(g);

        let seed = json!({"skills": ["Go"]}).as_object().unwrap().clone();
        let record = p.build("u1", &seed).await.unwrap();

        assert_eq!(record.key, "u1");
        assert_eq!(record.version, "1.0.0");
        assert_eq!(record.data["skills"], json!(["Go"]));
        assert!(record.update_history.is_empty());
        assert_eq!(record.metadata.source, "test-model");
        assert!(record.metadata.input_tokens > 0);
    }

    #[tokio::test]
    async fn retry_recovers_from_one_bad_reply() {
        let g = ScriptedGenerator::new();
        g.push_reply("not json at all");
        g.push_reply(r#"{"ok": true}"#);
        let handle = g.clone();
        let p = pipeline(g);

        let map = p.generate_with_retry("prompt").await.unwrap();
        assert_eq!(map["ok"], json!(true));
        assert_eq!(handle.call_count(), 2);
    }

    #[tokio::test]
    async fn retry_bound_is_exact() {
        let g = ScriptedGenerator::new();
        for _ in 0..5 {
            g.push_reply("garbage");
        }
        let handle = g.clone();
        let p = pipeline(g);

        match p.generate_with_retry("prompt").await {
            Err(KbError::GenerationParse { attempts }) => assert_eq!(attempts, 3),
            other => panic!("expected GenerationParse, got {other:?}"),
        }
        assert_eq!(handle.call_count(), 3);
    }

    #[tokio::test]
    async fn answer_includes_free_text() {
        let g = ScriptedGenerator::new();
        g.push_reply("Focus on systems programming.");
        let p = pipeline(g);

        let snippets = vec![Snippet {
            section: "skills".into(),
            text: "[\"Go\", \"Rust\"]".into(),
            score: 1.0,
        }];
        let reply = p.answer("what next?", &snippets).await.unwrap();
        assert_eq!(reply, "Focus on systems programming.");
    }
}
