//! Generator abstraction — the outbound language-model call.
//!
//! `Generator` is an enum over concrete backends. Enum dispatch avoids `dyn`
//! trait objects and the `async-trait` dependency; adding a backend means a
//! new variant plus a new `complete` arm.
//!
//! Generators are shared immutable capabilities — clone them freely.

use std::collections::VecDeque;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU32, Ordering},
};
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

use crate::config::GeneratorConfig;
use crate::error::KbError;

/// All available generator backends.
#[derive(Debug, Clone)]
pub enum Generator {
    /// Any HTTP endpoint implementing `/v1/chat/completions`.
    OpenAi(OpenAiGenerator),
    /// Canned replies — tests and keyless deployments.
    Scripted(ScriptedGenerator),
}

impl Generator {
    /// Build the configured backend. The API key is only consulted for HTTP
    /// backends.
    pub fn from_config(cfg: &GeneratorConfig, api_key: Option<String>) -> Result<Self, KbError> {
        match cfg.provider.as_str() {
            "openai" => Ok(Generator::OpenAi(OpenAiGenerator::new(
                cfg.api_base_url.clone(),
                cfg.model.clone(),
                cfg.temperature,
                cfg.timeout_seconds,
                api_key,
            )?)),
            "scripted" => Ok(Generator::Scripted(ScriptedGenerator::new())),
            other => Err(KbError::Config(format!("unknown generator provider: '{other}'"))),
        }
    }

    /// Send `prompt` (plus an optional system message) and return the text
    /// reply.
    pub async fn complete(&self, prompt: &str, system: Option<&str>) -> Result<String, KbError> {
        match self {
            Generator::OpenAi(g) => g.complete(prompt, system).await,
            Generator::Scripted(g) => g.complete(prompt).await,
        }
    }
}

// ── OpenAI-compatible backend ─────────────────────────────────────────────────

/// Adapter for OpenAI and compatible hosted or local endpoints.
///
/// Constructed once at startup, then cheaply cloned because
/// `reqwest::Client` is an `Arc` internally. All wire types are private to
/// this module.
#[derive(Debug, Clone)]
pub struct OpenAiGenerator {
    client: Client,
    api_base_url: String,
    model: String,
    temperature: f32,
    api_key: Option<String>,
}

impl OpenAiGenerator {
    /// `api_key` is `None` for keyless local models. When present it is sent
    /// as `Authorization: Bearer <key>` on every request.
    pub fn new(
        api_base_url: String,
        model: String,
        temperature: f32,
        timeout_seconds: u64,
        api_key: Option<String>,
    ) -> Result<Self, KbError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| KbError::Generator(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, api_base_url, model, temperature, api_key })
    }

    pub async fn complete(&self, prompt: &str, system: Option<&str>) -> Result<String, KbError> {
        let mut messages = Vec::new();
        if let Some(sys) = system {
            messages.push(Message { role: "system".to_string(), content: sys.to_string() });
        }
        messages.push(Message { role: "user".to_string(), content: prompt.to_string() });

        let payload = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: Some(self.temperature),
        };

        debug!(model = %payload.model, prompt_len = prompt.len(), "sending generator request");
        if tracing::enabled!(tracing::Level::TRACE) {
            let json = serde_json::to_string_pretty(&payload)
                .unwrap_or_else(|e| format!("<serialization failed: {e}>"));
            trace!(payload = %json, "full generator request payload");
        }

        let mut req = self.client.post(&self.api_base_url).json(&payload);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(|e| {
            error!(url = %self.api_base_url, error = %e, "generator HTTP request failed (transport)");
            KbError::Generator(e.to_string())
        })?;
        let response = check_status(response).await?;

        let parsed = response.json::<ChatCompletionResponse>().await.map_err(|e| {
            error!(error = %e, "failed to deserialize generator response");
            KbError::Generator(format!("failed to parse response body: {e}"))
        })?;

        debug!(choices = parsed.choices.len(), "received generator response");

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| KbError::Generator("empty or missing content in response".into()))
    }
}

// ── Scripted backend ──────────────────────────────────────────────────────────

/// Returns queued replies in order, then a fixed minimal document.
///
/// The call counter and queue are shared across clones, so a test can hold a
/// handle while the service owns another.
#[derive(Debug, Clone)]
pub struct ScriptedGenerator {
    replies: Arc<Mutex<VecDeque<String>>>,
    calls: Arc<AtomicU32>,
    delay: Duration,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self {
            replies: Arc::new(Mutex::new(VecDeque::new())),
            calls: Arc::new(AtomicU32::new(0)),
            delay: Duration::ZERO,
        }
    }

    /// Artificial per-call latency, for exercising concurrent paths.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue the next reply. Replies are consumed in FIFO order.
    pub fn push_reply(&self, reply: impl Into<String>) {
        self.replies
            .lock()
            .expect("scripted replies lock poisoned")
            .push_back(reply.into());
    }

    /// Total `complete` calls so far.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn complete(&self, _prompt: &str) -> Result<String, KbError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let queued = self
            .replies
            .lock()
            .expect("scripted replies lock poisoned")
            .pop_front();
        Ok(queued.unwrap_or_else(|| r#"{"summary": "no scripted reply queued"}"#.to_string()))
    }
}

impl Default for ScriptedGenerator {
    fn default() -> Self {
        Self::new()
    }
}

// ── Private wire types ────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

// Error envelope used by OpenAI and compatible APIs.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

/// Consume the response and return it if successful, or a structured error.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, KbError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read error body>".to_string());

    let message = if let Ok(env) = serde_json::from_str::<ErrorEnvelope>(&body) {
        let code = env
            .error
            .code
            .map(|v| match v {
                serde_json::Value::String(s) => format!(" [code={s}]"),
                other => format!(" [code={other}]"),
            })
            .unwrap_or_default();
        format!("HTTP {status}{code}: {}", env.error.message)
    } else {
        format!("HTTP {status}: {body}")
    };

    error!(%status, %message, "generator returned HTTP error");
    Err(KbError::Generator(message))
}
