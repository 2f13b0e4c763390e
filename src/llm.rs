// src/llm.rs
//! Chat-completion client used for content enrichment: a provider trait, an
//! OpenAI-compatible implementation, and a bounded-retry wrapper.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One system prompt plus one user message in, one completion out.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_content: &str) -> Result<String>;
    /// Provider name for diagnostics.
    fn name(&self) -> &'static str;
}

/// Talks to any OpenAI-compatible chat-completions endpoint.
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatClient {
    pub fn new(api_url: &str, api_key: &str, model: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client");
        Self {
            http,
            api_url: api_url.to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }
}

#[derive(Serialize)]
struct Msg<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatReq<'a> {
    model: &'a str,
    messages: Vec<Msg<'a>>,
}

#[derive(Deserialize)]
struct ChatResp {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMsg,
}

#[derive(Deserialize)]
struct ChoiceMsg {
    content: String,
}

#[async_trait]
impl ChatClient for OpenAiCompatClient {
    async fn complete(&self, system_prompt: &str, user_content: &str) -> Result<String> {
        let req = ChatReq {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: system_prompt,
                },
                Msg {
                    role: "user",
                    content: user_content,
                },
            ],
        };
        let resp = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .context("sending chat completion request")?;
        if !resp.status().is_success() {
            anyhow::bail!("chat completion returned {}", resp.status());
        }
        let body: ChatResp = resp
            .json()
            .await
            .context("decoding chat completion response")?;
        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow!("chat completion had no choices"))
    }

    fn name(&self) -> &'static str {
        "openai-compat"
    }
}

/// Bounded retry around a provider: a transient upstream hiccup should not
/// cost the item, but a persistently failing call must not stall the run.
pub struct RetryingChat<C> {
    inner: C,
    attempts: u32,
    backoff: Duration,
}

impl<C: ChatClient> RetryingChat<C> {
    /// Default policy: 3 attempts, 2 s between them.
    pub fn new(inner: C) -> Self {
        Self::with_policy(inner, 3, Duration::from_secs(2))
    }

    pub fn with_policy(inner: C, attempts: u32, backoff: Duration) -> Self {
        Self {
            inner,
            attempts: attempts.max(1),
            backoff,
        }
    }
}

#[async_trait]
impl<C: ChatClient> ChatClient for RetryingChat<C> {
    async fn complete(&self, system_prompt: &str, user_content: &str) -> Result<String> {
        let mut last_err = None;
        for attempt in 1..=self.attempts {
            match self.inner.complete(system_prompt, user_content).await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    warn!(
                        attempt,
                        max = self.attempts,
                        provider = self.inner.name(),
                        error = %e,
                        "chat completion failed"
                    );
                    last_err = Some(e);
                    if attempt < self.attempts {
                        tokio::time::sleep(self.backoff).await;
                    }
                }
            }
        }
        Err(last_err.expect("at least one attempt was made"))
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}
