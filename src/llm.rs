//! Language-model provider seams and an Ollama-compatible HTTP client.
//!
//! The pipelines only see [`Embedder`] and [`Generator`]; [`OllamaClient`]
//! implements both against `/api/embed` and `/api/generate`.

use std::future::Future;

use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RagConfig;
use crate::error::{Error, Result};

/// Turns text into fixed-length vectors.
pub trait Embedder: Send + Sync {
    /// Fails with [`Error::Validation`] on empty text.
    fn embed_one(&self, text: &str) -> impl Future<Output = Result<Vec<f32>>> + Send;

    /// Fails on an empty batch. All returned vectors share one dimensionality.
    fn embed_batch(&self, texts: &[String]) -> impl Future<Output = Result<Vec<Vec<f32>>>> + Send;
}

/// Streams a completion for a prompt.
pub trait Generator: Send + Sync {
    /// Calls `on_chunk` for each fragment as it arrives, then returns the
    /// provider's final text. `on_chunk` may never be called.
    fn generate<F>(&self, prompt: &str, on_chunk: F) -> impl Future<Output = Result<String>> + Send
    where
        F: FnMut(&str) + Send;
}

pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
    embed_model: String,
}

impl OllamaClient {
    pub fn new(config: &RagConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| Error::Config(format!("failed to build HTTP client: {err}")))?;

        Ok(OllamaClient {
            client,
            base_url: config.ollama_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            embed_model: config.embed_model.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/{path}", self.base_url)
    }
}

async fn ensure_success(resp: Response, what: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp
        .text()
        .await
        .unwrap_or_else(|_| "<body unavailable>".to_string());
    Err(Error::Provider(format!("{what} returned {status}: {body}")))
}

impl Embedder for OllamaClient {
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(Error::Validation("text cannot be empty".into()));
        }
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| Error::Provider("no embeddings returned".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Err(Error::Validation("texts cannot be empty".into()));
        }
        if texts.iter().any(|t| t.trim().is_empty()) {
            return Err(Error::Validation("texts cannot contain empty entries".into()));
        }

        let request = EmbedRequest {
            model: &self.embed_model,
            input: texts,
        };
        let resp = self
            .client
            .post(self.endpoint("embed"))
            .json(&request)
            .send()
            .await?;
        let parsed: EmbedResponse = ensure_success(resp, "embedding request")
            .await?
            .json()
            .await?;

        if parsed.embeddings.len() != texts.len() {
            return Err(Error::Provider(format!(
                "provider returned {} embeddings for {} inputs",
                parsed.embeddings.len(),
                texts.len()
            )));
        }
        let dim = parsed.embeddings[0].len();
        if dim == 0 || parsed.embeddings.iter().any(|e| e.len() != dim) {
            return Err(Error::Provider(
                "provider returned embeddings of inconsistent dimension".into(),
            ));
        }

        debug!(count = parsed.embeddings.len(), dim, "generated embeddings");
        Ok(parsed.embeddings)
    }
}

impl Generator for OllamaClient {
    async fn generate<F>(&self, prompt: &str, mut on_chunk: F) -> Result<String>
    where
        F: FnMut(&str) + Send,
    {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: true,
        };
        let mut resp = ensure_success(
            self.client
                .post(self.endpoint("generate"))
                .json(&request)
                .send()
                .await?,
            "generation request",
        )
        .await?;

        // The body is newline-delimited JSON; a line may span several chunks.
        let mut pending: Vec<u8> = Vec::new();
        let mut answer = String::new();
        let mut done = false;

        while let Some(bytes) = resp.chunk().await? {
            pending.extend_from_slice(&bytes);
            while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                done |= handle_line(&line, &mut answer, &mut on_chunk)?;
            }
        }
        if !pending.is_empty() {
            done |= handle_line(&pending, &mut answer, &mut on_chunk)?;
        }

        if !done {
            debug!("generation stream ended without a done marker");
        }
        Ok(answer)
    }
}

fn handle_line<F>(line: &[u8], answer: &mut String, on_chunk: &mut F) -> Result<bool>
where
    F: FnMut(&str),
{
    let line = line.trim_ascii();
    if line.is_empty() {
        return Ok(false);
    }
    let event: GenerateEvent = serde_json::from_slice(line)
        .map_err(|err| Error::Provider(format!("malformed generation stream: {err}")))?;
    if let Some(message) = event.error {
        return Err(Error::Provider(message));
    }
    if !event.response.is_empty() {
        on_chunk(&event.response);
        answer.push_str(&event.response);
    }
    Ok(event.done)
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateEvent {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}
