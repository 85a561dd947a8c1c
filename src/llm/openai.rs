//! OpenAI-compatible chat-completion client over reqwest.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::llm::provider::{
    ChatCompletionRequest, ChatCompletionResponse, ChunkReceiver, LlmProvider,
};
use crate::llm::sse::{SseDecoder, SseItem};

/// Fragments buffered between the HTTP reader and the consumer.
const STREAM_BUFFER: usize = 64;

pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
}

impl OpenAiProvider {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn post(&self, request: &ChatCompletionRequest) -> Result<reqwest::Response, LlmError> {
        let resp = self
            .client
            .post(self.url())
            .bearer_auth(self.api_key.expose_secret())
            .json(request)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: self.name().to_string(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, LlmError> {
        debug!(model = %request.model, "Chat completion request");
        let resp = self.post(&request).await?;
        let text = resp.text().await.map_err(|e| LlmError::InvalidResponse {
            provider: self.name().to_string(),
            reason: e.to_string(),
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn stream(
        &self,
        mut request: ChatCompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkReceiver, LlmError> {
        request.stream = true;
        debug!(model = %request.model, "Chat completion stream request");
        let mut resp = self.post(&request).await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let mut decoder = SseDecoder::new();
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = resp.chunk() => next,
                };
                let ended = !matches!(next, Ok(Some(_)));
                let items = match next {
                    Ok(Some(bytes)) => decoder.push(&bytes),
                    Ok(None) => decoder.finish(),
                    Err(e) => vec![Err(LlmError::StreamFault(e.to_string()))],
                };
                for item in items {
                    match item {
                        Ok(SseItem::Done) => return,
                        Ok(SseItem::Chunk(chunk)) => {
                            if tx.send(Ok(chunk)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
                if ended {
                    break;
                }
            }
        });
        Ok(rx)
    }
}
