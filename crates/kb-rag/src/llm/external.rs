//! OpenAI-compatible chat completions client with SSE streaming

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{
    ApiProvider, ChatMessage, ChatStreamEvent, GenerationConfig, LLMProvider, ProviderInfo,
    ProviderProfile, RequestParts,
};

pub struct OpenAiCompatibleProvider {
    provider: ApiProvider,
    api_key: String,
    model: String,
    profile: ProviderProfile,
    client: Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(
        provider: ApiProvider,
        api_key: String,
        model: String,
        connect_timeout: Duration,
    ) -> Result<Self> {
        // No overall request timeout: streamed answers are bounded by the caller's idle timer.
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()?;

        let profile = ProviderProfile::resolve(&model);
        tracing::info!(
            provider = provider.name(),
            model = %model,
            family = ?profile.family,
            "Creating OpenAiCompatibleProvider"
        );

        Ok(Self {
            provider,
            api_key,
            model,
            profile,
            client,
        })
    }

    async fn send(&self, body: &JsonValue) -> Result<reqwest::Response> {
        let endpoint = self.provider.chat_endpoint();
        let mut request = self.client.post(&endpoint).json(body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                anyhow!("Request to {} timed out", endpoint)
            } else if e.is_connect() {
                anyhow!("Failed to connect to {}: {}", endpoint, e)
            } else {
                anyhow!("Request to {} failed: {}", endpoint, e)
            }
        })?;

        let status = response.status();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !status.is_success() || content_type.contains("text/html") {
            let error = response.text().await.unwrap_or_default();
            let preview: String = error.chars().take(300).collect();
            return Err(anyhow!(
                "Chat endpoint error (HTTP {}, content-type: {}): {}",
                status,
                content_type,
                preview
            ));
        }
        Ok(response)
    }
}

#[async_trait]
impl LLMProvider for OpenAiCompatibleProvider {
    async fn chat(&self, messages: &[ChatMessage], config: &GenerationConfig) -> Result<String> {
        let body = self.profile.build_request(&RequestParts {
            model: &self.model,
            messages,
            config,
            stream: false,
        });
        let response = self.send(&body).await?;
        let text = response
            .text()
            .await
            .context("Failed to read chat response body")?;
        let parsed: JsonValue = serde_json::from_str(&text).map_err(|e| {
            let preview: String = text.chars().take(300).collect();
            anyhow!("Failed to parse chat response: {}. Body: {}", e, preview)
        })?;

        parsed["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("Chat response has no message content"))
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        config: &GenerationConfig,
    ) -> Result<mpsc::Receiver<ChatStreamEvent>> {
        let body = self.profile.build_request(&RequestParts {
            model: &self.model,
            messages,
            config,
            stream: true,
        });
        let response = self.send(&body).await?;

        let (tx, rx) = mpsc::channel::<ChatStreamEvent>(256);
        let mut byte_stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut decoder = SseDecoder::default();
            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(ChatStreamEvent::Failed(e.to_string())).await;
                        return;
                    }
                };
                for event in decoder.push(&chunk) {
                    let done = matches!(event, ChatStreamEvent::Done | ChatStreamEvent::Failed(_));
                    if tx.send(event).await.is_err() || done {
                        return;
                    }
                }
            }
            // Some servers close without [DONE]; a clean EOF still ends the answer.
            for event in decoder.finish() {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(ChatStreamEvent::Done).await;
        });

        Ok(rx)
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.provider.name().to_string(),
            model: self.model.clone(),
            supports_web_search: self.profile.supports_web_search,
            supports_thinking: self.profile.supports_thinking,
        }
    }
}

/// Incremental `text/event-stream` decoder.
///
/// Buffers raw bytes so multi-byte characters split across network chunks
/// are decoded intact.
#[derive(Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ChatStreamEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            events.extend(parse_sse_line(line.trim()));
        }
        events
    }

    /// Flush a trailing line that arrived without a newline.
    pub fn finish(&mut self) -> Vec<ChatStreamEvent> {
        let rest = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&rest);
        parse_sse_line(line.trim())
    }
}

fn parse_sse_line(line: &str) -> Vec<ChatStreamEvent> {
    let Some(data) = line.strip_prefix("data:") else {
        return Vec::new();
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return vec![ChatStreamEvent::Done];
    }
    let Ok(parsed) = serde_json::from_str::<JsonValue>(data) else {
        tracing::debug!(line = %data, "Skipping unparseable SSE data line");
        return Vec::new();
    };
    if let Some(message) = parsed["error"]["message"].as_str() {
        return vec![ChatStreamEvent::Failed(message.to_string())];
    }

    let delta = &parsed["choices"][0]["delta"];
    let mut events = Vec::new();
    if let Some(reasoning) = delta["reasoning_content"].as_str() {
        if !reasoning.is_empty() {
            events.push(ChatStreamEvent::ReasoningDelta(reasoning.to_string()));
        }
    }
    if let Some(content) = delta["content"].as_str() {
        if !content.is_empty() {
            events.push(ChatStreamEvent::ContentDelta(content.to_string()));
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_content_and_reasoning() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(
            b"data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"think\"}}]}\n\n\
              data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        );
        assert_eq!(
            events,
            vec![
                ChatStreamEvent::ReasoningDelta("think".into()),
                ChatStreamEvent::ContentDelta("Hel".into()),
            ]
        );
        assert_eq!(decoder.push(b"data: [DONE]\n\n"), vec![ChatStreamEvent::Done]);
    }

    #[test]
    fn test_decoder_split_multibyte() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"监督学习\"}}]}\n".as_bytes();
        let (head, tail) = line.split_at(40);
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(head).is_empty());
        assert_eq!(
            decoder.push(tail),
            vec![ChatStreamEvent::ContentDelta("监督学习".into())]
        );
    }

    #[test]
    fn test_ignores_comments_and_empty_deltas() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(b": keep-alive\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"\"}}]}\n");
        assert!(events.is_empty());
    }

    #[test]
    fn test_error_payload() {
        let events = parse_sse_line("data: {\"error\":{\"message\":\"quota exceeded\"}}");
        assert_eq!(events, vec![ChatStreamEvent::Failed("quota exceeded".into())]);
    }
}
