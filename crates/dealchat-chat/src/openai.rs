//! OpenAI-compatible streaming chat completions.
//!
//! Works against any endpoint that speaks `POST {base}/chat/completions`
//! with `stream: true` and answers with server-sent events.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use dealchat_core::config::ModelConfig;

use crate::gateway::{GatewayError, ModelGateway, ModelRequest, TokenStream};

pub struct OpenAiGateway {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
}

#[derive(Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

impl OpenAiGateway {
    pub fn new(config: &ModelConfig, api_key: String) -> Self {
        Self {
            client: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    /// Build a gateway reading the API key from the configured environment
    /// variable.
    pub fn from_env(config: &ModelConfig) -> Result<Self, GatewayError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            GatewayError::RequestFailed(format!(
                "environment variable {} is not set",
                config.api_key_env
            ))
        })?;
        Ok(Self::new(config, api_key))
    }

    fn build_body<'a>(&'a self, request: &'a ModelRequest, system: &'a str) -> ChatCompletionRequest<'a> {
        let mut messages = Vec::with_capacity(request.turns.len() + 1);
        messages.push(WireMessage {
            role: "system",
            content: system,
        });
        for turn in &request.turns {
            messages.push(WireMessage {
                role: turn.role.as_str(),
                content: &turn.content,
            });
        }
        ChatCompletionRequest {
            model: &self.model,
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream: true,
        }
    }
}

#[async_trait]
impl ModelGateway for OpenAiGateway {
    async fn stream(&self, request: &ModelRequest) -> Result<TokenStream, GatewayError> {
        let system = request.system_with_tools();
        let body = self.build_body(request, &system);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::RequestFailed(e.to_string()))?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(GatewayError::RateLimited);
        }
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            tracing::warn!(%status, body_len = text.len(), "Model provider returned an error");
            return Err(GatewayError::RequestFailed(format!("HTTP {}", status)));
        }

        let tokens = response
            .bytes_stream()
            .scan(SseDecoder::default(), |decoder, chunk| {
                let items = match chunk {
                    Ok(bytes) => decoder.push(&bytes),
                    Err(e) => vec![Err(GatewayError::RequestFailed(e.to_string()))],
                };
                futures::future::ready(Some(stream::iter(items)))
            })
            .flatten();

        Ok(Box::pin(tokens))
    }
}

/// Incremental server-sent-events decoder for chat completion chunks.
///
/// Bytes are buffered until a full line is available, so events and
/// multi-byte characters split across network reads decode correctly.
#[derive(Default)]
struct SseDecoder {
    pending: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<Result<String, GatewayError>> {
        self.pending.extend_from_slice(bytes);
        let mut out = Vec::new();

        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if self.done {
                continue;
            }
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim_start();
            if data == "[DONE]" {
                self.done = true;
                continue;
            }
            if let Ok(chunk) = serde_json::from_str::<ChatCompletionChunk>(data) {
                if let Some(content) = chunk.choices.into_iter().next().and_then(|c| c.delta.content) {
                    if !content.is_empty() {
                        out.push(Ok(content));
                    }
                }
            } else if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(data) {
                out.push(Err(GatewayError::InvalidResponse(envelope.error.message)));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::PromptTurn;
    use dealchat_core::types::Role;

    fn delta(content: &str) -> String {
        format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":{}}}}}]}}\n\n",
            serde_json::to_string(content).unwrap()
        )
    }

    fn texts(items: Vec<Result<String, GatewayError>>) -> Vec<String> {
        items.into_iter().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_decodes_deltas_until_done() {
        let mut decoder = SseDecoder::default();
        let payload = format!("{}{}data: [DONE]\n\n{}", delta("Hel"), delta("lo"), delta("late"));
        assert_eq!(texts(decoder.push(payload.as_bytes())), vec!["Hel", "lo"]);
    }

    #[test]
    fn test_event_split_across_reads() {
        let mut decoder = SseDecoder::default();
        let payload = delta("split");
        let (a, b) = payload.as_bytes().split_at(12);
        assert!(decoder.push(a).is_empty());
        assert_eq!(texts(decoder.push(b)), vec!["split"]);
    }

    #[test]
    fn test_multibyte_character_split_across_reads() {
        let mut decoder = SseDecoder::default();
        let payload = delta("caf\u{e9}");
        let bytes = payload.as_bytes();
        let cut = payload.find('\u{e9}').unwrap() + 1;
        assert!(decoder.push(&bytes[..cut]).is_empty());
        assert_eq!(texts(decoder.push(&bytes[cut..])), vec!["caf\u{e9}"]);
    }

    #[test]
    fn test_crlf_and_role_only_chunks() {
        let mut decoder = SseDecoder::default();
        let payload = "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\r\n\r\ndata: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\r\n";
        assert_eq!(texts(decoder.push(payload.as_bytes())), vec!["x"]);
    }

    #[test]
    fn test_error_event_surfaces() {
        let mut decoder = SseDecoder::default();
        let items = decoder.push(b"data: {\"error\":{\"message\":\"overloaded\"}}\n");
        assert_eq!(
            items,
            vec![Err(GatewayError::InvalidResponse("overloaded".to_string()))]
        );
    }

    #[test]
    fn test_request_body_shape() {
        let config = ModelConfig {
            base_url: "http://localhost:1234/v1/".to_string(),
            model: "test-model".to_string(),
            ..ModelConfig::default()
        };
        let gateway = OpenAiGateway::new(&config, "key".to_string());
        assert_eq!(gateway.base_url, "http://localhost:1234/v1");

        let request = ModelRequest {
            system: "sys".to_string(),
            turns: vec![
                PromptTurn {
                    role: Role::User,
                    content: "q".to_string(),
                },
                PromptTurn {
                    role: Role::Assistant,
                    content: "a".to_string(),
                },
            ],
            tools: vec![],
        };
        let system = request.system_with_tools();
        let body = serde_json::to_value(gateway.build_body(&request, &system)).unwrap();
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][2]["content"], "a");
    }

    #[test]
    fn test_from_env_requires_key() {
        let config = ModelConfig {
            api_key_env: "DEALCHAT_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..ModelConfig::default()
        };
        assert!(OpenAiGateway::from_env(&config).is_err());
    }
}
