use crate::client::{ChunkStream, ProviderClient, once};
use crate::error::{LlmError, Result};
use crate::types::{ChatMessage, StreamChunk, Usage};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Client for any backend speaking the OpenAI chat-completions protocol:
/// OpenAI itself, Groq, and Ollama's `/v1` endpoint.
#[derive(Clone)]
pub struct OpenAiCompatibleClient {
    name: String,
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    streaming: bool,
}

impl OpenAiCompatibleClient {
    #[tracing::instrument(level = "debug", skip_all, fields(name = %name))]
    pub fn new(
        name: &str,
        base_url: &str,
        model: &str,
        api_key: Option<String>,
        streaming: bool,
    ) -> Result<Self> {
        if model.trim().is_empty() {
            return Err(LlmError::InvalidInput(format!(
                "provider {name}: model must not be empty"
            )));
        }
        // Per-attempt deadlines are enforced by the router; this only bounds
        // connection setup.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Ok(Self {
            name: name.to_string(),
            http,
            endpoint: chat_completions_url(base_url),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            model: model.to_string(),
            streaming,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request(&self, body: &ChatRequest) -> reqwest::RequestBuilder {
        let req = self.http.post(&self.endpoint).json(body);
        match self.api_key.as_deref() {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn chat(&self, messages: Vec<WireMessage>) -> Result<ChunkStream> {
        let body = ChatRequest::new(&self.model, messages, false);
        let response = self.request(&body).send().await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::from_status(status.as_u16(), text));
        }

        let parsed: ChatResponse = serde_json::from_str(&text)?;
        let choice = parsed.choices.into_iter().next().ok_or_else(|| {
            LlmError::ResponseFormat(format!("{} response missing choices", self.name))
        })?;
        let usage = parsed
            .usage
            .map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_default();
        Ok(once(choice.message.content.unwrap_or_default(), usage))
    }

    async fn chat_stream(&self, messages: Vec<WireMessage>) -> Result<ChunkStream> {
        let body = ChatRequest::new(&self.model, messages, true);
        let response = self.request(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status.as_u16(), text));
        }

        Ok(Box::pin(parse_chunks(decode_sse(response.bytes_stream()))))
    }
}

#[async_trait]
impl ProviderClient for OpenAiCompatibleClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    #[tracing::instrument(level = "info", skip_all, fields(provider = %self.name, streaming = streaming))]
    async fn complete(
        &self,
        prompt: &str,
        context: &[ChatMessage],
        streaming: bool,
    ) -> Result<ChunkStream> {
        if prompt.trim().is_empty() {
            return Err(LlmError::InvalidInput("prompt must not be empty".to_string()));
        }
        let mut messages: Vec<WireMessage> = context.iter().map(WireMessage::from).collect();
        messages.push(WireMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        });

        if streaming && self.streaming {
            self.chat_stream(messages).await
        } else {
            self.chat(messages).await
        }
    }
}

fn chat_completions_url(base_url: &str) -> String {
    let trimmed = base_url.trim().trim_end_matches('/');
    if trimmed.ends_with("/chat/completions") {
        return trimmed.to_string();
    }
    format!("{trimmed}/chat/completions")
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

impl ChatRequest {
    fn new(model: &str, messages: Vec<WireMessage>, stream: bool) -> Self {
        let mut out = Self {
            model: model.to_string(),
            messages,
            stream: None,
            stream_options: None,
        };
        if stream {
            out.stream = Some(true);
            out.stream_options = Some(StreamOptions {
                include_usage: true,
            });
        }
        out
    }
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

impl From<&ChatMessage> for WireMessage {
    fn from(m: &ChatMessage) -> Self {
        Self {
            role: m.role.as_str().to_string(),
            content: m.content.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
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

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamResponseChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug)]
enum SseEvent {
    Data(String),
    Other,
}

fn parse_chunks<S>(sse: S) -> impl Stream<Item = Result<StreamChunk>> + Send
where
    S: Stream<Item = Result<SseEvent>> + Send + 'static,
{
    let sse = Box::pin(sse);
    futures_util::stream::unfold(
        (sse, None::<Usage>, false),
        |(mut sse, mut usage, done)| async move {
            if done {
                return None;
            }
            loop {
                let Some(next) = sse.as_mut().next().await else {
                    // Some servers close without [DONE]; still terminate cleanly.
                    let usage = usage.unwrap_or_default();
                    return Some((Ok(StreamChunk::Done { usage }), (sse, None, true)));
                };
                match next {
                    Ok(SseEvent::Data(data)) => {
                        if data.trim() == "[DONE]" {
                            let usage = usage.unwrap_or_default();
                            return Some((Ok(StreamChunk::Done { usage }), (sse, None, true)));
                        }
                        let chunk: StreamResponseChunk = match serde_json::from_str(&data) {
                            Ok(v) => v,
                            Err(e) => {
                                return Some((
                                    Err(LlmError::StreamParse(format!(
                                        "chunk json error={e} data={data}"
                                    ))),
                                    (sse, usage, true),
                                ));
                            }
                        };
                        if let Some(u) = chunk.usage.as_ref() {
                            usage = Some(Usage {
                                prompt_tokens: u.prompt_tokens,
                                completion_tokens: u.completion_tokens,
                            });
                        }
                        let content = chunk
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|c| c.delta.content)
                            .unwrap_or_default();
                        if !content.is_empty() {
                            return Some((Ok(StreamChunk::Delta { content }), (sse, usage, false)));
                        }
                    }
                    Ok(SseEvent::Other) => continue,
                    Err(e) => return Some((Err(e), (sse, usage, true))),
                }
            }
        },
    )
}

fn decode_sse<S, E>(bytes_stream: S) -> impl Stream<Item = Result<SseEvent>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + Unpin + 'static,
    E: std::fmt::Display + Send + 'static,
{
    futures_util::stream::unfold(
        (bytes_stream, String::new()),
        |(mut stream, mut buffer)| async move {
            loop {
                if let Some(idx) = buffer.find("\n\n") {
                    let raw = buffer[..idx].to_string();
                    buffer = buffer[idx + 2..].to_string();

                    let mut data_lines = Vec::new();
                    for line in raw.lines() {
                        let line = line.trim_end();
                        if let Some(rest) = line.strip_prefix("data:") {
                            data_lines.push(rest.trim_start().to_string());
                        }
                    }
                    if data_lines.is_empty() {
                        return Some((Ok(SseEvent::Other), (stream, buffer)));
                    }
                    return Some((Ok(SseEvent::Data(data_lines.join("\n"))), (stream, buffer)));
                }

                match stream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                        continue;
                    }
                    Some(Err(e)) => {
                        return Some((Err(LlmError::Transport(e.to_string())), (stream, buffer)));
                    }
                    None => return None,
                }
            }
        },
    )
}
