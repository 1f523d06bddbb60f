//! # Generation backends
//!
//! A [`Generator`] turns a [`GenerationRequest`] into a stream of text chunks. The stream ends
//! cleanly when the service reports it is done (or the connection closes after zero or more
//! chunks) and yields an `Err` item when the service fails mid-answer.
//!
//! - [`OllamaGenerator`]: `POST {api_url}/api/generate` with
//!   `{model, prompt, options: {temperature}, stream: true}`; the reply is newline-delimited JSON,
//!   one `{"response": "...", "done": false}` object per chunk.
//! - [`OpenAiGenerator`]: any OpenAI-compatible `/v1` endpoint, via `async-openai` streaming chat
//!   completions with the prompt as a single user message.

use std::pin::Pin;

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestUserMessage,
        ChatCompletionRequestUserMessageContent, CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StreamError;

/// Incremental text chunks of one answer.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, StreamError>> + Send>>;

/// Everything a backend needs for one answer.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: String,
    pub temperature: f32,
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// Start generating. Errors that happen before the first chunk (connection refused, HTTP
    /// status) are returned here; later ones arrive as stream items.
    async fn stream(&self, request: GenerationRequest) -> Result<TokenStream, StreamError>;
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    options: OllamaOptions,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateLine {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

enum Line {
    Token(String),
    /// End of the answer, possibly with a last piece of text.
    Done(Option<String>),
    Skip,
}

fn parse_line(raw: &[u8]) -> Result<Line, StreamError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(Line::Skip);
    }
    let line: OllamaGenerateLine =
        serde_json::from_slice(raw).map_err(|e| StreamError::Decode(e.to_string()))?;
    if let Some(message) = line.error {
        return Err(StreamError::Backend(message));
    }
    if line.done {
        return Ok(Line::Done(Some(line.response).filter(|r| !r.is_empty())));
    }
    if line.response.is_empty() {
        return Ok(Line::Skip);
    }
    Ok(Line::Token(line.response))
}

/// Streams from an Ollama server's `/api/generate`.
pub struct OllamaGenerator {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaGenerator {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn stream(&self, request: GenerationRequest) -> Result<TokenStream, StreamError> {
        let body = OllamaGenerateRequest {
            model: &request.model,
            prompt: &request.prompt,
            options: OllamaOptions {
                temperature: request.temperature,
            },
            stream: true,
        };

        debug!(model = %request.model, temperature = request.temperature, "sending generate request");

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let byte_stream = response.bytes_stream();

        let stream = async_stream::stream! {
            let mut buffer: Vec<u8> = Vec::new();
            let mut byte_stream = std::pin::pin!(byte_stream);
            let mut finished = false;

            'read: while let Some(chunk) = byte_stream.next().await {
                let bytes = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        yield Err(StreamError::Request(e));
                        finished = true;
                        break;
                    }
                };
                buffer.extend_from_slice(&bytes);

                // Lines are split on raw bytes so multi-byte characters never straddle a chunk.
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    match parse_line(&line) {
                        Ok(Line::Token(text)) => yield Ok(text),
                        Ok(Line::Skip) => {}
                        Ok(Line::Done(tail)) => {
                            if let Some(text) = tail {
                                yield Ok(text);
                            }
                            finished = true;
                            break 'read;
                        }
                        Err(e) => {
                            yield Err(e);
                            finished = true;
                            break 'read;
                        }
                    }
                }
            }

            // Anything after the terminal line is ignored; otherwise the last object may lack
            // its newline.
            if !finished && !buffer.is_empty() {
                match parse_line(&buffer) {
                    Ok(Line::Token(text) | Line::Done(Some(text))) => yield Ok(text),
                    Ok(_) => {}
                    Err(e) => yield Err(e),
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Streams from an OpenAI-compatible chat completions endpoint.
pub struct OpenAiGenerator {
    client: Client<OpenAIConfig>,
}

impl OpenAiGenerator {
    pub fn new(api_base: &str, api_key: &str) -> Self {
        let config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(api_base);
        Self {
            client: Client::with_config(config),
        }
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    async fn stream(&self, request: GenerationRequest) -> Result<TokenStream, StreamError> {
        let message = ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
            content: ChatCompletionRequestUserMessageContent::Text(request.prompt),
            name: None,
        });

        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(request.model)
            .temperature(request.temperature)
            .messages(vec![message])
            .build()?;

        let mut upstream = self.client.chat().create_stream(chat_request).await?;

        let stream = async_stream::stream! {
            while let Some(result) = upstream.next().await {
                match result {
                    Ok(response) => {
                        let text: String = response
                            .choices
                            .iter()
                            .filter_map(|choice| choice.delta.content.as_deref())
                            .collect();
                        if !text.is_empty() {
                            yield Ok(text);
                        }
                    }
                    Err(e) => {
                        yield Err(StreamError::from(e));
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn request() -> GenerationRequest {
        GenerationRequest {
            model: "gemma3:1b".into(),
            prompt: "What is AI?".into(),
            temperature: 1.5,
        }
    }

    async fn collect(stream: TokenStream) -> Vec<Result<String, StreamError>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn test_ollama_streams_chunks_in_order() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/generate");
                then.status(200).body(concat!(
                    "{\"response\":\"AI \",\"done\":false}\n",
                    "{\"response\":\"stands \",\"done\":false}\n",
                    "\n",
                    "{\"response\":\"for \",\"done\":false}\n",
                    "{\"response\":\"Artificial Intelligence.\",\"done\":false}\n",
                    "{\"response\":\"\",\"done\":true,\"eval_count\":4}\n",
                    "{\"response\":\"ignored\",\"done\":false}\n",
                ));
            })
            .await;

        let generator = OllamaGenerator::new(&server.base_url());
        let items = collect(generator.stream(request()).await.unwrap()).await;

        mock.assert_async().await;
        let chunks: Vec<String> = items.into_iter().map(Result::unwrap).collect();
        assert_eq!(chunks, vec!["AI ", "stands ", "for ", "Artificial Intelligence."]);
    }

    #[tokio::test]
    async fn test_ollama_ignores_lines_after_done() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/generate");
                then.status(200).body(concat!(
                    "{\"response\":\"Hello\",\"done\":false}\n",
                    "{\"response\":\" world\",\"done\":true}\n",
                    "{\"response\":\"late\",\"done\":false}\n",
                    "{\"response\":\"later\",\"done\":false}\n",
                    "{\"response\":\"unterminated\"",
                ));
            })
            .await;

        let generator = OllamaGenerator::new(&server.base_url());
        let items = collect(generator.stream(request()).await.unwrap()).await;

        let chunks: Vec<String> = items.into_iter().map(Result::unwrap).collect();
        assert_eq!(chunks, vec!["Hello", " world"]);
    }

    #[tokio::test]
    async fn test_ollama_ignores_lines_after_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/generate");
                then.status(200).body(concat!(
                    "{\"error\":\"out of memory\"}\n",
                    "{\"response\":\"ghost\",\"done\":false}\n",
                    "{\"response\":\"ghost\",\"done\":true}",
                ));
            })
            .await;

        let generator = OllamaGenerator::new(&server.base_url());
        let items = collect(generator.stream(request()).await.unwrap()).await;

        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], Err(StreamError::Backend(msg)) if msg == "out of memory"));
    }

    #[tokio::test]
    async fn test_ollama_empty_response_is_clean_end() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/generate");
                then.status(200).body("");
            })
            .await;

        let generator = OllamaGenerator::new(&server.base_url());
        let items = collect(generator.stream(request()).await.unwrap()).await;
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_ollama_last_line_without_newline() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/generate");
                then.status(200)
                    .body("{\"response\":\"a\",\"done\":false}\n{\"response\":\"b\",\"done\":true}");
            })
            .await;

        let generator = OllamaGenerator::new(&server.base_url());
        let chunks: Vec<String> = collect(generator.stream(request()).await.unwrap())
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(chunks, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_ollama_error_line_ends_stream() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/generate");
                then.status(200).body(concat!(
                    "{\"response\":\"partial\",\"done\":false}\n",
                    "{\"error\":\"model crashed\"}\n",
                ));
            })
            .await;

        let generator = OllamaGenerator::new(&server.base_url());
        let items = collect(generator.stream(request()).await.unwrap()).await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "partial");
        match &items[1] {
            Err(StreamError::Backend(msg)) => assert_eq!(msg, "model crashed"),
            other => panic!("expected backend error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ollama_http_error_before_stream() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/generate");
                then.status(404).body("model 'nope' not found");
            })
            .await;

        let generator = OllamaGenerator::new(&server.base_url());
        match generator.stream(request()).await {
            Err(StreamError::Status { status, body }) => {
                assert_eq!(status, 404);
                assert!(body.contains("not found"));
            }
            Err(other) => panic!("expected status error, got {other:?}"),
            Ok(_) => panic!("expected status error, got a stream"),
        }
    }

    #[test]
    fn test_parse_line_rejects_garbage() {
        assert!(matches!(parse_line(b"not json\n"), Err(StreamError::Decode(_))));
        assert!(matches!(parse_line(b"  \n"), Ok(Line::Skip)));
    }
}
