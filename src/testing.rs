//! Scripted generator for session and driver tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::StreamError;
use crate::generate::{GenerationRequest, Generator, TokenStream};

/// Emits a fixed list of chunks, then optionally fails or panics.
#[derive(Default)]
pub struct ScriptedGenerator {
    chunks: Vec<String>,
    fail_at_start: Option<String>,
    fail_after: Option<String>,
    panic_after: Option<usize>,
    pause_before: Option<(usize, Arc<Notify>)>,
    pub requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }

    /// `stream()` itself returns this error.
    pub fn failing_at_start(mut self, message: &str) -> Self {
        self.fail_at_start = Some(message.to_string());
        self
    }

    /// Yield this error after the last chunk.
    pub fn failing_with(mut self, message: &str) -> Self {
        self.fail_after = Some(message.to_string());
        self
    }

    /// Panic once `n` chunks have been yielded.
    pub fn panicking_after(mut self, n: usize) -> Self {
        self.panic_after = Some(n);
        self
    }

    /// Wait on `gate` before yielding chunk `index`.
    pub fn pausing_before(mut self, index: usize, gate: Arc<Notify>) -> Self {
        self.pause_before = Some((index, gate));
        self
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn stream(&self, request: GenerationRequest) -> Result<TokenStream, StreamError> {
        self.requests.lock().unwrap().push(request);

        if let Some(message) = &self.fail_at_start {
            return Err(StreamError::Backend(message.clone()));
        }

        let chunks = self.chunks.clone();
        let fail_after = self.fail_after.clone();
        let panic_after = self.panic_after;
        let pause_before = self.pause_before.clone();

        let stream = async_stream::stream! {
            for (i, chunk) in chunks.into_iter().enumerate() {
                if panic_after == Some(i) {
                    panic!("scripted panic after {i} chunks");
                }
                if let Some((index, gate)) = &pause_before {
                    if *index == i {
                        gate.notified().await;
                    }
                }
                yield Ok(chunk);
            }
            if let Some(message) = fail_after {
                yield Err(StreamError::Backend(message));
            }
        };
        Ok(Box::pin(stream))
    }
}
