//! # Streaming session
//!
//! A [`StreamSession`] runs one question/answer exchange with a [`Generator`]. It owns:
//!
//! - a bounded token channel (producer → consumer, one chunk per message)
//! - an error channel with room for exactly one error
//! - a oneshot carrying the aggregated answer on success
//! - a [`CancellationToken`] derived from the caller's token
//!
//! ## Lifecycle
//!
//! ```text
//! Idle ──start──▶ Streaming ──┬─▶ Completed   (full text delivered, channels closed)
//!                             ├─▶ Errored     (error delivered, channels closed)
//!                             └─▶ Canceled    (consumer called cancel)
//! ```
//!
//! `Idle` is what the driver reports while it holds no session; a session exists only from
//! `start` on. Terminal states never change and a session is never restarted.
//!
//! ## Ownership
//!
//! The producer task holds every sender. It delivers at most one terminal message (error or
//! full text) and only then drops its senders, so the token channel closes after that message
//! is in place. The consumer only ever drops receivers, in [`StreamSession::teardown`], which is
//! latched and safe to call any number of times.
//!
//! The producer checks the cancellation token before every emission and races every send
//! against it, so a send blocked on a full channel never outlives a cancel.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::{FutureExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::StreamError;
use crate::generate::{GenerationRequest, Generator};

/// Default capacity of the token channel.
pub const DEFAULT_TOKEN_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Streaming,
    Completed,
    Errored,
    Canceled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Errored | SessionState::Canceled
        )
    }
}

/// What [`StreamSession::next_event`] observed.
#[derive(Debug)]
pub enum SessionEvent {
    Token(String),
    /// The stream is over. Check [`StreamSession::state`] for how it ended.
    End,
    Error(StreamError),
}

enum Polled {
    Error(Option<StreamError>),
    Token(Option<String>),
}

pub struct StreamSession {
    request: GenerationRequest,
    state: SessionState,
    token_rx: Option<mpsc::Receiver<String>>,
    error_rx: Option<mpsc::Receiver<StreamError>>,
    full_rx: Option<oneshot::Receiver<String>>,
    errors_closed: bool,
    aggregated_text: String,
    cancel: CancellationToken,
    torn_down: AtomicBool,
    producer: Option<JoinHandle<()>>,
}

impl StreamSession {
    /// Spawn the producer and return a session in [`SessionState::Streaming`].
    ///
    /// The session's cancellation scope is a child of `parent`, so cancelling `parent` stops it
    /// too. Must be called inside a tokio runtime.
    pub fn start(
        generator: Arc<dyn Generator>,
        request: GenerationRequest,
        token_buffer: usize,
        parent: &CancellationToken,
    ) -> Self {
        let (token_tx, token_rx) = mpsc::channel(token_buffer.max(1));
        let (error_tx, error_rx) = mpsc::channel(1);
        let (full_tx, full_rx) = oneshot::channel();
        let cancel = parent.child_token();

        let producer = tokio::spawn(produce(
            generator,
            request.clone(),
            token_tx,
            error_tx,
            full_tx,
            cancel.clone(),
        ));

        debug!(model = %request.model, "session started");

        Self {
            request,
            state: SessionState::Streaming,
            token_rx: Some(token_rx),
            error_rx: Some(error_rx),
            full_rx: Some(full_rx),
            errors_closed: false,
            aggregated_text: String::new(),
            cancel,
            torn_down: AtomicBool::new(false),
            producer: Some(producer),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn request(&self) -> &GenerationRequest {
        &self.request
    }

    /// The full answer once the session is [`Completed`](SessionState::Completed), empty
    /// otherwise.
    pub fn aggregated_text(&self) -> &str {
        &self.aggregated_text
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Wait for the next token, error or end of stream.
    ///
    /// An error already queued wins over queued tokens. Once the session is terminal or torn
    /// down this returns [`SessionEvent::End`] immediately.
    pub async fn next_event(&mut self) -> SessionEvent {
        loop {
            if self.state.is_terminal() || self.is_torn_down() {
                return SessionEvent::End;
            }

            let polled = {
                let Some(token_rx) = self.token_rx.as_mut() else {
                    return SessionEvent::End;
                };
                let watch_errors = !self.errors_closed;
                let error_rx = self.error_rx.as_mut();

                tokio::select! {
                    biased;
                    err = async {
                        match error_rx {
                            Some(rx) => rx.recv().await,
                            None => None,
                        }
                    }, if watch_errors => Polled::Error(err),
                    token = token_rx.recv() => Polled::Token(token),
                }
            };

            match polled {
                Polled::Error(Some(err)) => {
                    warn!(error = %err, "session errored");
                    self.state = SessionState::Errored;
                    self.teardown();
                    return SessionEvent::Error(err);
                }
                // The producer is gone, but tokens may still be queued.
                Polled::Error(None) => self.errors_closed = true,
                Polled::Token(Some(token)) => return SessionEvent::Token(token),
                Polled::Token(None) => {
                    self.finish();
                    return SessionEvent::End;
                }
            }
        }
    }

    fn finish(&mut self) {
        let full = self.full_rx.as_mut().and_then(|rx| rx.try_recv().ok());
        match full {
            Some(text) => {
                debug!(chars = text.len(), "session completed");
                self.aggregated_text = text;
                self.state = SessionState::Completed;
            }
            None if self.cancel.is_cancelled() => {
                debug!("session canceled through its parent scope");
                self.state = SessionState::Canceled;
            }
            None => {
                // The producer died without a message (a panic whose report could not be sent).
                warn!("stream ended without a response");
                self.state = SessionState::Errored;
            }
        }
        self.teardown();
    }

    /// Stop the producer and discard anything it produced. No-op unless streaming.
    pub fn cancel(&mut self) {
        if self.state != SessionState::Streaming {
            return;
        }
        debug!("session canceled");
        self.state = SessionState::Canceled;
        self.aggregated_text.clear();
        self.teardown();
    }

    /// Signal the producer to stop and drop every receiver. Repeated calls do nothing.
    pub fn teardown(&mut self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        if let Some(mut rx) = self.token_rx.take() {
            rx.close();
        }
        if let Some(mut rx) = self.error_rx.take() {
            rx.close();
        }
        if let Some(mut rx) = self.full_rx.take() {
            rx.close();
        }
    }

    /// Wait until the producer task has exited.
    pub async fn join_producer(&mut self) {
        if let Some(handle) = self.producer.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "producer task failed");
            }
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn produce(
    generator: Arc<dyn Generator>,
    request: GenerationRequest,
    token_tx: mpsc::Sender<String>,
    error_tx: mpsc::Sender<StreamError>,
    full_tx: oneshot::Sender<String>,
    cancel: CancellationToken,
) {
    let outcome = AssertUnwindSafe(run_stream(generator, request, &token_tx, &cancel))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(Some(text))) => {
            if full_tx.send(text).is_err() {
                debug!("consumer left before the full response arrived");
            }
        }
        Ok(Ok(None)) => debug!("producer stopped by cancellation"),
        Ok(Err(err)) => {
            if error_tx.try_send(err).is_err() {
                debug!("error channel closed, dropping error");
            }
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            warn!(panic = %message, "producer panicked");
            if error_tx.try_send(StreamError::Panicked(message)).is_err() {
                debug!("error channel closed, dropping panic report");
            }
        }
    }

    // Closing the token channel last makes the terminal message visible before End.
    drop(error_tx);
    drop(token_tx);
}

/// `Ok(Some(text))` on completion, `Ok(None)` when cancelled or the consumer went away.
async fn run_stream(
    generator: Arc<dyn Generator>,
    request: GenerationRequest,
    token_tx: &mpsc::Sender<String>,
    cancel: &CancellationToken,
) -> Result<Option<String>, StreamError> {
    let mut stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(None),
        started = generator.stream(request) => started?,
    };

    let mut full = String::new();
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            item = stream.next() => item,
        };

        let token = match item {
            None => return Ok(Some(full)),
            Some(Err(err)) => return Err(err),
            Some(Ok(token)) => token,
        };

        if cancel.is_cancelled() {
            return Ok(None);
        }
        full.push_str(&token);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            sent = token_tx.send(token) => {
                if sent.is_err() {
                    return Ok(None);
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
