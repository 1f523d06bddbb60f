//! # Session driver
//!
//! The single consumer of streaming sessions. The UI loop calls [`SessionDriver::submit`] with a
//! question and then [`SessionDriver::next_event`] until it returns [`DriverEvent::Idle`],
//! rendering [`SessionDriver::conversation`] as it goes.
//!
//! When a session completes with a non-empty answer the driver spawns the archival task
//! ([`DedupService::store_if_new`]) and keeps its handle. The next call to `next_event` awaits the
//! handle and reports the outcome as [`DriverEvent::Archived`]. Archival failures are therefore
//! always visible to the caller.
//!
//! ```text
//! submit ─▶ Token* ─▶ Completed ─▶ Archived ─▶ Idle
//!                  └▶ Failed ─────────────────▶ Idle
//! cancel ──────────────────────────────────────▶ Idle
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::AskAiConfig;
use crate::dedup::{DedupService, StoreReport};
use crate::error::AskAiError;
use crate::generate::{GenerationRequest, Generator};
use crate::session::{SessionEvent, SessionState, StreamSession};

/// What the user currently sees.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    pub question: String,
    pub response: String,
    /// Last status line (archival outcome, cancellation).
    pub status: Option<String>,
}

#[derive(Debug)]
pub enum DriverEvent {
    Token(String),
    /// Full answer of the session that just ended.
    Completed(String),
    /// The session ended with an error; the message is already in the conversation.
    Failed(String),
    /// The session was stopped through the driver's cancellation scope.
    Canceled,
    Archived(StoreReport),
    /// Nothing pending.
    Idle,
}

pub struct SessionDriver {
    generator: Arc<dyn Generator>,
    dedup: Arc<DedupService>,
    config: AskAiConfig,
    root: CancellationToken,
    session: Option<StreamSession>,
    archival: Option<JoinHandle<StoreReport>>,
    ready: VecDeque<StoreReport>,
    conversation: Conversation,
}

impl SessionDriver {
    pub fn new(generator: Arc<dyn Generator>, dedup: Arc<DedupService>, config: AskAiConfig) -> Self {
        Self {
            generator,
            dedup,
            config,
            root: CancellationToken::new(),
            session: None,
            archival: None,
            ready: VecDeque::new(),
            conversation: Conversation::default(),
        }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn config(&self) -> &AskAiConfig {
        &self.config
    }

    /// Settings changed here apply from the next question on.
    pub fn config_mut(&mut self) -> &mut AskAiConfig {
        &mut self.config
    }

    /// Answer later questions with `generator`, e.g. after the API URL changed.
    pub fn set_generator(&mut self, generator: Arc<dyn Generator>) {
        self.generator = generator;
    }

    pub fn dedup(&self) -> &Arc<DedupService> {
        &self.dedup
    }

    /// Parent of every session's cancellation scope.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.root
    }

    /// [`SessionState::Idle`] when no session has been started yet.
    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map_or(SessionState::Idle, StreamSession::state)
    }

    /// Start a session for `question`.
    ///
    /// Any unfinished archival of the previous answer is awaited first so the archive keeps
    /// completion order; its report is queued for [`next_event`](Self::next_event).
    ///
    /// # Errors
    ///
    /// - [`AskAiError::EmptyQuestion`] for a blank question
    /// - [`AskAiError::SessionBusy`] while the current session is still streaming
    pub async fn submit(&mut self, question: &str) -> Result<(), AskAiError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(AskAiError::EmptyQuestion);
        }
        if self.state() == SessionState::Streaming {
            return Err(AskAiError::SessionBusy);
        }

        if let Some(report) = self.await_archival().await {
            self.ready.push_back(report);
        }
        if let Some(mut previous) = self.session.take() {
            previous.teardown();
        }

        let request = GenerationRequest {
            model: self.config.model_name.clone(),
            prompt: question.to_string(),
            temperature: self.config.temperature,
        };
        info!(model = %request.model, temperature = request.temperature, "submitting question");

        self.conversation = Conversation {
            question: question.to_string(),
            ..Default::default()
        };
        self.session = Some(StreamSession::start(
            self.generator.clone(),
            request,
            self.config.token_buffer,
            &self.root,
        ));
        Ok(())
    }

    /// Wait for the next thing worth rendering.
    pub async fn next_event(&mut self) -> DriverEvent {
        if let Some(report) = self.ready.pop_front() {
            return self.archived(report);
        }

        if let Some(session) = self.session.as_mut() {
            if session.state() == SessionState::Streaming {
                let event = session.next_event().await;
                return self.apply(event);
            }
        }

        // Awaited in place so a caller that drops this future keeps the handle.
        if let Some(handle) = self.archival.as_mut() {
            let joined = handle.await;
            self.archival = None;
            return match joined {
                Ok(report) => self.archived(report),
                Err(e) => {
                    error!(error = %e, "archival task failed");
                    let message = format!("archival task failed: {e}");
                    self.conversation.status = Some(message.clone());
                    DriverEvent::Failed(message)
                }
            };
        }

        DriverEvent::Idle
    }

    fn apply(&mut self, event: SessionEvent) -> DriverEvent {
        match event {
            SessionEvent::Token(token) => {
                self.conversation.response.push_str(&token);
                DriverEvent::Token(token)
            }
            SessionEvent::Error(err) => self.failed(err.to_string()),
            SessionEvent::End => {
                let Some(session) = self.session.as_ref() else {
                    return DriverEvent::Idle;
                };
                match session.state() {
                    SessionState::Completed => {
                        let text = session.aggregated_text().to_string();
                        self.conversation.response = text.clone();
                        if text.is_empty() {
                            debug!("empty answer, nothing to archive");
                        } else {
                            self.spawn_archival(text.clone());
                        }
                        DriverEvent::Completed(text)
                    }
                    SessionState::Canceled => {
                        self.conversation.response.clear();
                        self.conversation.status = Some("canceled".into());
                        DriverEvent::Canceled
                    }
                    _ => self.failed("stream ended without a response".into()),
                }
            }
        }
    }

    fn failed(&mut self, message: String) -> DriverEvent {
        self.conversation.response = format!("Error: {message}");
        DriverEvent::Failed(message)
    }

    fn archived(&mut self, report: StoreReport) -> DriverEvent {
        self.conversation.status = Some(report.summary());
        DriverEvent::Archived(report)
    }

    fn spawn_archival(&mut self, answer: String) {
        let dedup = self.dedup.clone();
        let question = self.conversation.question.clone();
        self.archival = Some(tokio::spawn(async move {
            dedup.store_if_new(&question, &answer).await
        }));
    }

    async fn await_archival(&mut self) -> Option<StoreReport> {
        let joined = self.archival.as_mut()?.await;
        self.archival = None;
        match joined {
            Ok(report) => Some(report),
            Err(e) => {
                error!(error = %e, "archival task failed");
                None
            }
        }
    }

    /// Cancel the streaming session, if any. The partial answer is dropped and nothing is
    /// archived.
    ///
    /// # Returns
    /// `true` if a session was streaming.
    pub fn cancel(&mut self) -> bool {
        match self.session.as_mut() {
            Some(session) if session.state() == SessionState::Streaming => {
                session.cancel();
                self.conversation.response.clear();
                self.conversation.status = Some("canceled".into());
                true
            }
            _ => false,
        }
    }

    /// Cancel everything and wait for outstanding archival.
    pub async fn shutdown(&mut self) -> Option<StoreReport> {
        self.cancel();
        self.root.cancel();
        if let Some(mut session) = self.session.take() {
            session.teardown();
            session.join_producer().await;
        }
        self.await_archival().await
    }
}
