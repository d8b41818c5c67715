//! Assistant chat session.
//!
//! A [`ChatSession`] keeps one append-only thread. Every accepted send adds
//! exactly one user message and one assistant message; failures are written
//! into the thread as assistant text rather than bubbling up as crashes.

use crate::backend::{Backend, BackendError, ChatRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, RwLock};
use studylamp_core::SingleFlight;
use thiserror::Error;
use uuid::Uuid;

const GENERIC_ERROR: &str = "Sorry, something went wrong. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub role: Role,
    pub text: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChatThread {
    messages: Vec<ChatMessage>,
}

impl ChatThread {
    fn push(&mut self, role: Role, text: impl Into<String>) {
        self.messages.push(ChatMessage {
            id: Uuid::new_v4(),
            role,
            text: text.into(),
            at: Utc::now(),
        });
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Why a send produced no assistant reply.
///
/// The display text of the first four variants is what lands in the thread.
/// `Busy` and `EmptyMessage` are rejections: nothing is appended.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("Please sign in to use the study assistant.")]
    Unauthenticated,
    #[error("You're sending messages too quickly. Please wait a moment and try again.")]
    RateLimited,
    #[error("The study assistant is temporarily unavailable. Please try again later.")]
    ServiceUnavailable,
    #[error("{0}")]
    Unknown(String),
    #[error("a message is already being sent")]
    Busy,
    #[error("message is empty")]
    EmptyMessage,
}

impl ChatError {
    /// True for errors that were rejected before anything was appended.
    pub fn is_rejection(&self) -> bool {
        matches!(self, ChatError::Busy | ChatError::EmptyMessage)
    }
}

impl From<BackendError> for ChatError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Status { status: 401, .. } => ChatError::Unauthenticated,
            BackendError::Status { status: 429, .. } => ChatError::RateLimited,
            BackendError::Status { status: 503, .. } => ChatError::ServiceUnavailable,
            BackendError::Status {
                message: Some(message),
                ..
            } => ChatError::Unknown(message),
            _ => ChatError::Unknown(GENERIC_ERROR.to_string()),
        }
    }
}

pub struct ChatSession {
    backend: Arc<dyn Backend>,
    context: String,
    credential: RwLock<Option<String>>,
    thread: Mutex<ChatThread>,
    in_flight: SingleFlight,
}

impl ChatSession {
    pub fn new(backend: Arc<dyn Backend>, context: impl Into<String>) -> Self {
        Self {
            backend,
            context: context.into(),
            credential: RwLock::new(None),
            thread: Mutex::new(ChatThread::default()),
            in_flight: SingleFlight::new(),
        }
    }

    /// Set or clear the bearer token used for chat requests.
    pub fn set_credential(&self, token: Option<String>) {
        let token = token.filter(|t| !t.trim().is_empty());
        tracing::info!(present = token.is_some(), "chat credential updated");
        *self.credential.write().unwrap_or_else(|p| p.into_inner()) = token;
    }

    pub fn has_credential(&self) -> bool {
        self.credential
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    /// True while a send is outstanding.
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_busy()
    }

    /// Send one user message and wait for the assistant's reply.
    pub async fn send(&self, text: &str) -> Result<String, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let Some(_permit) = self.in_flight.try_acquire() else {
            tracing::debug!("chat send rejected: request already in flight");
            return Err(ChatError::Busy);
        };

        let token = self
            .credential
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        let result = match token {
            None => Err(ChatError::Unauthenticated),
            Some(token) => {
                let request = ChatRequest {
                    message: text.to_string(),
                    context: self.context.clone(),
                };
                self.backend
                    .chat(&request, &token)
                    .await
                    .map(|r| r.response)
                    .map_err(|e| {
                        tracing::warn!(error = %e, "chat request failed");
                        ChatError::from(e)
                    })
            }
        };

        // Both messages land together, so a send dropped mid-flight leaves
        // the thread untouched.
        let reply = match &result {
            Ok(reply) => reply.clone(),
            Err(e) => e.to_string(),
        };
        let mut thread = self.thread.lock().unwrap_or_else(|p| p.into_inner());
        thread.push(Role::User, text);
        thread.push(Role::Assistant, reply);
        drop(thread);
        result
    }

    /// Snapshot of the conversation so far.
    pub fn thread(&self) -> ChatThread {
        self.thread.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ChatResponse;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct ScriptedBackend {
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
        reply: fn(&ChatRequest) -> Result<ChatResponse, BackendError>,
    }

    impl ScriptedBackend {
        fn new(reply: fn(&ChatRequest) -> Result<ChatResponse, BackendError>) -> Self {
            Self { calls: AtomicUsize::new(0), gate: None, reply }
        }
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        async fn health(&self) -> Result<serde_json::Value, BackendError> {
            Ok(serde_json::Value::Null)
        }

        async fn chat(&self, request: &ChatRequest, _: &str) -> Result<ChatResponse, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            (self.reply)(request)
        }
    }

    fn echo(req: &ChatRequest) -> Result<ChatResponse, BackendError> {
        Ok(ChatResponse { response: format!("re: {}", req.message) })
    }

    fn status(code: u16, message: Option<&str>) -> BackendError {
        BackendError::Status { status: code, message: message.map(str::to_string) }
    }

    #[tokio::test]
    async fn test_send_without_credential_makes_no_call() {
        let backend = Arc::new(ScriptedBackend::new(echo));
        let session = ChatSession::new(backend.clone(), "study");

        let result = session.send("explain recursion").await;

        assert_eq!(result, Err(ChatError::Unauthenticated));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        let thread = session.thread();
        let assistant: Vec<_> =
            thread.messages().iter().filter(|m| m.role == Role::Assistant).collect();
        assert_eq!(assistant.len(), 1);
        assert!(assistant[0].text.contains("sign in"));
        assert_eq!(thread.messages()[0].role, Role::User);
        assert_eq!(thread.messages()[0].text, "explain recursion");
    }

    #[tokio::test]
    async fn test_successful_send_appends_pair() {
        let session = ChatSession::new(Arc::new(ScriptedBackend::new(echo)), "study");
        session.set_credential(Some("tok".into()));

        assert_eq!(session.send("  hello ").await.as_deref(), Ok("re: hello"));
        let thread = session.thread();
        assert_eq!(thread.len(), 2);
        assert_eq!(thread.messages()[1].role, Role::Assistant);
        assert_eq!(thread.messages()[1].text, "re: hello");
    }

    #[tokio::test]
    async fn test_status_codes_map_to_errors_in_thread() {
        let cases: [(fn(&ChatRequest) -> Result<ChatResponse, BackendError>, ChatError); 5] = [
            (|_| Err(status(401, None)), ChatError::Unauthenticated),
            (|_| Err(status(429, Some("slow down"))), ChatError::RateLimited),
            (|_| Err(status(503, None)), ChatError::ServiceUnavailable),
            (|_| Err(status(500, Some("model overloaded"))), ChatError::Unknown("model overloaded".into())),
            (|_| Err(status(502, None)), ChatError::Unknown(GENERIC_ERROR.into())),
        ];

        for (reply, expected) in cases {
            let session = ChatSession::new(Arc::new(ScriptedBackend::new(reply)), "study");
            session.set_credential(Some("tok".into()));
            assert_eq!(session.send("q").await, Err(expected.clone()));
            let thread = session.thread();
            assert_eq!(thread.len(), 2);
            assert_eq!(thread.messages()[1].role, Role::Assistant);
            assert_eq!(thread.messages()[1].text, expected.to_string());
        }
    }

    #[tokio::test]
    async fn test_transport_failure_is_generic_unknown() {
        let session = ChatSession::new(
            Arc::new(ScriptedBackend::new(|_| Err(BackendError::Timeout))),
            "study",
        );
        session.set_credential(Some("tok".into()));
        assert_eq!(session.send("q").await, Err(ChatError::Unknown(GENERIC_ERROR.into())));
    }

    #[tokio::test]
    async fn test_concurrent_send_is_rejected() {
        let gate = Arc::new(Notify::new());
        let backend = Arc::new(ScriptedBackend {
            calls: AtomicUsize::new(0),
            gate: Some(Arc::clone(&gate)),
            reply: echo,
        });
        let session = Arc::new(ChatSession::new(backend.clone(), "study"));
        session.set_credential(Some("tok".into()));

        let first = tokio::spawn({
            let s = Arc::clone(&session);
            async move { s.send("first").await }
        });
        while backend.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(session.is_busy());

        assert_eq!(session.send("second").await, Err(ChatError::Busy));

        gate.notify_one();
        assert_eq!(first.await.unwrap().as_deref(), Ok("re: first"));
        assert!(!session.is_busy());

        let thread = session.thread();
        let texts: Vec<_> = thread.messages().iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "re: first"]);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_send_leaves_thread_untouched() {
        let backend = Arc::new(ScriptedBackend {
            calls: AtomicUsize::new(0),
            gate: Some(Arc::new(Notify::new())),
            reply: echo,
        });
        let session = Arc::new(ChatSession::new(backend.clone(), "study"));
        session.set_credential(Some("tok".into()));

        let pending = tokio::spawn({
            let s = Arc::clone(&session);
            async move { s.send("never answered").await }
        });
        while backend.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        pending.abort();
        assert!(pending.await.unwrap_err().is_cancelled());

        assert!(session.thread().is_empty());
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn test_empty_message_rejected_without_append() {
        let session = ChatSession::new(Arc::new(ScriptedBackend::new(echo)), "study");
        assert_eq!(session.send("   ").await, Err(ChatError::EmptyMessage));
        assert!(session.thread().is_empty());
        assert!(ChatError::EmptyMessage.is_rejection());
    }

    #[test]
    fn test_blank_credential_clears() {
        let session = ChatSession::new(Arc::new(ScriptedBackend::new(echo)), "study");
        session.set_credential(Some("tok".into()));
        assert!(session.has_credential());
        session.set_credential(Some("  ".into()));
        assert!(!session.has_credential());
    }
}
