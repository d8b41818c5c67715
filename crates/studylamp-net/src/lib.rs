//! studylamp-net — Clients for the study-assistant backend.
//!
//! A [`Backend`] abstracts the two HTTP endpoints; [`HealthPoller`] and
//! [`ChatSession`] sit on top of it.

pub mod backend;
pub mod chat;
pub mod health;

pub use backend::{Backend, BackendError, ChatRequest, ChatResponse, HttpBackend};
pub use chat::{ChatError, ChatMessage, ChatSession, ChatThread, Role};
pub use health::{HealthPoller, HealthReport, HealthStatus};
