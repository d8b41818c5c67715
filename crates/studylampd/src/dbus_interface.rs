use crate::monitor::{start_capture, MonitorError, MonitorHandle};
use std::sync::Arc;
use studylamp_core::{ModelLoader, SessionContext};
use studylamp_hw::{CameraSessionManager, CaptureConstraints};
use studylamp_net::{ChatError, ChatSession, HealthPoller};
use zbus::fdo;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "io.studylamp.Studylamp1";
pub const OBJECT_PATH: &str = "/io/studylamp/Studylamp1";

/// D-Bus interface for the studylamp daemon.
///
/// Bus name: io.studylamp.Studylamp1
/// Object path: /io/studylamp/Studylamp1
pub struct StudylampService {
    pub ctx: Arc<SessionContext>,
    pub loader: Arc<ModelLoader>,
    pub camera: Arc<CameraSessionManager>,
    pub monitor: MonitorHandle,
    pub health: Arc<HealthPoller>,
    pub chat: Arc<ChatSession>,
    pub constraints: CaptureConstraints,
}

fn monitor_error(e: MonitorError) -> fdo::Error {
    fdo::Error::Failed(e.to_string())
}

/// Backend failures come back as the same text that was written into the
/// thread. Only rejected sends are D-Bus errors.
fn chat_reply(result: Result<String, ChatError>) -> fdo::Result<String> {
    match result {
        Ok(reply) => Ok(reply),
        Err(e) if e.is_rejection() => Err(fdo::Error::Failed(e.to_string())),
        Err(e) => Ok(e.to_string()),
    }
}

/// A blank token means sign out.
fn credential(token: &str) -> Option<String> {
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

#[interface(name = "io.studylamp.Studylamp1")]
impl StudylampService {
    /// Return daemon status information as JSON.
    async fn status(&self) -> fdo::Result<String> {
        let monitor = self.monitor.snapshot().await.map_err(monitor_error)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "model": self.loader.status(),
            "camera": self.camera.state(),
            "presence": monitor.presence,
            "paused": monitor.paused,
            "monitor": monitor,
            "override": self.ctx.auto_pause_override(),
            "permission_denied": self.ctx.permission_denied(),
            "health": self.health.report(),
            "signed_in": self.chat.has_credential(),
        })
        .to_string())
    }

    /// Stop presence polling until resumed.
    async fn pause(&self) -> fdo::Result<()> {
        tracing::info!("pause requested");
        self.monitor.pause().await.map_err(monitor_error)
    }

    async fn resume(&self) -> fdo::Result<()> {
        tracing::info!("resume requested");
        self.monitor.resume().await.map_err(monitor_error)
    }

    /// Keep polling even while paused.
    async fn set_auto_pause_override(&self, enabled: bool) {
        tracing::info!(enabled, "auto-pause override changed");
        self.ctx.set_auto_pause_override(enabled);
    }

    /// Reload the model if needed and reopen the camera.
    ///
    /// Returns immediately; progress shows up in `Status`.
    async fn restart_camera(&self) {
        tracing::info!("camera restart requested");
        let loader = Arc::clone(&self.loader);
        let camera = Arc::clone(&self.camera);
        let constraints = self.constraints.clone();
        tokio::spawn(async move {
            let _ = start_capture(&loader, &camera, &constraints).await;
        });
    }

    /// Send a message to the assistant and return the reply text.
    async fn chat(&self, message: &str) -> fdo::Result<String> {
        chat_reply(self.chat.send(message).await)
    }

    /// The conversation so far, as JSON.
    async fn history(&self) -> fdo::Result<String> {
        serde_json::to_string(&self.chat.thread()).map_err(|e| fdo::Error::Failed(e.to_string()))
    }

    /// Set the bearer token for chat. An empty string signs out.
    async fn set_credential(&self, token: &str) {
        self.chat.set_credential(credential(token));
    }

    /// Run a health check now and return the result as JSON.
    async fn check_health(&self) -> fdo::Result<String> {
        let status = self.health.check_once().await;
        serde_json::to_string(&status).map_err(|e| fdo::Error::Failed(e.to_string()))
    }

    /// Emitted on every stable presence transition.
    #[zbus(signal)]
    pub async fn presence_changed(emitter: &SignalEmitter<'_>, present: bool) -> zbus::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use studylamp_net::{Backend, BackendError, ChatRequest, ChatResponse};

    struct EchoBackend;

    #[async_trait]
    impl Backend for EchoBackend {
        async fn health(&self) -> Result<serde_json::Value, BackendError> {
            Ok(serde_json::json!({ "status": "ok" }))
        }

        async fn chat(&self, request: &ChatRequest, _: &str) -> Result<ChatResponse, BackendError> {
            Ok(ChatResponse { response: format!("echo: {}", request.message) })
        }
    }

    fn failed_text(result: fdo::Result<String>) -> String {
        match result {
            Err(fdo::Error::Failed(text)) => text,
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn test_chat_reply_passes_reply_through() {
        assert_eq!(chat_reply(Ok("hello".into())).unwrap(), "hello");
    }

    #[test]
    fn test_chat_reply_rejections_are_dbus_errors() {
        assert_eq!(failed_text(chat_reply(Err(ChatError::Busy))), "a message is already being sent");
        assert_eq!(failed_text(chat_reply(Err(ChatError::EmptyMessage))), "message is empty");
    }

    #[test]
    fn test_chat_reply_backend_failures_are_reply_text() {
        for e in [
            ChatError::Unauthenticated,
            ChatError::RateLimited,
            ChatError::ServiceUnavailable,
            ChatError::Unknown("quota exceeded".into()),
        ] {
            let text = e.to_string();
            assert_eq!(chat_reply(Err(e)).unwrap(), text);
        }
    }

    #[test]
    fn test_credential_blank_signs_out() {
        assert_eq!(credential(""), None);
        assert_eq!(credential("   "), None);
        assert_eq!(credential(" tok "), Some("tok".to_string()));
    }

    #[tokio::test]
    async fn test_empty_credential_clears_session_token() {
        let chat = ChatSession::new(Arc::new(EchoBackend), "study");
        chat.set_credential(credential("tok"));
        assert!(chat.has_credential());
        assert_eq!(chat_reply(chat.send("hi").await).unwrap(), "echo: hi");

        chat.set_credential(credential(""));
        assert!(!chat.has_credential());
        assert_eq!(
            chat_reply(chat.send("hi").await).unwrap(),
            ChatError::Unauthenticated.to_string()
        );
    }
}
