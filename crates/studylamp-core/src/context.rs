//! Cross-component session flags.
//!
//! One [`SessionContext`] is shared (via `Arc`) between the camera session
//! manager, the presence monitor and the D-Bus surface.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct SessionContext {
    permission_denied: AtomicBool,
    auto_pause_override: AtomicBool,
    changed: Notify,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the capture device refused access on the last attempt.
    pub fn permission_denied(&self) -> bool {
        self.permission_denied.load(Ordering::Acquire)
    }

    pub fn set_permission_denied(&self, denied: bool) {
        if self.permission_denied.swap(denied, Ordering::AcqRel) != denied {
            self.changed.notify_waiters();
        }
    }

    /// When set, presence polling continues even while externally paused.
    pub fn auto_pause_override(&self) -> bool {
        self.auto_pause_override.load(Ordering::Acquire)
    }

    pub fn set_auto_pause_override(&self, enabled: bool) {
        if self.auto_pause_override.swap(enabled, Ordering::AcqRel) != enabled {
            tracing::debug!(enabled, "auto-pause override changed");
            self.changed.notify_waiters();
        }
    }

    /// Resolves the next time any flag changes value.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }

    /// Change notification as a future the caller can `enable` before
    /// checking the flags, so no flip is missed between check and wait.
    pub fn notified(&self) -> Notified<'_> {
        self.changed.notified()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_flags_default_off() {
        let ctx = SessionContext::new();
        assert!(!ctx.permission_denied());
        assert!(!ctx.auto_pause_override());
    }

    #[tokio::test]
    async fn test_changed_wakes_on_flag_flip() {
        let ctx = Arc::new(SessionContext::new());
        let waiter = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { ctx.changed().await })
        };
        tokio::task::yield_now().await;
        ctx.set_auto_pause_override(true);
        let woke = tokio::time::timeout(Duration::from_secs(1), waiter).await;
        assert!(woke.is_ok());
        assert!(ctx.auto_pause_override());
    }

    #[tokio::test]
    async fn test_enabled_listener_sees_flip_before_first_poll() {
        let ctx = SessionContext::new();
        let changed = ctx.notified();
        tokio::pin!(changed);
        changed.as_mut().enable();

        // Flip lands after registration but before anyone awaits.
        ctx.set_auto_pause_override(true);

        let woke = tokio::time::timeout(Duration::from_secs(1), changed).await;
        assert!(woke.is_ok());
    }
}
