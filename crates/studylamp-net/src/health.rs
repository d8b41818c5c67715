//! Backend health polling.
//!
//! [`HealthPoller::check_once`] never fails: any error or timeout is reported
//! as [`HealthStatus::Unhealthy`]. [`HealthPoller::run`] repeats the check on
//! a fixed interval until cancelled.

use crate::backend::Backend;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(3000);
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum HealthStatus {
    Checking,
    Healthy { payload: serde_json::Value },
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy { .. })
    }
}

/// Last published status and when it was determined.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checked_at: Option<DateTime<Utc>>,
}

pub struct HealthPoller {
    backend: Arc<dyn Backend>,
    timeout: Duration,
    interval: Duration,
    report: watch::Sender<HealthReport>,
}

impl HealthPoller {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let (report, _) = watch::channel(HealthReport {
            status: HealthStatus::Checking,
            checked_at: None,
        });
        Self {
            backend,
            timeout: DEFAULT_TIMEOUT,
            interval: DEFAULT_INTERVAL,
            report,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Probe the backend once and publish the result.
    pub async fn check_once(&self) -> HealthStatus {
        let status = match tokio::time::timeout(self.timeout, self.backend.health()).await {
            Ok(Ok(payload)) => HealthStatus::Healthy { payload },
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "health check failed");
                HealthStatus::Unhealthy
            }
            Err(_) => {
                tracing::debug!(timeout_ms = self.timeout.as_millis() as u64, "health check timed out");
                HealthStatus::Unhealthy
            }
        };

        let previous = self.report.send_replace(HealthReport {
            status: status.clone(),
            checked_at: Some(Utc::now()),
        });
        if previous.status.is_healthy() != status.is_healthy() {
            tracing::info!(healthy = status.is_healthy(), "backend health changed");
        }
        status
    }

    /// Check immediately, then every interval, until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(interval_secs = self.interval.as_secs(), "health poller started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.check_once() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        tracing::info!("health poller stopped");
    }

    pub fn report(&self) -> HealthReport {
        self.report.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthReport> {
        self.report.subscribe()
    }
}
