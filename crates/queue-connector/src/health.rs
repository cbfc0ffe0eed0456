//! Connection health reporting.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Coarse health of the Redis connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Error,
}

/// Result of one health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    /// Ping round trip, absent when no ping completed.
    pub latency_ms: Option<u64>,
    pub last_check: DateTime<Utc>,
    pub message: Option<String>,
}

impl HealthReport {
    pub(crate) fn from_latency(latency: Duration, degraded: Duration, error: Duration) -> Self {
        let status = classify_latency(latency, degraded, error);
        let latency_ms = latency.as_millis() as u64;
        Self {
            status,
            latency_ms: Some(latency_ms),
            last_check: Utc::now(),
            message: match status {
                HealthStatus::Ok => None,
                _ => Some(format!("ping took {}ms", latency_ms)),
            },
        }
    }

    pub(crate) fn error(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Error,
            latency_ms: None,
            last_check: Utc::now(),
            message: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == HealthStatus::Ok
    }
}

/// Classify a ping round trip against the degraded and error thresholds.
pub fn classify_latency(latency: Duration, degraded: Duration, error: Duration) -> HealthStatus {
    if latency < degraded {
        HealthStatus::Ok
    } else if latency < error {
        HealthStatus::Degraded
    } else {
        HealthStatus::Error
    }
}
