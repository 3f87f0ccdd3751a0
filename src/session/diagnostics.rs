//! Error reporting side channel
//!
//! Reports are fire-and-forget monitoring data, separate from the tracing
//! log and never part of the engine's correctness.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_response: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    pub timestamp: DateTime<Utc>,
}

impl ErrorReport {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_response: None,
            session_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_response(mut self, response: serde_json::Value) -> Self {
        self.error_response = Some(response);
        self
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }
}

pub trait DiagnosticsSink: Send + Sync {
    fn report_error(&self, report: ErrorReport);
}

/// Logs reports through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDiagnostics;

impl DiagnosticsSink for TracingDiagnostics {
    fn report_error(&self, report: ErrorReport) {
        let detail = report
            .error_response
            .as_ref()
            .map(|r| r.to_string())
            .unwrap_or_default();
        error!(
            session_id = report.session_id.as_deref().unwrap_or("-"),
            detail = %detail,
            "{}",
            report.message
        );
    }
}
