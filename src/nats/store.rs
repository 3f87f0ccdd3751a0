use async_nats::Client;
use tracing::{debug, warn};

use crate::session::{
    DiagnosticsSink, ErrorReport, InteractionStore, SaveInteractionPayload, TracingDiagnostics,
};
use crate::{Error, Result};

/// Saves completed turns by publishing them on an interactions subject
pub struct NatsInteractionStore {
    client: Client,
    subject: String,
}

impl NatsInteractionStore {
    pub fn new(client: Client, subject: impl Into<String>) -> Self {
        Self {
            client,
            subject: subject.into(),
        }
    }
}

#[async_trait::async_trait]
impl InteractionStore for NatsInteractionStore {
    async fn save_interaction(&self, payload: &SaveInteractionPayload) -> Result<()> {
        let bytes = serde_json::to_vec(payload)?;

        self.client
            .publish(self.subject.clone(), bytes.into())
            .await
            .map_err(|e| Error::Persistence(format!("publish to {}: {}", self.subject, e)))?;
        self.client
            .flush()
            .await
            .map_err(|e| Error::Persistence(format!("flush: {}", e)))?;

        debug!(
            "Saved interaction (session={}, user={} chars, assistant={} chars)",
            payload.session_id.as_deref().unwrap_or("-"),
            payload.user_message.len(),
            payload.assistant_message.len()
        );

        Ok(())
    }
}

/// Logs error reports and publishes them on a diagnostics subject
pub struct NatsDiagnostics {
    client: Client,
    subject: String,
}

impl NatsDiagnostics {
    pub fn new(client: Client, subject: impl Into<String>) -> Self {
        Self {
            client,
            subject: subject.into(),
        }
    }
}

impl DiagnosticsSink for NatsDiagnostics {
    fn report_error(&self, report: ErrorReport) {
        let payload = serde_json::to_vec(&report);
        TracingDiagnostics.report_error(report);

        let payload = match payload {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode error report: {}", e);
                return;
            }
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let client = self.client.clone();
        let subject = self.subject.clone();
        runtime.spawn(async move {
            if let Err(e) = client.publish(subject, payload.into()).await {
                warn!("Failed to publish error report: {}", e);
            }
        });
    }
}
