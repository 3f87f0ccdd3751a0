use anyhow::{Context, Result};
use async_nats::Client;
use tracing::info;

use super::store::{NatsDiagnostics, NatsInteractionStore};
use super::transport::NatsTransport;

/// Shared NATS connection handing out the live session collaborators
#[derive(Clone)]
pub struct NatsClient {
    client: Client,
}

impl NatsClient {
    /// Connect to NATS server
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);

        let client = async_nats::connect(url)
            .await
            .context("Failed to connect to NATS")?;

        info!("Connected to NATS successfully");

        Ok(Self { client })
    }

    /// Transport relaying live channels under `prefix`
    pub fn transport(&self, prefix: &str) -> NatsTransport {
        NatsTransport::new(self.client.clone(), prefix)
    }

    pub fn interaction_store(&self, subject: &str) -> NatsInteractionStore {
        NatsInteractionStore::new(self.client.clone(), subject)
    }

    pub fn diagnostics(&self, subject: &str) -> NatsDiagnostics {
        NatsDiagnostics::new(self.client.clone(), subject)
    }

    /// Flush pending publishes before shutdown
    pub async fn close(&self) -> Result<()> {
        info!("Closing NATS connection");
        self.client
            .flush()
            .await
            .context("Failed to flush NATS connection")?;
        Ok(())
    }
}
