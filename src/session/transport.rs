use tokio::sync::mpsc;

use super::messages::{CloseInfo, LiveConfig, RealtimeInput, TransportError};
use crate::Result;

/// Callback events delivered by a transport connection
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Open,
    /// Raw server message payload (JSON)
    Message(Vec<u8>),
    Error(TransportError),
    Close(CloseInfo),
}

pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// Bidirectional streaming connection to the speech model
///
/// Implementations:
/// - NATS relay to a model bridge (`nats::NatsTransport`)
/// - scripted fakes for tests
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection; callbacks for it are sent on `events`
    async fn connect(
        &self,
        model: &str,
        config: &LiveConfig,
        events: TransportEvents,
    ) -> Result<Box<dyn TransportHandle>>;
}

/// An open transport connection
pub trait TransportHandle: Send + Sync {
    /// Forward one realtime input without waiting for delivery
    fn send_realtime_input(&self, input: RealtimeInput) -> Result<()>;

    /// Begin closing; completion arrives as a `Close` event
    fn close(&self);
}
