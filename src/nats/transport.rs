//! Live session transport relayed over NATS
//!
//! Each connection gets its own channel id. The model bridge receives the
//! setup envelope, then realtime inputs in send order, then a close marker,
//! and publishes raw server messages back on the channel's server subject.

use std::sync::atomic::{AtomicBool, Ordering};

use async_nats::{Client, Subscriber};
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::messages::{CloseMessage, LiveSubjects, SetupMessage};
use crate::session::{
    CloseInfo, LiveConfig, RealtimeInput, Transport, TransportError, TransportEvent,
    TransportEvents, TransportHandle, NORMAL_CLOSURE,
};
use crate::{Error, Result};

pub struct NatsTransport {
    client: Client,
    prefix: String,
}

impl NatsTransport {
    pub fn new(client: Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }
}

#[async_trait::async_trait]
impl Transport for NatsTransport {
    async fn connect(
        &self,
        model: &str,
        config: &LiveConfig,
        events: TransportEvents,
    ) -> Result<Box<dyn TransportHandle>> {
        let channel = Uuid::new_v4().simple().to_string();
        let subjects = LiveSubjects::new(&self.prefix, &channel);

        // Subscribe before setup so no early server message is missed
        let subscriber = self
            .client
            .subscribe(subjects.server.clone())
            .await
            .map_err(|e| Error::Transport(format!("subscribe to {}: {}", subjects.server, e)))?;

        let setup = SetupMessage {
            channel: channel.clone(),
            model: model.to_string(),
            config: config.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let payload = serde_json::to_vec(&setup)?;

        self.client
            .publish(subjects.setup.clone(), payload.into())
            .await
            .map_err(|e| Error::Transport(format!("publish setup: {}", e)))?;
        self.client
            .flush()
            .await
            .map_err(|e| Error::Transport(format!("flush setup: {}", e)))?;

        info!("Opened live channel {} on {}", channel, subjects.setup);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();

        tokio::spawn(run_writer(
            self.client.clone(),
            channel.clone(),
            subjects.clone(),
            outbound_rx,
            stop_tx,
            events.clone(),
        ));
        tokio::spawn(run_reader(subscriber, stop_rx, events));

        Ok(Box::new(NatsTransportHandle {
            outbound: outbound_tx,
            closed: AtomicBool::new(false),
        }))
    }
}

enum Outbound {
    Input(RealtimeInput),
    Close,
}

struct NatsTransportHandle {
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: AtomicBool,
}

impl TransportHandle for NatsTransportHandle {
    fn send_realtime_input(&self, input: RealtimeInput) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Transport("channel is closing".to_string()));
        }
        self.outbound
            .send(Outbound::Input(input))
            .map_err(|_| Error::Transport("channel writer stopped".to_string()))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.outbound.send(Outbound::Close);
        }
    }
}

/// Publish inputs in order; the close marker goes out after every queued input
async fn run_writer(
    client: Client,
    channel: String,
    subjects: LiveSubjects,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    stop_reader: oneshot::Sender<()>,
    events: TransportEvents,
) {
    while let Some(message) = outbound.recv().await {
        match message {
            Outbound::Input(input) => {
                let payload = match serde_json::to_vec(&input) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Failed to encode realtime input: {}", e);
                        continue;
                    }
                };

                if let Err(e) = client.publish(subjects.input.clone(), payload.into()).await {
                    let _ = events.send(TransportEvent::Error(TransportError {
                        message: format!("publish input: {}", e),
                        location: Some(subjects.input.clone()),
                    }));
                    return;
                }
            }
            Outbound::Close => {
                let marker = CloseMessage {
                    channel: channel.clone(),
                    code: NORMAL_CLOSURE,
                    reason: "Client closed".to_string(),
                    timestamp: chrono::Utc::now().to_rfc3339(),
                };

                match serde_json::to_vec(&marker) {
                    Ok(payload) => {
                        if let Err(e) = client.publish(subjects.close.clone(), payload.into()).await {
                            warn!("Failed to publish close marker: {}", e);
                        }
                        if let Err(e) = client.flush().await {
                            warn!("Failed to flush close marker: {}", e);
                        }
                    }
                    Err(e) => warn!("Failed to encode close marker: {}", e),
                }

                let _ = stop_reader.send(());
                debug!("Writer for channel {} finished", channel);
                return;
            }
        }
    }

    debug!("Handle for channel {} dropped", channel);
}

async fn run_reader(
    mut subscriber: Subscriber,
    mut stop: oneshot::Receiver<()>,
    events: TransportEvents,
) {
    // Open goes out ahead of every server message
    let _ = events.send(TransportEvent::Open);

    let close = loop {
        tokio::select! {
            stopped = &mut stop => {
                break match stopped {
                    Ok(()) => CloseInfo::normal("Client closed"),
                    Err(_) => CloseInfo::abnormal("Input stream ended"),
                };
            }
            message = subscriber.next() => match message {
                Some(message) => {
                    let _ = events.send(TransportEvent::Message(message.payload.to_vec()));
                }
                None => break CloseInfo::abnormal("Server stream ended"),
            }
        }
    };

    if let Err(e) = subscriber.unsubscribe().await {
        debug!("Unsubscribe failed: {}", e);
    }

    info!("Live channel closed (code {}, reason: {})", close.code, close.reason);
    let _ = events.send(TransportEvent::Close(close));
}
