use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::diagnostics::{DiagnosticsSink, ErrorReport};
use super::messages::{
    CloseInfo, LiveConfig, MediaChunk, RealtimeInput, SaveInteractionPayload, ServerMessage,
    TransportError, UsageMetadata,
};
use super::persistence::InteractionStore;
use super::transport::{Transport, TransportEvent, TransportHandle};
use super::turn::TurnState;
use crate::audio::codec;

/// Connection lifecycle of a [`SessionClient`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Which side of the conversation a transcript delta belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptKind {
    Input,
    Output,
}

/// Events published by the session client
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Open,
    Close(CloseInfo),
    Error(TransportError),
    SetupComplete,
    Interrupted,
    TurnComplete,
    Transcript { kind: TranscriptKind, text: String },
    Usage(UsageMetadata),
    /// Raw PCM16 model audio
    Audio(Arc<[u8]>),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upper bound on waiting for a close acknowledgment
    pub disconnect_timeout: Duration,
    /// Capacity of the event channel
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            disconnect_timeout: Duration::from_millis(500),
            event_capacity: 256,
        }
    }
}

/// Per-connection state guarded by one lock
#[derive(Default)]
struct Slot {
    /// Incremented on every connect and close; events from older epochs are dropped
    epoch: u64,
    handle: Option<Arc<dyn TransportHandle>>,
    session_id: Option<String>,
    model: Option<String>,
    live_config: Option<LiveConfig>,
    /// The first flushed turn drops its user transcript (session setup residue)
    is_first_turn: bool,
    turn: TurnState,
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    store: Arc<dyn InteractionStore>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    config: ClientConfig,
    status: watch::Sender<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
    slot: Mutex<Slot>,
    /// Feeds the persistence worker, started on the first save
    saves: Mutex<Option<mpsc::UnboundedSender<SaveInteractionPayload>>>,
}

/// Streaming session with the speech model
///
/// Tracks connection state, demultiplexes server messages into typed events,
/// accumulates the current turn and saves it at every turn boundary.
#[derive(Clone)]
pub struct SessionClient {
    inner: Arc<ClientInner>,
}

impl SessionClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn InteractionStore>,
        diagnostics: Arc<dyn DiagnosticsSink>,
        config: ClientConfig,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            inner: Arc::new(ClientInner {
                transport,
                store,
                diagnostics,
                config,
                status,
                events,
                slot: Mutex::new(Slot::default()),
                saves: Mutex::new(None),
            }),
        }
    }

    pub fn status(&self) -> ConnectionState {
        *self.inner.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionState> {
        self.inner.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.slot().session_id.clone()
    }

    pub fn model(&self) -> Option<String> {
        self.inner.slot().model.clone()
    }

    pub fn config(&self) -> Option<LiveConfig> {
        self.inner.slot().live_config.clone()
    }

    /// Snapshot of the in-progress turn
    pub fn current_turn(&self) -> TurnState {
        self.inner.slot().turn.clone()
    }

    /// Open a session
    ///
    /// Returns `false` without changing state unless currently disconnected,
    /// and `false` when the transport fails to open.
    pub async fn connect(&self, model: &str, config: LiveConfig) -> bool {
        let inner = &self.inner;
        let claimed = inner.status.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            debug!("connect ignored, status is {}", self.status());
            return false;
        }

        // Reset per-connection state under a new epoch
        let session_id = Uuid::new_v4().to_string();
        let epoch = {
            let mut slot = inner.slot();
            slot.epoch += 1;
            slot.handle = None;
            slot.session_id = Some(session_id.clone());
            slot.model = Some(model.to_string());
            slot.live_config = Some(config.clone());
            slot.is_first_turn = true;
            slot.turn = TurnState::default();
            slot.epoch
        };

        info!("Connecting session {} (model: {})", session_id, model);

        // Spawn event pump, then open the transport
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_transport_events(Arc::downgrade(inner), epoch, rx));

        let handle: Arc<dyn TransportHandle> =
            match inner.transport.connect(model, &config, tx).await {
                Ok(handle) => Arc::from(handle),
                Err(e) => {
                    error!("Failed to connect session {}: {}", session_id, e);
                    inner.diagnostics.report_error(
                        ErrorReport::new("Error connecting to live session")
                            .with_response(json!({ "message": e.to_string() }))
                            .with_session(Some(session_id)),
                    );

                    // A newer connect may own the status by now
                    let current = {
                        let mut slot = inner.slot();
                        let current = slot.epoch == epoch;
                        if current {
                            slot.epoch += 1;
                        }
                        current
                    };
                    if current {
                        inner.status.send_replace(ConnectionState::Disconnected);
                    }
                    return false;
                }
            };

        // Install the handle unless this attempt went stale
        {
            let mut slot = inner.slot();
            if slot.epoch != epoch {
                // Closed or disconnected while the transport was opening
                drop(slot);
                handle.close();
                return false;
            }
            slot.handle = Some(handle);
        }

        // Connected requires an installed handle
        inner.status.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Connected;
                true
            } else {
                false
            }
        });

        info!("Session {} connected", session_id);
        true
    }

    /// Close the session
    ///
    /// Returns `false` immediately when already disconnected or disconnecting.
    /// Otherwise saves any in-progress turn, closes the transport and waits for
    /// the close acknowledgment, forcing `Disconnected` after the timeout.
    pub async fn disconnect(&self) -> bool {
        let inner = &self.inner;
        let claimed = inner.status.send_if_modified(|state| match state {
            ConnectionState::Connected | ConnectionState::Connecting => {
                *state = ConnectionState::Disconnecting;
                true
            }
            _ => false,
        });
        if !claimed {
            return false;
        }

        let mut status_rx = inner.status.subscribe();

        // Flush the in-progress turn
        let (epoch, handle, pending) = {
            let mut slot = inner.slot();
            let pending = if slot.turn.has_transcript() {
                take_turn(&mut slot, false)
            } else {
                slot.turn = TurnState::default();
                None
            };
            (slot.epoch, slot.handle.clone(), pending)
        };

        if let Some(payload) = pending {
            inner.persist(payload);
        }

        let Some(handle) = handle else {
            // Nothing open yet; a pending connect result will be discarded
            {
                let mut slot = inner.slot();
                if slot.epoch == epoch {
                    slot.epoch += 1;
                }
            }
            inner.status.send_replace(ConnectionState::Disconnected);
            return true;
        };

        info!("Disconnecting session");
        handle.close();

        // Wait for the close acknowledgment
        let closed = status_rx.wait_for(|state| *state == ConnectionState::Disconnected);
        if tokio::time::timeout(inner.config.disconnect_timeout, closed)
            .await
            .is_err()
        {
            warn!("No close acknowledgment, forcing disconnect");
            inner.on_close(epoch, CloseInfo::abnormal("Disconnect timeout"), true);
        }

        true
    }

    /// Forward base64 media chunks to the open session
    ///
    /// While not connected the chunks are dropped and the attempt is reported.
    pub fn send_realtime_input(&self, chunks: &[MediaChunk]) {
        let inner = &self.inner;
        let status = self.status();
        if status != ConnectionState::Connected {
            inner.diagnostics.report_error(ErrorReport::new(format!(
                "SessionClient.send_realtime_input: not connected, status is {}. Skipping send.",
                status
            )));
            return;
        }

        let Some(handle) = inner.slot().handle.clone() else {
            inner.diagnostics.report_error(ErrorReport::new(format!(
                "SessionClient.send_realtime_input: transport not ready, dropping {} chunks.",
                chunks.len()
            )));
            return;
        };

        for chunk in chunks {
            if let Err(e) = handle.send_realtime_input(RealtimeInput::Media(chunk.clone())) {
                warn!("Failed to send realtime input: {}", e);
            }
        }
    }

    /// Send a text turn; ignored while not connected
    pub fn send_text(&self, text: &str) {
        if self.status() != ConnectionState::Connected {
            return;
        }

        let handle = self.inner.slot().handle.clone();
        if let Some(handle) = handle {
            if let Err(e) = handle.send_realtime_input(RealtimeInput::Text(text.to_string())) {
                warn!("Failed to send text input: {}", e);
            }
        }
    }
}

async fn pump_transport_events(
    inner: Weak<ClientInner>,
    epoch: u64,
    mut rx: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };

        match event {
            TransportEvent::Open => inner.on_open(epoch),
            TransportEvent::Message(payload) => inner.on_message(epoch, &payload),
            TransportEvent::Error(e) => inner.on_error(epoch, e),
            TransportEvent::Close(info) => inner.on_close(epoch, info, true),
        }
    }
}

/// Take the current turn and build its payload, resetting the turn
fn take_turn(slot: &mut Slot, apply_first_turn: bool) -> Option<SaveInteractionPayload> {
    let turn = slot.turn.take();
    let discard_user = apply_first_turn && std::mem::replace(&mut slot.is_first_turn, false);
    SaveInteractionPayload::from_turn(
        turn,
        discard_user,
        slot.session_id.clone(),
        slot.live_config.as_ref(),
    )
}

impl ClientInner {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Transports may report open before `connect` hands back the handle;
    /// the status then moves to `Connected` when the handle is installed.
    fn on_open(&self, epoch: u64) {
        let ready = {
            let slot = self.slot();
            if slot.epoch != epoch {
                return;
            }
            slot.handle.is_some()
        };

        self.status.send_if_modified(|state| {
            if !ready {
                return false;
            }
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Connected;
                true
            } else {
                false
            }
        });
        self.emit(SessionEvent::Open);
    }

    fn on_error(&self, epoch: u64, err: TransportError) {
        let (session_id, handle) = {
            let slot = self.slot();
            if slot.epoch != epoch {
                return;
            }
            (slot.session_id.clone(), slot.handle.clone())
        };

        error!("Transport error: {}", err.message);
        self.diagnostics.report_error(
            ErrorReport::new("SessionClient transport error")
                .with_response(json!({ "message": err.message, "location": err.location }))
                .with_session(session_id),
        );
        self.emit(SessionEvent::Error(err.clone()));

        if let Some(handle) = handle {
            handle.close();
        }
        self.on_close(epoch, CloseInfo::abnormal(err.message), false);
    }

    fn on_close(&self, epoch: u64, info: CloseInfo, report: bool) {
        let session_id = {
            let mut slot = self.slot();
            if slot.epoch != epoch {
                return;
            }
            slot.epoch += 1;
            slot.handle = None;
            slot.session_id.clone()
        };

        if !info.is_normal() && report {
            warn!(
                "Connection closed unexpectedly (code {}, reason: {})",
                info.code, info.reason
            );
            self.diagnostics.report_error(
                ErrorReport::new("SessionClient: connection closed unexpectedly")
                    .with_response(json!({
                        "reason": info.reason,
                        "code": info.code,
                        "wasClean": info.was_clean,
                    }))
                    .with_session(session_id),
            );
        }

        self.status.send_replace(ConnectionState::Disconnected);
        info!("Session closed (code {})", info.code);
        self.emit(SessionEvent::Close(info));
    }

    fn on_message(&self, epoch: u64, payload: &[u8]) {
        let message: ServerMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Skipping malformed server message: {}", e);
                return;
            }
        };

        // Update the turn under the lock, emit after releasing it
        let mut events = Vec::new();
        let mut flushed = None;
        {
            let mut slot = self.slot();
            if slot.epoch != epoch {
                return;
            }

            if let Some(usage) = &message.usage_metadata {
                slot.turn.usage = Some(usage.clone());
                events.push(SessionEvent::Usage(usage.clone()));
            }

            if message.setup_complete.is_some() {
                events.push(SessionEvent::SetupComplete);
            } else if let Some(content) = &message.server_content {
                if let Some(text) = content.input_transcription.as_ref().and_then(|t| t.delta()) {
                    slot.turn.append_input(text);
                    events.push(SessionEvent::Transcript {
                        kind: TranscriptKind::Input,
                        text: text.to_string(),
                    });
                }

                if let Some(text) = content.output_transcription.as_ref().and_then(|t| t.delta()) {
                    if slot.turn.append_output(text) {
                        events.push(SessionEvent::Transcript {
                            kind: TranscriptKind::Output,
                            text: text.to_string(),
                        });
                    }
                }

                // Interruption ends the turn and skips the rest of the message
                if content.is_interrupted() {
                    slot.turn.is_interrupted = true;
                    flushed = Some(take_turn(&mut slot, true));
                    events.push(SessionEvent::Interrupted);
                } else {
                    if content.is_turn_complete() {
                        flushed = Some(take_turn(&mut slot, true));
                        events.push(SessionEvent::TurnComplete);
                    }

                    for data in content.audio_payloads() {
                        match codec::from_base64(data) {
                            Ok(bytes) => events.push(SessionEvent::Audio(bytes.into())),
                            Err(e) => warn!("Skipping undecodable audio part: {}", e),
                        }
                    }
                }
            } else if message.usage_metadata.is_none() {
                debug!("Received unmatched message: {:?}", message);
            }
        }

        // Save the flushed turn
        if let Some(Some(payload)) = flushed {
            self.persist(payload);
        }

        for event in events {
            self.emit(event);
        }
    }

    /// Queue a flushed turn for saving; turns are saved one at a time in order
    fn persist(&self, payload: SaveInteractionPayload) {
        let mut saves = self.saves.lock().unwrap_or_else(|e| e.into_inner());
        let tx = saves.get_or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_persistence(
                Arc::clone(&self.store),
                Arc::clone(&self.diagnostics),
                rx,
            ));
            tx
        });

        if let Err(e) = tx.send(payload) {
            error!("Persistence worker stopped, turn not saved");
            self.diagnostics.report_error(
                ErrorReport::new("Failed to save interaction")
                    .with_response(json!({ "message": "persistence worker stopped" }))
                    .with_session(e.0.session_id),
            );
        }
    }
}

/// Save queued turns in arrival order until the client is dropped
async fn run_persistence(
    store: Arc<dyn InteractionStore>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    mut saves: mpsc::UnboundedReceiver<SaveInteractionPayload>,
) {
    while let Some(payload) = saves.recv().await {
        if let Err(e) = store.save_interaction(&payload).await {
            error!("Failed to save interaction: {}", e);
            diagnostics.report_error(
                ErrorReport::new("Failed to save interaction")
                    .with_response(json!({ "message": e.to_string() }))
                    .with_session(payload.session_id.clone()),
            );
        }
    }

    debug!("Persistence worker finished");
}
