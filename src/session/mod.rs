//! Live model session
//!
//! This module provides the `SessionClient` protocol state machine and the
//! seams it talks through:
//! - `Transport` for the bidirectional model stream
//! - `InteractionStore` for saving completed turns
//! - `DiagnosticsSink` for out-of-band error reports

mod client;
mod diagnostics;
mod messages;
mod persistence;
mod transport;
mod turn;

pub use client::{ClientConfig, ConnectionState, SessionClient, SessionEvent, TranscriptKind};
pub use diagnostics::{DiagnosticsSink, ErrorReport, TracingDiagnostics};
pub use messages::{
    CloseInfo, InlineData, LiveConfig, MediaChunk, ModelTurn, Part, RealtimeInput,
    SaveInteractionPayload, ServerContent, ServerMessage, Transcription, TransportError,
    UsageMetadata, ABNORMAL_CLOSURE, NORMAL_CLOSURE,
};
pub use persistence::InteractionStore;
pub use transport::{Transport, TransportEvent, TransportEvents, TransportHandle};
pub use turn::TurnState;
