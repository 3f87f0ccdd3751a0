pub mod client;
pub mod messages;
pub mod store;
pub mod transport;

pub use client::NatsClient;
pub use messages::{CloseMessage, LiveSubjects, SetupMessage};
pub use store::{NatsDiagnostics, NatsInteractionStore};
pub use transport::NatsTransport;
