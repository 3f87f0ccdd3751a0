use super::messages::SaveInteractionPayload;
use crate::Result;

/// Destination for completed turns
///
/// Best effort: failures are reported by the caller and never retried.
#[async_trait::async_trait]
pub trait InteractionStore: Send + Sync {
    async fn save_interaction(&self, payload: &SaveInteractionPayload) -> Result<()>;
}
