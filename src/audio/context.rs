use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::playback::OutputContext;
use crate::Result;

/// Output contexts shared by id
///
/// Owned by the orchestration layer and passed by reference to whichever
/// component needs a shared output context.
#[derive(Default)]
pub struct ContextRegistry {
    contexts: Mutex<HashMap<String, Arc<dyn OutputContext>>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the context registered under `id`, creating it on first use
    pub fn get_or_create<F>(&self, id: &str, create: F) -> Result<Arc<dyn OutputContext>>
    where
        F: FnOnce() -> Result<Arc<dyn OutputContext>>,
    {
        let mut contexts = self.contexts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(context) = contexts.get(id) {
            return Ok(Arc::clone(context));
        }

        let context = create()?;
        contexts.insert(id.to_string(), Arc::clone(&context));
        debug!("Registered output context {}", id);

        Ok(context)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn OutputContext>> {
        self.contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<dyn OutputContext>> {
        self.contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
