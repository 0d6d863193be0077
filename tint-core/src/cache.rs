use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use anyhow::Result;
use tracing::info;

use crate::ModelRuntime;

/// Holds at most one resident [`ModelRuntime`], keyed by model identifier.
///
/// Lookups and switches happen under one lock, so concurrent jobs never
/// materialize the same model twice and never see a half-swapped entry.
/// Jobs already holding the previous runtime keep their `Arc` until done.
///
/// The resident identifier is tracked apart from the slot so it can be read
/// while a switch is still downloading.
#[derive(Default)]
pub struct ModelCache {
    slot: Mutex<Option<Arc<ModelRuntime>>>,
    resident: RwLock<Option<String>>,
}

impl ModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<ModelRuntime>>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_resident(&self, model_id: Option<&str>) {
        *self.resident.write().unwrap_or_else(PoisonError::into_inner) =
            model_id.map(str::to_string);
    }

    /// Identifier of the resident model, if any. Never waits on a switch.
    pub fn resident(&self) -> Option<String> {
        self.resident
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the runtime for `model_id`, evicting any other resident model
    /// and calling `materialize` to build the replacement.
    pub fn get_or_insert_with<F>(&self, model_id: &str, materialize: F) -> Result<Arc<ModelRuntime>>
    where
        F: FnOnce() -> Result<ModelRuntime>,
    {
        let mut slot = self.lock();
        if let Some(runtime) = slot.as_ref().filter(|rt| rt.model_id() == model_id) {
            return Ok(runtime.clone());
        }

        match slot.take() {
            Some(previous) => info!("Switching model {} -> {model_id}", previous.model_id()),
            None => info!("Initializing model {model_id}"),
        }
        self.set_resident(None);
        let runtime = Arc::new(materialize()?);
        *slot = Some(runtime.clone());
        self.set_resident(Some(model_id));
        Ok(runtime)
    }

    pub fn clear(&self) {
        let mut slot = self.lock();
        slot.take();
        self.set_resident(None);
    }
}
