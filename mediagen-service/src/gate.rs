use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::MediaGenError;

/// Bounds the number of synchronous generations in flight in this process.
///
/// Callers over the limit wait for a permit rather than being rejected.
#[derive(Clone, Default)]
pub struct GenerationGate {
    permits: Option<Arc<Semaphore>>,
}

impl GenerationGate {
    /// `None` or `Some(0)` leaves the gate open.
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            permits: limit
                .filter(|limit| *limit > 0)
                .map(|limit| Arc::new(Semaphore::new(limit))),
        }
    }

    /// Waits for a slot; the slot is released when the returned permit drops.
    pub async fn acquire(&self) -> Result<Option<OwnedSemaphorePermit>, MediaGenError> {
        match &self.permits {
            Some(permits) => permits
                .clone()
                .acquire_owned()
                .await
                .map(Some)
                .map_err(|e| MediaGenError::InternalError {
                    message: format!("generation gate closed: {e}"),
                }),
            None => Ok(None),
        }
    }

    pub fn available(&self) -> Option<usize> {
        self.permits.as_ref().map(|permits| permits.available_permits())
    }
}
