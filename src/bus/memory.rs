//! In-process implementation of the message bus.

use log::{debug, error};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

use crate::bus::{BatchHandler, BusEvent, MessageBus};
use crate::error::{EngineError, Result};

/// Delivers each batch synchronously to registered handlers, then to any
/// broadcast observers.
///
/// Observers that fall behind receive `RecvError::Lagged`; handlers never
/// miss a batch because they run inside `publish_batch`.
pub struct InMemoryBus {
    handlers: RwLock<Vec<Arc<dyn BatchHandler>>>,
    tx: broadcast::Sender<Arc<Vec<BusEvent>>>,
}

impl InMemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            handlers: RwLock::new(Vec::new()),
            tx,
        }
    }

    /// Observe every published batch.
    pub fn watch(&self) -> broadcast::Receiver<Arc<Vec<BusEvent>>> {
        self.tx.subscribe()
    }
}

impl MessageBus for InMemoryBus {
    fn publish_batch(&self, events: Vec<BusEvent>) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let handlers = self
            .handlers
            .read()
            .map_err(|_| EngineError::Internal("bus handler list poisoned".into()))?
            .clone();

        let mut failures = Vec::new();
        for handler in handlers {
            if let Err(e) = handler.handle_batch(&events) {
                error!("Bus handler {} failed on a batch of {} events: {}", handler.name(), events.len(), e);
                failures.push(format!("{}: {}", handler.name(), e));
            }
        }

        debug!("Published batch of {} events", events.len());
        // no observers is fine
        let _ = self.tx.send(Arc::new(events));

        if failures.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Internal(format!("batch handlers failed: {}", failures.join("; "))))
        }
    }

    fn subscribe_batch(&self, handler: Arc<dyn BatchHandler>) {
        match self.handlers.write() {
            Ok(mut handlers) => handlers.push(handler),
            Err(poisoned) => poisoned.into_inner().push(handler),
        }
    }
}
