//! Correlation of tunnel responses with the request that caused them.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::TunnelError;
use crate::protocol::ResponsePayload;

#[derive(Default)]
struct Table {
    slots: HashMap<String, oneshot::Sender<ResponsePayload>>,
    closed: bool,
}

/// Per-connection map from request id to a one-shot delivery slot.
#[derive(Default)]
pub struct PendingCalls {
    table: Mutex<Table>,
}

impl PendingCalls {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Registers `id` and returns the slot its response will be delivered to.
    ///
    /// The slot removes itself from the table when dropped.
    pub fn register(self: &Arc<Self>, id: impl Into<String>) -> Result<PendingSlot, TunnelError> {
        let id = id.into();
        let (tx, rx) = oneshot::channel();

        let mut table = self.lock();
        if table.closed {
            return Err(TunnelError::Disconnected);
        }
        if table.slots.contains_key(&id) {
            return Err(TunnelError::DuplicateId(id));
        }
        table.slots.insert(id.clone(), tx);
        drop(table);

        Ok(PendingSlot {
            id,
            rx,
            table: Arc::clone(self),
        })
    }

    /// Delivers `response` to the slot registered under its id.
    ///
    /// Returns false when no such id is pending (late or duplicate response).
    pub fn fulfill(&self, response: ResponsePayload) -> bool {
        let Some(tx) = self.lock().slots.remove(&response.id) else {
            debug!(request_id = %response.id, "Discarding response for unknown request");
            return false;
        };
        tx.send(response).is_ok()
    }

    /// Removes `id` without delivering anything.
    pub fn cancel(&self, id: &str) -> bool {
        self.lock().slots.remove(id).is_some()
    }

    /// Resolves every outstanding slot with a synthetic response and refuses
    /// further registrations.
    pub fn fail_all(&self, status_code: u16, message: &str) -> usize {
        let slots: Vec<_> = {
            let mut table = self.lock();
            table.closed = true;
            table.slots.drain().collect()
        };

        let count = slots.len();
        for (id, tx) in slots {
            let _ = tx.send(ResponsePayload::error(id, status_code, message));
        }
        count
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receiving end of a registered call.
pub struct PendingSlot {
    id: String,
    rx: oneshot::Receiver<ResponsePayload>,
    table: Arc<PendingCalls>,
}

impl PendingSlot {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Waits for the response. `None` means the table was dropped without
    /// delivering one.
    pub async fn recv(&mut self) -> Option<ResponsePayload> {
        (&mut self.rx).await.ok()
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.table.cancel(&self.id);
    }
}
