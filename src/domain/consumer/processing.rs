//! In-flight envelope tracking

use std::sync::Arc;

use dashmap::DashSet;
use uuid::Uuid;

/// Ids of envelopes a consumer is currently handling.
///
/// An id enters before the envelope is buffered and leaves exactly once,
/// when its `InFlight` guard drops.
#[derive(Debug, Clone, Default)]
pub struct ProcessingQueue {
    ids: Arc<DashSet<Uuid>>,
}

impl ProcessingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `id` in flight, or `None` if it already is
    pub fn try_begin(&self, id: Uuid) -> Option<InFlight> {
        if self.ids.insert(id) {
            Some(InFlight {
                id,
                ids: self.ids.clone(),
            })
        } else {
            None
        }
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Removes its id from the `ProcessingQueue` on drop
#[derive(Debug)]
pub struct InFlight {
    id: Uuid,
    ids: Arc<DashSet<Uuid>>,
}

impl InFlight {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.ids.remove(&self.id);
    }
}
