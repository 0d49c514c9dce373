//! Active-query registry.
//!
//! Maps the id of every unsettled query to the token that cancels it. Entries
//! are inserted when a handle is created and removed exactly once, either by
//! an explicit [`ActiveQueryRegistry::cancel`] or by the [`Registration`]
//! guard owned by the query task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::QueryId;

#[derive(Debug, Clone, Default)]
pub struct ActiveQueryRegistry {
    entries: Arc<Mutex<HashMap<QueryId, CancellationToken>>>,
}

impl ActiveQueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<QueryId, CancellationToken>> {
        // Entries stay consistent even if a holder panicked.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a fresh query and returns its id together with the guard
    /// that removes it. Ids colliding with an active entry are regenerated.
    pub(crate) fn register(&self, token: CancellationToken) -> (QueryId, Registration) {
        let mut entries = self.entries();
        let mut id = QueryId::generate();
        while entries.contains_key(&id) {
            id = QueryId::generate();
        }
        entries.insert(id.clone(), token);
        debug!(query_id = %id, active = entries.len(), "Registered query");

        let registration = Registration {
            registry: self.clone(),
            id: id.clone(),
        };
        (id, registration)
    }

    /// Removes an entry. Returns false if it was already gone.
    pub fn remove(&self, id: &QueryId) -> bool {
        self.entries().remove(id).is_some()
    }

    /// Cancels the query and removes its entry.
    ///
    /// Returns false when no query with that id is active, which includes
    /// queries that already settled.
    pub fn cancel(&self, id: &QueryId) -> bool {
        let token = self.entries().remove(id);
        match token {
            Some(token) => {
                token.cancel();
                debug!(query_id = %id, "Cancelled query");
                true
            }
            None => false,
        }
    }

    /// Cancels every active query, returning how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<(QueryId, CancellationToken)> = self.entries().drain().collect();
        for (_, token) in &drained {
            token.cancel();
        }
        drained.len()
    }

    pub fn contains(&self, id: &QueryId) -> bool {
        self.entries().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of the active queries, in no particular order.
    pub fn ids(&self) -> Vec<QueryId> {
        self.entries().keys().cloned().collect()
    }
}

/// Removes its query from the registry when dropped.
///
/// Held by the query task, so the entry disappears on success, failure,
/// cancellation and panic alike.
#[derive(Debug)]
pub struct Registration {
    registry: ActiveQueryRegistry,
    id: QueryId,
}

impl Registration {
    pub fn id(&self) -> &QueryId {
        &self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.registry.remove(&self.id) {
            debug!(query_id = %self.id, "Released query");
        }
    }
}
