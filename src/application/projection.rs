use crate::domain::event::EventRecord;
use crate::domain::lease::{AggregateState, LeaseId};
use crate::domain::state_machine;
use crate::error::Result;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

/// Folded state of one stream plus the command ids that produced it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Projection {
    pub state: AggregateState,
    pub command_ids: HashSet<String>,
}

impl Projection {
    /// Folds `tail` onto this projection. `tail` must start right after
    /// `state.version`.
    pub fn advance(self, tail: &[EventRecord]) -> Result<Self> {
        let mut command_ids = self.command_ids;
        command_ids.extend(tail.iter().map(|e| e.origin_command_id.clone()));
        Ok(Self {
            state: state_machine::fold(self.state, tail)?,
            command_ids,
        })
    }

    pub fn version(&self) -> u64 {
        self.state.version
    }
}

/// Cache of folded projections keyed by lease.
///
/// Never authoritative: readers compare the cached version with the store's
/// current sequence and fold whatever is missing. Entries only move forward
/// and are evicted once their lease completes or defaults.
#[derive(Debug, Default)]
pub struct ProjectionCache {
    entries: RwLock<HashMap<LeaseId, Projection>>,
}

impl ProjectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, lease_id: LeaseId) -> Option<Projection> {
        self.entries.read().await.get(&lease_id).cloned()
    }

    /// Stores `projection` unless the cache already holds a newer one. A
    /// terminal lease takes no more commands, so its entry is dropped.
    pub async fn put(&self, lease_id: LeaseId, projection: Projection) {
        let mut entries = self.entries.write().await;
        if projection.state.status().is_some_and(|s| s.is_terminal()) {
            entries.remove(&lease_id);
            return;
        }
        let stale = entries
            .get(&lease_id)
            .is_some_and(|cached| cached.version() >= projection.version());
        if !stale {
            entries.insert(lease_id, projection);
        }
    }

    pub async fn invalidate(&self, lease_id: LeaseId) {
        self.entries.write().await.remove(&lease_id);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
