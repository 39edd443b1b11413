//! Centralized store boundary.
//!
//! One logical store holds canonical entity versions, commit receipts,
//! quarantined records, model artifacts and predictions. Callers see it through
//! [`CentralStore`]; backends are the in-memory store and (behind the
//! `postgres` feature) a Postgres store.

use std::collections::HashMap;

use signalhub_core::{CanonicalEntity, EntityRef};

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod r#trait;

pub use in_memory::{CommitFault, InMemoryStore};
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
pub use r#trait::{
    ArtifactRegistry, BatchReceipt, CentralStore, CommitBatch, EntityStore, PredictionStore,
    QuarantinedRecord, SharedStore, Snapshot, StoreError,
};

/// Keep the last version per entity within one batch, in first-seen order.
///
/// Returns the surviving versions and how many were collapsed away.
pub(crate) fn collapse_batch(entities: Vec<CanonicalEntity>) -> (Vec<CanonicalEntity>, usize) {
    let mut order: Vec<EntityRef> = Vec::new();
    let mut latest: HashMap<EntityRef, CanonicalEntity> = HashMap::new();
    let mut collapsed = 0;
    for entity in entities {
        let key = entity.entity_ref();
        if latest.insert(key.clone(), entity).is_some() {
            collapsed += 1;
        } else {
            order.push(key);
        }
    }
    let survivors = order
        .into_iter()
        .filter_map(|key| latest.remove(&key))
        .collect();
    (survivors, collapsed)
}
