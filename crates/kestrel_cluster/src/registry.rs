//! Per-node partition registry.
//!
//! Tracks every partition this node hosts: one [`ReplicatedStore`] per
//! partition name, opened under a common root directory. Partition
//! creation and removal follow the coordination layer's assignments;
//! ordering across partitions is its problem, not ours — stores here are
//! fully independent.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use kestrel_common::{ClusterError, KestrelError};
use kestrel_storage::engine::EngineOptions;

use crate::states::ReplicaRole;
use crate::store::ReplicatedStore;

/// Concurrent map of partition name → open store.
pub struct PartitionRegistry {
    root: PathBuf,
    partitions: DashMap<String, Arc<ReplicatedStore>>,
}

impl PartitionRegistry {
    /// Registry rooted at `root`; each partition opens at `root/<name>`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            partitions: DashMap::new(),
        }
    }

    /// Open a partition's store and register it. Fails if the name is
    /// already registered.
    pub fn open_partition(
        &self,
        name: &str,
        role: ReplicaRole,
        options: EngineOptions,
    ) -> Result<Arc<ReplicatedStore>, KestrelError> {
        if self.partitions.contains_key(name) {
            return Err(ClusterError::PartitionExists(name.to_string()).into());
        }
        let store = Arc::new(ReplicatedStore::open(
            self.root.join(name),
            role,
            options,
        )?);
        match self.partitions.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                // Lost a race to a concurrent open of the same name; the
                // freshly opened store is dropped (and closed) here.
                Err(ClusterError::PartitionExists(name.to_string()).into())
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(store.clone());
                tracing::info!(partition = name, %role, "registered partition");
                Ok(store)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ReplicatedStore>> {
        self.partitions.get(name).map(|entry| entry.value().clone())
    }

    /// Close and forget a partition, e.g. when the coordination layer
    /// drops it from this node.
    pub fn remove(&self, name: &str) -> Result<(), KestrelError> {
        let (_, store) = self
            .partitions
            .remove(name)
            .ok_or_else(|| ClusterError::UnknownPartition(name.to_string()))?;
        store.close()?;
        tracing::info!(partition = name, "removed partition");
        Ok(())
    }

    pub fn partition_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .partitions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// One-line layout summary of this node's partitions, with role
    /// markers: `events_0:M, events_1:S, events_2`.
    pub fn describe(&self) -> String {
        self.partition_names()
            .into_iter()
            .map(|name| {
                let marker = self
                    .get(&name)
                    .map(|s| s.role().marker())
                    .unwrap_or_default();
                format!("{name}{marker}")
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}
