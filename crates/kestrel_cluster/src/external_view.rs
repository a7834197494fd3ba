//! Assignment snapshots from the coordination layer.
//!
//! A snapshot is the cluster-wide record of one resource: its state model,
//! its simple metadata fields, and the raw state every node holds for every
//! partition. Snapshots are produced and refreshed externally; this module
//! only reads them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use kestrel_common::ClusterError;

use crate::states::{self, ReplicaRole, StateModelKind};

/// Simple field carrying the resource's partition count.
pub const NUM_PARTITIONS_FIELD: &str = "NUM_PARTITIONS";

/// Cluster-wide assignment record for one resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssignmentSnapshot {
    /// Resource (shard set) this snapshot describes.
    pub resource: String,
    /// Raw state-model identifier, e.g. "MasterSlave" or "LeaderFollower".
    pub state_model_def: String,
    /// Simple metadata fields, including `NUM_PARTITIONS`.
    #[serde(default)]
    pub fields: HashMap<String, String>,
    /// partition name → node name → raw assigned state.
    #[serde(default)]
    pub partitions: HashMap<String, HashMap<String, String>>,
}

impl AssignmentSnapshot {
    pub fn new(resource: impl Into<String>, state_model_def: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            state_model_def: state_model_def.into(),
            fields: HashMap::new(),
            partitions: HashMap::new(),
        }
    }

    /// The resource's partition count. A missing or non-integer
    /// `NUM_PARTITIONS` field is a configuration error, never a default.
    pub fn num_partitions(&self) -> Result<u32, ClusterError> {
        let raw = self
            .fields
            .get(NUM_PARTITIONS_FIELD)
            .ok_or_else(|| ClusterError::MissingField(NUM_PARTITIONS_FIELD.into()))?;
        raw.parse().map_err(|_| ClusterError::MalformedField {
            field: NUM_PARTITIONS_FIELD.into(),
            value: raw.clone(),
        })
    }

    /// Replication discipline declared by the state model identifier.
    /// Never fails; unrecognized identifiers are `Other`.
    pub fn state_model_kind(&self) -> StateModelKind {
        states::state_model_kind(&self.state_model_def)
    }

    /// Whether the resource replicates with read/write semantics.
    pub fn is_read_write(&self) -> bool {
        states::is_read_write_state_model(&self.state_model_def)
    }

    /// Raw state a node holds for a partition, if any.
    pub fn partition_state(&self, partition: &str, node: &str) -> Option<&str> {
        self.partitions
            .get(partition)
            .and_then(|nodes| nodes.get(node))
            .map(String::as_str)
    }

    /// Role this node should bind for a partition. Absent or unrecognized
    /// assignments bind Offline.
    pub fn role_for(&self, partition: &str, node: &str) -> ReplicaRole {
        self.partition_state(partition, node)
            .map(ReplicaRole::from_state)
            .unwrap_or(ReplicaRole::Offline)
    }

    /// Nodes currently able to take traffic for a partition.
    pub fn serving_nodes(&self, partition: &str) -> Vec<&str> {
        let Some(nodes) = self.partitions.get(partition) else {
            return Vec::new();
        };
        let mut serving: Vec<&str> = nodes
            .iter()
            .filter(|(_, state)| states::is_serving(state))
            .map(|(node, _)| node.as_str())
            .collect();
        serving.sort_unstable();
        serving
    }

    /// One-line layout summary for a partition, e.g. `node1:M, node2:S`.
    pub fn describe_partition(&self, partition: &str) -> String {
        let Some(nodes) = self.partitions.get(partition) else {
            return String::new();
        };
        let mut entries: Vec<(&str, &str)> = nodes
            .iter()
            .map(|(node, state)| (node.as_str(), states::shorthand(state)))
            .collect();
        entries.sort_unstable();
        entries
            .iter()
            .map(|(node, mark)| format!("{node}{mark}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}
