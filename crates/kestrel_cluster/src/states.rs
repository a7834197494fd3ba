//! Classification of cluster-assigned partition states.
//!
//! The coordination layer hands this node raw state strings it does not
//! control; classification is therefore total — any unrecognized token is
//! simply non-serving with no role. Every function here is pure and safe
//! to call on unvalidated input.
//!
//! Matching normalizes to one uppercased form and resolves against the
//! fixed vocabulary in a single lookup; no multi-way case-insensitive
//! comparisons.

use std::fmt;

/// Semantic category of a recognized state token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateCategory {
    Online,
    Offline,
    Master,
    Slave,
    Leader,
    Follower,
}

/// The replication discipline a resource's assignment declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateModelKind {
    MasterSlave,
    LeaderFollower,
    /// Any state model without read/write replication semantics.
    Other,
}

/// Replication role bound to a store at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaRole {
    Leader,
    Follower,
    Offline,
}

impl ReplicaRole {
    /// Role implied by a raw state: any kind of leader binds Leader, any
    /// kind of follower binds Follower, everything else is Offline.
    pub fn from_state(raw_state: &str) -> Self {
        if is_any_leader(raw_state) {
            ReplicaRole::Leader
        } else if is_any_follower(raw_state) {
            ReplicaRole::Follower
        } else {
            ReplicaRole::Offline
        }
    }

    /// Compact role marker used in partition layout summaries: `:M` for
    /// leaders, `:S` for followers, empty otherwise.
    pub fn marker(&self) -> &'static str {
        match self {
            ReplicaRole::Leader => ":M",
            ReplicaRole::Follower => ":S",
            ReplicaRole::Offline => "",
        }
    }
}

impl fmt::Display for ReplicaRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicaRole::Leader => write!(f, "LEADER"),
            ReplicaRole::Follower => write!(f, "FOLLOWER"),
            ReplicaRole::Offline => write!(f, "OFFLINE"),
        }
    }
}

/// Classify a raw state token. Total: unknown tokens yield `None`.
pub fn classify(raw_state: &str) -> Option<StateCategory> {
    match raw_state.to_ascii_uppercase().as_str() {
        "ONLINE" => Some(StateCategory::Online),
        "OFFLINE" => Some(StateCategory::Offline),
        "MASTER" => Some(StateCategory::Master),
        "SLAVE" => Some(StateCategory::Slave),
        "LEADER" => Some(StateCategory::Leader),
        "FOLLOWER" => Some(StateCategory::Follower),
        _ => None,
    }
}

/// Whether a replica in this state may take traffic. Only ONLINE, MASTER,
/// LEADER, SLAVE, and FOLLOWER are serving; OFFLINE and unknown tokens
/// are not.
pub fn is_serving(raw_state: &str) -> bool {
    matches!(
        classify(raw_state),
        Some(
            StateCategory::Online
                | StateCategory::Master
                | StateCategory::Slave
                | StateCategory::Leader
                | StateCategory::Follower
        )
    )
}

/// Leader in either vocabulary: LEADER or MASTER.
pub fn is_any_leader(raw_state: &str) -> bool {
    matches!(
        classify(raw_state),
        Some(StateCategory::Leader | StateCategory::Master)
    )
}

/// Follower in either vocabulary: FOLLOWER or SLAVE.
pub fn is_any_follower(raw_state: &str) -> bool {
    matches!(
        classify(raw_state),
        Some(StateCategory::Follower | StateCategory::Slave)
    )
}

/// Display shorthand for layout dumps: `:S` for any follower, `:M` for
/// any leader, empty for everything else.
pub fn shorthand(raw_state: &str) -> &'static str {
    if is_any_follower(raw_state) {
        ":S"
    } else if is_any_leader(raw_state) {
        ":M"
    } else {
        ""
    }
}

/// Classify a raw state-model identifier.
pub fn state_model_kind(raw_kind: &str) -> StateModelKind {
    match raw_kind.to_ascii_uppercase().as_str() {
        "MASTERSLAVE" => StateModelKind::MasterSlave,
        "LEADERFOLLOWER" => StateModelKind::LeaderFollower,
        _ => StateModelKind::Other,
    }
}

/// Whether the state model implies read/write replication semantics.
pub fn is_read_write_state_model(raw_kind: &str) -> bool {
    !matches!(state_model_kind(raw_kind), StateModelKind::Other)
}
