//! The info objects exported to the web layer
//!
//! These are snapshots: the web layer renders them without holding any
//! scheduler locks.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::resources::Resource;

/// The capacity numbers for a single queue
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCapacities {
    /// The guaranteed capacity for this queue
    pub capacity: Resource,
    /// The maximum capacity for this queue
    pub max_capacity: Resource,
    /// The currently used capacity for this queue
    pub used_capacity: Resource,
    /// The used share of the maximum as per dimension percentages
    pub abs_used_capacity: Resource,
}

/// A snapshot of one queue and its children
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueInfo {
    /// The name of this queue
    pub queue_name: String,
    /// The current lifecycle state of this queue
    pub status: String,
    /// The capacity numbers for this queue
    pub capacities: QueueCapacities,
    /// The snapshots for the children of this queue
    pub child_queues: Vec<QueueInfo>,
}

/// Per resource type histograms of node usage
///
/// Each resource name maps to ten buckets where bucket N counts the nodes
/// with an allocated share in the range N*10% to (N+1)*10%.
pub type NodeUsageMap = HashMap<String, Vec<u64>>;
