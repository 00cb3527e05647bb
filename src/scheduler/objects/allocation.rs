//! The record of a committed placement
//!
//! An allocation is created by the allocation cycle or replayed by a
//! resource manager during node recovery and stays immutable once it is in
//! the partition map.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::models::Resource;
use super::application::AllocationAsk;

/// How an allocation attempt resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationResult {
    /// The ask was placed on a node directly
    Allocated,
    /// A reservation was promoted into a real placement
    AllocatedReserved,
    /// The ask was reserved on a node until capacity frees up
    Reserved,
    /// A reservation was cancelled
    Unreserved,
}

/// Why an allocation was released back to the resource manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    /// The owning application released the allocation
    ReleasedByApp,
    /// The node holding the allocation was removed
    ReleasedByNodeRemoval,
    /// The allocation was preempted
    Preempted,
}

/// A committed placement of an ask onto a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    /// The unique id for this allocation
    pub uuid: Uuid,
    /// The key of the ask this allocation satisfies
    pub allocation_key: String,
    /// The application this allocation belongs to
    pub application_id: String,
    /// The full path of the queue this allocation is accounted under
    pub queue_path: String,
    /// The node this allocation landed on
    pub node_id: String,
    /// The node the promoted reservation was held on, if different
    pub reserved_node_id: Option<String>,
    /// The resources this allocation consumes
    pub resource: Resource,
    /// How this allocation resolved
    pub result: AllocationResult,
    /// The ask this allocation was cut from
    pub ask: AllocationAsk,
    /// When this allocation was created
    pub created: DateTime<Utc>,
}

impl Allocation {
    /// Create a new allocation from an ask and a target node
    ///
    /// The uuid is freshly generated: an allocation a resource manager
    /// reports during recovery must come through
    /// [`Allocation::from_recovery`] so the uuid it is already tracked
    /// under stays in force.
    ///
    /// # Arguments
    ///
    /// * `ask` - The ask this allocation satisfies
    /// * `queue_path` - The queue path to account this allocation under
    /// * `node_id` - The node this allocation lands on
    /// * `result` - How this allocation resolved
    #[must_use]
    pub fn new<T: Into<String>>(
        ask: &AllocationAsk,
        queue_path: T,
        node_id: T,
        result: AllocationResult,
    ) -> Self {
        Allocation {
            uuid: Uuid::new_v4(),
            allocation_key: ask.allocation_key.clone(),
            application_id: ask.application_id.clone(),
            queue_path: queue_path.into(),
            node_id: node_id.into(),
            reserved_node_id: None,
            resource: ask.resource.clone(),
            result,
            ask: ask.clone(),
            created: Utc::now(),
        }
    }

    /// Rebuild an allocation a resource manager reported during recovery
    ///
    /// The resource manager already tracks the allocation under its own
    /// uuid, generating a fresh one here would lose that link on every
    /// restart.
    ///
    /// # Arguments
    ///
    /// * `uuid` - The uuid the resource manager tracks the allocation under
    /// * `ask` - The ask the allocation was cut from
    /// * `queue_path` - The queue path to account the allocation under
    /// * `node_id` - The node the allocation runs on
    #[must_use]
    pub fn from_recovery<T: Into<String>>(
        uuid: Uuid,
        ask: &AllocationAsk,
        queue_path: T,
        node_id: T,
    ) -> Self {
        Allocation {
            uuid,
            ..Allocation::new(ask, queue_path, node_id, AllocationResult::Allocated)
        }
    }

    /// Link this allocation to the node its reservation was held on
    ///
    /// # Arguments
    ///
    /// * `node_id` - The node the reservation was held on
    #[must_use]
    pub fn promoted_from<T: Into<String>>(mut self, node_id: T) -> Self {
        self.reserved_node_id = Some(node_id.into());
        self
    }
}

impl fmt::Display for Allocation {
    /// Cleanly print the identifying parts of an allocation
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}:{} on {}",
            self.application_id, self.allocation_key, self.uuid, self.node_id
        )
    }
}
