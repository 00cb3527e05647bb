//! Nodes and their capacity books
//!
//! A node tracks its total capacity, the resources consumed outside the
//! scheduler (system daemons), the allocations placed on it and the
//! reservation slots held against it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{event, Level};
use uuid::Uuid;

use crate::models::Resource;
use crate::Error;
use super::allocation::Allocation;
use super::application::AllocationAsk;

/// A reservation slot held on a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReservation {
    /// The application holding the slot
    pub application_id: String,
    /// The ask the slot is held for
    pub allocation_key: String,
    /// The resources the slot will need
    pub resource: Resource,
}

/// The lockable capacity books of a node
#[derive(Debug, Default)]
struct NodeBook {
    /// The total capacity of this node
    capacity: Resource,
    /// The resources consumed outside the schedulers books
    occupied: Resource,
    /// The resources consumed by allocations on this node
    allocated: Resource,
    /// The resources still open for allocation
    available: Resource,
    /// The allocations on this node by uuid
    allocations: HashMap<Uuid, Allocation>,
    /// The reservation slots held on this node
    reservations: HashMap<String, NodeReservation>,
    /// Whether this node accepts new allocations
    schedulable: bool,
    /// Whether this node finished its own startup
    ready: bool,
}

/// A node registered with a partition
#[derive(Debug)]
pub struct Node {
    /// The id of this node
    node_id: String,
    /// The capacity books for this node
    book: RwLock<NodeBook>,
}

/// Build the key for a reservation slot
///
/// # Arguments
///
/// * `application_id` - The application holding the slot
/// * `allocation_key` - The ask the slot is held for
fn slot_key(application_id: &str, allocation_key: &str) -> String {
    format!("{application_id}|{allocation_key}")
}

impl Node {
    /// Create a new node
    ///
    /// # Arguments
    ///
    /// * `node_id` - The id of this node
    /// * `capacity` - The total capacity of this node
    /// * `occupied` - The resources consumed outside the schedulers books
    #[must_use]
    pub fn new<T: Into<String>>(node_id: T, capacity: Resource, occupied: Resource) -> Self {
        let available = capacity.sub_floor(&occupied);
        Node {
            node_id: node_id.into(),
            book: RwLock::new(NodeBook {
                capacity,
                occupied,
                available,
                schedulable: true,
                ready: true,
                ..NodeBook::default()
            }),
        }
    }

    /// Get the id of this node
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Get the total capacity of this node
    #[must_use]
    pub fn capacity(&self) -> Resource {
        self.book.read().unwrap().capacity.clone()
    }

    /// Get the resources still open for allocation
    #[must_use]
    pub fn available(&self) -> Resource {
        self.book.read().unwrap().available.clone()
    }

    /// Get the resources consumed by allocations on this node
    #[must_use]
    pub fn allocated_resource(&self) -> Resource {
        self.book.read().unwrap().allocated.clone()
    }

    /// Update the resources consumed outside the schedulers books
    ///
    /// # Arguments
    ///
    /// * `occupied` - The new outside consumption
    pub fn set_occupied(&self, occupied: Resource) {
        let mut book = self.book.write().unwrap();
        book.occupied = occupied;
        book.available = book.capacity.sub_floor(&book.occupied).sub_floor(&book.allocated);
    }

    /// Check if this node accepts new allocations
    #[must_use]
    pub fn is_schedulable(&self) -> bool {
        self.book.read().unwrap().schedulable
    }

    /// Set whether this node accepts new allocations
    ///
    /// # Arguments
    ///
    /// * `schedulable` - Whether to accept new allocations
    pub fn set_schedulable(&self, schedulable: bool) {
        self.book.write().unwrap().schedulable = schedulable;
    }

    /// Check if this node finished its own startup
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.book.read().unwrap().ready
    }

    /// Set whether this node finished its own startup
    ///
    /// # Arguments
    ///
    /// * `ready` - Whether startup completed
    pub fn set_ready(&self, ready: bool) {
        self.book.write().unwrap().ready = ready;
    }

    /// Check if an ask fits on this node right now
    ///
    /// # Arguments
    ///
    /// * `resource` - The resources the ask needs
    #[must_use]
    pub fn can_allocate(&self, resource: &Resource) -> bool {
        let book = self.book.read().unwrap();
        book.schedulable && book.available.enough(resource)
    }

    /// Add an allocation to this node
    ///
    /// Adding an allocation that is already on the node is a noop. The add
    /// fails when the node no longer has the resources open.
    ///
    /// # Arguments
    ///
    /// * `alloc` - The allocation to add
    pub fn add_allocation(&self, alloc: Allocation) -> Result<(), Error> {
        let mut book = self.book.write().unwrap();
        // guard against an allocation being replayed twice
        if book.allocations.contains_key(&alloc.uuid) {
            event!(
                Level::WARN,
                node = self.node_id,
                uuid = %alloc.uuid,
                msg = "allocation already placed on node"
            );
            return Ok(());
        }
        if !book.available.enough(&alloc.resource) {
            return Err(Error::Capacity(format!(
                "allocation {} does not fit on node {}",
                alloc, self.node_id
            )));
        }
        book.available = book.available.sub_floor(&alloc.resource);
        book.allocated.add_to(&alloc.resource);
        book.allocations.insert(alloc.uuid, alloc);
        Ok(())
    }

    /// Remove an allocation from this node
    ///
    /// # Arguments
    ///
    /// * `uuid` - The allocation to remove
    pub fn remove_allocation(&self, uuid: &Uuid) -> Option<Allocation> {
        let mut book = self.book.write().unwrap();
        let removed = book.allocations.remove(uuid);
        if let Some(alloc) = &removed {
            book.available.add_to(&alloc.resource);
            book.allocated = book.allocated.sub_floor(&alloc.resource);
        }
        removed
    }

    /// Get a snapshot of the allocations on this node
    #[must_use]
    pub fn allocations(&self) -> Vec<Allocation> {
        self.book.read().unwrap().allocations.values().cloned().collect()
    }

    /// Get the number of allocations on this node
    #[must_use]
    pub fn allocation_count(&self) -> usize {
        self.book.read().unwrap().allocations.len()
    }

    /// Hold a reservation slot on this node
    ///
    /// A slot can be held once: reserving a held slot fails.
    ///
    /// # Arguments
    ///
    /// * `application_id` - The application holding the slot
    /// * `ask` - The ask the slot is held for
    pub fn reserve(&self, application_id: &str, ask: &AllocationAsk) -> Result<(), Error> {
        let mut book = self.book.write().unwrap();
        let key = slot_key(application_id, &ask.allocation_key);
        if book.reservations.contains_key(&key) {
            return Err(Error::Validation(format!(
                "reservation slot {key} on node {} is already held",
                self.node_id
            )));
        }
        book.reservations.insert(
            key,
            NodeReservation {
                application_id: application_id.to_owned(),
                allocation_key: ask.allocation_key.clone(),
                resource: ask.resource.clone(),
            },
        );
        Ok(())
    }

    /// Release a reservation slot on this node
    ///
    /// Releasing a slot that is not held is a noop. Returns the number of
    /// slots actually released.
    ///
    /// # Arguments
    ///
    /// * `application_id` - The application holding the slot
    /// * `allocation_key` - The ask the slot was held for
    pub fn unreserve(&self, application_id: &str, allocation_key: &str) -> usize {
        let mut book = self.book.write().unwrap();
        let key = slot_key(application_id, allocation_key);
        usize::from(book.reservations.remove(&key).is_some())
    }

    /// Drop every reservation slot during node removal
    ///
    /// Returns how many slots each application lost so the partition can
    /// credit its counters back.
    pub fn unreserve_apps(&self) -> Vec<(String, usize)> {
        let mut book = self.book.write().unwrap();
        let mut counts: HashMap<String, usize> = HashMap::default();
        for reservation in book.reservations.values() {
            *counts.entry(reservation.application_id.clone()).or_insert(0) += 1;
        }
        book.reservations.clear();
        counts.into_iter().collect()
    }

    /// Check if any reservation slot is held on this node
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        !self.book.read().unwrap().reservations.is_empty()
    }

    /// Get a snapshot of the reservation slots on this node
    #[must_use]
    pub fn reservations(&self) -> Vec<NodeReservation> {
        self.book.read().unwrap().reservations.values().cloned().collect()
    }

    /// The share of this nodes dominant dimension that is consumed
    ///
    /// Used to order nodes for the sort policies.
    #[must_use]
    pub fn dominant_utilization(&self) -> f64 {
        let book = self.book.read().unwrap();
        let mut dominant = 0.0_f64;
        for (name, total) in book.capacity.iter() {
            if *total > 0 {
                let share = book.allocated.get(name) as f64 / *total as f64;
                dominant = dominant.max(share);
            }
        }
        dominant
    }
}
