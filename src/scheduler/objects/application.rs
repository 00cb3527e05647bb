//! Applications and their books of pending asks
//!
//! An application owns three books: pending asks keyed by allocation key,
//! live allocations keyed by uuid, and reservations keyed by node. All
//! three are kept under one lock. Queue updates are always made after the
//! application lock is released so lock ordering stays queue before
//! application.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use tracing::{event, Level};
use uuid::Uuid;

use crate::models::{Resource, UserGroup};
use crate::Error;
use super::allocation::Allocation;
use super::node::Node;
use super::queue::Queue;

/// A unit of resource demand from an application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationAsk {
    /// The key identifying this ask within its application
    pub allocation_key: String,
    /// The application this ask belongs to
    pub application_id: String,
    /// The resources one repeat of this ask needs
    pub resource: Resource,
    /// How many repeats of this ask are still pending
    pub max_allocations: u64,
    /// The priority of this ask, higher first
    pub priority: i32,
    /// Whether this ask is a placeholder that must not be reserved
    pub placeholder: bool,
    /// When this ask was created
    pub created: DateTime<Utc>,
}

impl AllocationAsk {
    /// Create a new ask
    ///
    /// # Arguments
    ///
    /// * `allocation_key` - The key identifying this ask
    /// * `application_id` - The application this ask belongs to
    /// * `resource` - The resources one repeat needs
    /// * `max_allocations` - How many repeats are requested
    #[must_use]
    pub fn new<T: Into<String>>(
        allocation_key: T,
        application_id: T,
        resource: Resource,
        max_allocations: u64,
    ) -> Self {
        AllocationAsk {
            allocation_key: allocation_key.into(),
            application_id: application_id.into(),
            resource,
            max_allocations,
            priority: 0,
            placeholder: false,
            created: Utc::now(),
        }
    }

    /// Set the priority for this ask
    ///
    /// # Arguments
    ///
    /// * `priority` - The priority to set, higher schedules first
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Mark this ask as a placeholder
    #[must_use]
    pub fn placeholder(mut self) -> Self {
        self.placeholder = true;
        self
    }

    /// The total resources still pending for this ask
    #[must_use]
    pub fn pending_resource(&self) -> Resource {
        self.resource.times(self.max_allocations)
    }
}

/// The lifecycle states of an application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplicationState {
    /// The application was created but not linked to a queue yet
    New,
    /// The application was linked to a queue
    Accepted,
    /// The application received its first allocation
    Starting,
    /// The application is running with allocations
    Running,
    /// The application is winding down its allocations
    Completing,
    /// The application finished and released everything
    Completed,
    /// The application failed
    Failed,
    /// The application was rejected before it was accepted
    Rejected,
    /// The application was killed by the resource manager
    Killed,
}

/// A reservation held by an application on a node
#[derive(Debug, Clone)]
pub struct Reservation {
    /// The node the reservation is held on
    pub node: Arc<Node>,
    /// The ask the reservation is held for
    pub ask: AllocationAsk,
}

/// The lockable state of an application
#[derive(Debug, Default)]
struct AppBook {
    /// The queue path this application is or will be assigned to
    queue_name: String,
    /// The queue this application is assigned to once placed
    ///
    /// Held weakly: the queue owns the application, not the other way
    /// around.
    queue: Option<Weak<Queue>>,
    /// The pending asks by allocation key
    asks: HashMap<String, AllocationAsk>,
    /// The live allocations by uuid
    allocations: HashMap<Uuid, Allocation>,
    /// The reservations held by this application by node id
    reservations: HashMap<String, Reservation>,
    /// The total resources of the live allocations
    allocated: Resource,
    /// The total resources of the pending asks
    pending: Resource,
}

/// An application submitted to a partition
#[derive(Debug)]
pub struct Application {
    /// The id of this application
    pub application_id: String,
    /// The partition this application was submitted to
    pub partition: String,
    /// The user that submitted this application
    user: UserGroup,
    /// Free form labels the submitter attached
    tags: HashMap<String, String>,
    /// When this application was submitted
    submitted: DateTime<Utc>,
    /// The lifecycle state of this application
    state: RwLock<ApplicationState>,
    /// The ask, allocation and reservation books
    book: RwLock<AppBook>,
}

impl Application {
    /// Create a new application
    ///
    /// # Arguments
    ///
    /// * `application_id` - The id of this application
    /// * `partition` - The partition this application was submitted to
    /// * `queue_name` - The queue the submitter asked for
    /// * `user` - The user that submitted this application
    /// * `tags` - Free form labels the submitter attached
    #[must_use]
    pub fn new<T: Into<String>>(
        application_id: T,
        partition: T,
        queue_name: T,
        user: UserGroup,
        tags: HashMap<String, String>,
    ) -> Self {
        Application {
            application_id: application_id.into(),
            partition: partition.into(),
            user,
            tags,
            submitted: Utc::now(),
            state: RwLock::new(ApplicationState::New),
            book: RwLock::new(AppBook {
                queue_name: queue_name.into(),
                ..AppBook::default()
            }),
        }
    }

    /// Get the user that submitted this application
    #[must_use]
    pub fn user(&self) -> UserGroup {
        self.user.clone()
    }

    /// Get a label the submitter attached
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the label to get
    #[must_use]
    pub fn tag(&self, name: &str) -> Option<String> {
        self.tags.get(name).cloned()
    }

    /// Get when this application was submitted
    #[must_use]
    pub fn submitted(&self) -> DateTime<Utc> {
        self.submitted
    }

    /// Get the current lifecycle state
    #[must_use]
    pub fn state(&self) -> ApplicationState {
        *self.state.read().unwrap()
    }

    /// Mark this application as accepted by a queue
    pub fn accept(&self) {
        *self.state.write().unwrap() = ApplicationState::Accepted;
    }

    /// Mark this application as rejected
    pub fn reject(&self) {
        *self.state.write().unwrap() = ApplicationState::Rejected;
    }

    /// Mark this application as completed
    pub fn complete(&self) {
        *self.state.write().unwrap() = ApplicationState::Completed;
    }

    /// Move the state forward when an allocation lands
    fn promote_on_allocation(&self) {
        let mut state = self.state.write().unwrap();
        *state = match *state {
            ApplicationState::New | ApplicationState::Accepted => ApplicationState::Starting,
            ApplicationState::Starting => ApplicationState::Running,
            current => current,
        };
    }

    /// Get the queue path this application targets
    #[must_use]
    pub fn queue_name(&self) -> String {
        self.book.read().unwrap().queue_name.clone()
    }

    /// Set the queue path this application targets
    ///
    /// # Arguments
    ///
    /// * `queue_name` - The queue path to target
    pub fn set_queue_name<T: Into<String>>(&self, queue_name: T) {
        self.book.write().unwrap().queue_name = queue_name.into();
    }

    /// Get the queue this application is assigned to
    #[must_use]
    pub fn queue(&self) -> Option<Arc<Queue>> {
        self.book.read().unwrap().queue.as_ref().and_then(Weak::upgrade)
    }

    /// Assign this application to a queue
    ///
    /// # Arguments
    ///
    /// * `queue` - The leaf queue this application now lives in
    pub fn set_queue(&self, queue: &Arc<Queue>) {
        let mut book = self.book.write().unwrap();
        book.queue_name = queue.path().to_owned();
        book.queue = Some(Arc::downgrade(queue));
    }

    /// Add or replace a pending ask
    ///
    /// A same keyed ask replaces the old one and the pending books move by
    /// the difference.
    ///
    /// # Arguments
    ///
    /// * `ask` - The ask to add
    pub fn add_ask(&self, ask: AllocationAsk) -> Result<(), Error> {
        // an ask that can never place anything is a request error
        if !ask.resource.strictly_positive() || ask.max_allocations == 0 {
            return Err(Error::Validation(format!(
                "ask {} for application {} has no positive resource request",
                ask.allocation_key, self.application_id
            )));
        }
        let new_pending = ask.pending_resource();
        // update the ask book and capture what the queue needs to hear
        let (queue, old_pending) = {
            let mut book = self.book.write().unwrap();
            let old = book.asks.insert(ask.allocation_key.clone(), ask);
            let old_pending = old.map(|old| old.pending_resource());
            if let Some(old_pending) = &old_pending {
                book.pending = book.pending.sub_floor(old_pending);
            }
            book.pending.add_to(&new_pending);
            (book.queue.as_ref().and_then(Weak::upgrade), old_pending)
        };
        // pass the pending change up the queue tree outside our own lock
        if let Some(queue) = queue {
            if let Some(old_pending) = &old_pending {
                queue.dec_pending(old_pending);
            }
            queue.inc_pending(&new_pending);
        }
        Ok(())
    }

    /// Remove pending asks and cancel the reservations they held
    ///
    /// An empty key removes every ask. Returns the number of reservations
    /// that were cancelled so the partition can correct its counters.
    ///
    /// # Arguments
    ///
    /// * `allocation_key` - The ask to remove, empty for all
    pub fn remove_asks(&self, allocation_key: &str) -> usize {
        // update the books and collect the cleanup work
        let (queue, removed_pending, cancelled) = {
            let mut book = self.book.write().unwrap();
            let mut removed_pending = Resource::new();
            let removed: Vec<AllocationAsk> = if allocation_key.is_empty() {
                book.asks.drain().map(|(_, ask)| ask).collect()
            } else {
                book.asks.remove(allocation_key).into_iter().collect()
            };
            for ask in &removed {
                removed_pending.add_to(&ask.pending_resource());
            }
            book.pending = book.pending.sub_floor(&removed_pending);
            // cancel any reservation that referenced a removed ask
            let dropped: Vec<String> = book
                .reservations
                .iter()
                .filter(|(_, reservation)| {
                    removed
                        .iter()
                        .any(|ask| ask.allocation_key == reservation.ask.allocation_key)
                })
                .map(|(node_id, _)| node_id.clone())
                .collect();
            let cancelled: Vec<Reservation> = dropped
                .iter()
                .filter_map(|node_id| book.reservations.remove(node_id))
                .collect();
            (book.queue.as_ref().and_then(Weak::upgrade), removed_pending, cancelled)
        };
        // release the node side slots for the cancelled reservations
        for reservation in &cancelled {
            reservation
                .node
                .unreserve(&self.application_id, &reservation.ask.allocation_key);
        }
        // lower the pending books up the queue tree
        if let Some(queue) = queue {
            if removed_pending.strictly_positive() {
                queue.dec_pending(&removed_pending);
            }
        }
        cancelled.len()
    }

    /// Consume one repeat of a pending ask
    ///
    /// # Arguments
    ///
    /// * `allocation_key` - The ask to consume a repeat from
    pub fn allocate_ask(&self, allocation_key: &str) -> Result<Resource, Error> {
        // consume the repeat under our own lock
        let (queue, resource) = {
            let mut book = self.book.write().unwrap();
            let ask = book.asks.get_mut(allocation_key).ok_or_else(|| {
                Error::NotFound(format!(
                    "ask {allocation_key} not found on application {}",
                    self.application_id
                ))
            })?;
            if ask.max_allocations == 0 {
                return Err(Error::Invariant(format!(
                    "ask {allocation_key} on application {} has no pending repeats",
                    self.application_id
                )));
            }
            ask.max_allocations -= 1;
            let resource = ask.resource.clone();
            book.pending = book.pending.sub_floor(&resource);
            (book.queue.as_ref().and_then(Weak::upgrade), resource)
        };
        // lower the pending books up the queue tree
        if let Some(queue) = queue {
            queue.dec_pending(&resource);
        }
        Ok(resource)
    }

    /// Give a consumed repeat back to a pending ask
    ///
    /// Used when a commit fails after the descent already consumed the
    /// repeat.
    ///
    /// # Arguments
    ///
    /// * `allocation_key` - The ask to restore a repeat to
    pub fn restore_ask(&self, allocation_key: &str) {
        let (queue, resource) = {
            let mut book = self.book.write().unwrap();
            match book.asks.get_mut(allocation_key) {
                Some(ask) => {
                    ask.max_allocations += 1;
                    let resource = ask.resource.clone();
                    book.pending.add_to(&resource);
                    (book.queue.as_ref().and_then(Weak::upgrade), resource)
                }
                None => return,
            }
        };
        if let Some(queue) = queue {
            queue.inc_pending(&resource);
        }
    }

    /// Re-register the ask behind a recovered allocation
    ///
    /// The repeat was consumed before the restart so the ask lands with no
    /// pending repeats.
    ///
    /// # Arguments
    ///
    /// * `ask` - The ask to recover
    pub fn recover_ask(&self, ask: &AllocationAsk) {
        let mut book = self.book.write().unwrap();
        if !book.asks.contains_key(&ask.allocation_key) {
            let mut recovered = ask.clone();
            recovered.max_allocations = 0;
            book.asks.insert(recovered.allocation_key.clone(), recovered);
        }
    }

    /// Get the pending asks ready for scheduling in priority order
    #[must_use]
    pub fn sorted_asks(&self) -> Vec<AllocationAsk> {
        let book = self.book.read().unwrap();
        let mut asks: Vec<AllocationAsk> = book
            .asks
            .values()
            .filter(|ask| ask.max_allocations > 0)
            .cloned()
            .collect();
        // highest priority first, oldest ask on ties
        asks.sort_by(|left, right| {
            right
                .priority
                .cmp(&left.priority)
                .then_with(|| left.created.cmp(&right.created))
        });
        asks
    }

    /// Get the remaining repeats for an ask
    ///
    /// # Arguments
    ///
    /// * `allocation_key` - The ask to look up
    #[must_use]
    pub fn ask_repeats(&self, allocation_key: &str) -> u64 {
        let book = self.book.read().unwrap();
        book.asks
            .get(allocation_key)
            .map(|ask| ask.max_allocations)
            .unwrap_or(0)
    }

    /// Get the total pending resources for this application
    #[must_use]
    pub fn pending_resource(&self) -> Resource {
        self.book.read().unwrap().pending.clone()
    }

    /// Reserve a node for an ask
    ///
    /// An application can hold at most one reservation per node.
    ///
    /// # Arguments
    ///
    /// * `node` - The node to reserve
    /// * `ask` - The ask the reservation is for
    pub fn reserve(&self, node: &Arc<Node>, ask: &AllocationAsk) -> Result<(), Error> {
        let mut book = self.book.write().unwrap();
        if book.reservations.contains_key(node.node_id()) {
            return Err(Error::Validation(format!(
                "application {} is already reserved on node {}",
                self.application_id,
                node.node_id()
            )));
        }
        // take the node side slot first, it can still refuse us
        node.reserve(&self.application_id, ask)?;
        book.reservations.insert(
            node.node_id().to_owned(),
            Reservation {
                node: node.clone(),
                ask: ask.clone(),
            },
        );
        Ok(())
    }

    /// Release a reservation held on a node
    ///
    /// Removing a reservation that does not exist is a noop. Returns the
    /// number of reservations actually removed.
    ///
    /// # Arguments
    ///
    /// * `node` - The node to release the reservation on
    /// * `allocation_key` - The ask the reservation was held for
    pub fn unreserve(&self, node: &Arc<Node>, allocation_key: &str) -> usize {
        let removed = {
            let mut book = self.book.write().unwrap();
            match book.reservations.get(node.node_id()) {
                Some(held) if held.ask.allocation_key == allocation_key => {
                    book.reservations.remove(node.node_id());
                    true
                }
                _ => false,
            }
        };
        // release the node side slot even if our side was already gone
        let node_removed = node.unreserve(&self.application_id, allocation_key);
        usize::from(removed).max(node_removed)
    }

    /// Drop the reservation book entry for a removed node
    ///
    /// The node side is gone with the node itself.
    ///
    /// # Arguments
    ///
    /// * `node_id` - The removed node
    pub fn unreserve_node(&self, node_id: &str) -> usize {
        let mut book = self.book.write().unwrap();
        usize::from(book.reservations.remove(node_id).is_some())
    }

    /// Check if this application holds a reservation on a node
    ///
    /// # Arguments
    ///
    /// * `node_id` - The node to check
    #[must_use]
    pub fn is_reserved_on(&self, node_id: &str) -> bool {
        self.book.read().unwrap().reservations.contains_key(node_id)
    }

    /// Get a snapshot of the reservations this application holds
    #[must_use]
    pub fn reservations(&self) -> Vec<Reservation> {
        self.book.read().unwrap().reservations.values().cloned().collect()
    }

    /// Get the number of reservations this application holds
    #[must_use]
    pub fn reservation_count(&self) -> usize {
        self.book.read().unwrap().reservations.len()
    }

    /// Add a committed allocation to this application
    ///
    /// # Arguments
    ///
    /// * `alloc` - The allocation to add
    pub fn add_allocation(&self, alloc: Allocation) {
        {
            let mut book = self.book.write().unwrap();
            book.allocated.add_to(&alloc.resource);
            book.allocations.insert(alloc.uuid, alloc);
        }
        self.promote_on_allocation();
    }

    /// Remove a single allocation from this application
    ///
    /// # Arguments
    ///
    /// * `uuid` - The allocation to remove
    pub fn remove_allocation(&self, uuid: &Uuid) -> Option<Allocation> {
        let mut book = self.book.write().unwrap();
        let removed = book.allocations.remove(uuid);
        if let Some(alloc) = &removed {
            if !book.allocated.enough(&alloc.resource) {
                event!(
                    Level::WARN,
                    app = self.application_id,
                    alloc = %alloc.resource,
                    held = %book.allocated,
                    msg = "removing more than the application holds"
                );
            }
            book.allocated = book.allocated.sub_floor(&alloc.resource);
        }
        removed
    }

    /// Remove every allocation and zero the usage books
    ///
    /// Returns the allocations that were held. The queue accounting is
    /// lowered by the total that was released.
    pub fn remove_all_allocations(&self) -> Vec<Allocation> {
        let (queue, total, removed) = {
            let mut book = self.book.write().unwrap();
            let removed: Vec<Allocation> = book.allocations.drain().map(|(_, alloc)| alloc).collect();
            let total = std::mem::take(&mut book.allocated);
            (book.queue.as_ref().and_then(Weak::upgrade), total, removed)
        };
        // lower the queue books outside our own lock
        if let Some(queue) = queue {
            if total.strictly_positive() {
                if let Err(error) = queue.dec_allocated(&total) {
                    event!(
                        Level::WARN,
                        app = self.application_id,
                        error = %error,
                        msg = "failed to release application resources from queue"
                    );
                }
            }
        }
        removed
    }

    /// Get the total resources allocated to this application
    #[must_use]
    pub fn allocated_resource(&self) -> Resource {
        self.book.read().unwrap().allocated.clone()
    }

    /// Get the number of live allocations on this application
    #[must_use]
    pub fn allocation_count(&self) -> usize {
        self.book.read().unwrap().allocations.len()
    }
}
