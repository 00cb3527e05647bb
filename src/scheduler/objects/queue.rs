//! The hierarchical queue tree
//!
//! Queues account capacity top down: the root carries the partition total
//! and every allocation is booked on the leaf and each of its ancestors.
//! Walks that climb the tree lock child then parent, walks that descend
//! snapshot the children and release before recursing.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use tracing::{event, instrument, Level};

use crate::models::{
    valid_queue_name, Acl, QueueCapacities, QueueConfig, QueueInfo, Resource, UserGroup,
    APPLICATION_SORT_POLICY, DOT, RECOVERY_QUEUE,
};
use crate::Error;
use super::super::policies::{compare_f64, fair_share, NodeIterator, SortType};
use super::super::state::{ObjectEvent, StateMachine};
use super::allocation::{Allocation, AllocationResult};
use super::application::Application;

/// The lockable state of a queue
#[derive(Debug)]
struct QueueState {
    /// The ACL controlling who can submit to this queue
    submit_acl: Acl,
    /// The ACL controlling who can administer this queue
    admin_acl: Acl,
    /// The merged properties from our ancestors and our own config
    properties: HashMap<String, String>,
    /// The maximum resources this queue may have allocated
    max_resource: Option<Resource>,
    /// The resources this queue is guaranteed to receive
    guaranteed: Resource,
    /// The resources currently allocated under this queue
    allocated: Resource,
    /// The pending resources of the asks under this queue
    pending: Resource,
    /// Whether this queue came from the config
    managed: bool,
    /// Whether this queue holds applications instead of children
    leaf: bool,
    /// How children or applications are ordered
    sort_type: SortType,
    /// The lifecycle state of this queue
    lifecycle: StateMachine,
    /// The direct children of this queue by name
    children: HashMap<String, Arc<Queue>>,
    /// The children in the order the config introduced them
    child_order: Vec<String>,
    /// The applications assigned to this leaf queue
    applications: HashMap<String, Arc<Application>>,
    /// The reservation count per application on this leaf queue
    reservations: HashMap<String, usize>,
}

impl Default for QueueState {
    fn default() -> Self {
        QueueState {
            submit_acl: Acl::default(),
            admin_acl: Acl::default(),
            properties: HashMap::default(),
            max_resource: None,
            guaranteed: Resource::new(),
            allocated: Resource::new(),
            pending: Resource::new(),
            managed: false,
            leaf: true,
            sort_type: SortType::default(),
            lifecycle: StateMachine::new(),
            children: HashMap::default(),
            child_order: Vec::default(),
            applications: HashMap::default(),
            reservations: HashMap::default(),
        }
    }
}

/// A queue in the partition accounting tree
#[derive(Debug)]
pub struct Queue {
    /// The lower cased name of this queue
    name: String,
    /// The full dotted path of this queue
    path: String,
    /// The parent of this queue, only the root has none
    parent: Option<Weak<Queue>>,
    /// The lockable state of this queue
    state: RwLock<QueueState>,
}

impl Queue {
    /// Create a managed queue from its config
    ///
    /// # Arguments
    ///
    /// * `conf` - The config for this queue
    /// * `parent` - The parent to hang this queue under, none for the root
    pub fn managed(conf: &QueueConfig, parent: Option<&Arc<Queue>>) -> Result<Arc<Queue>, Error> {
        let name = conf.name.to_lowercase();
        let queue = Arc::new(Queue {
            path: build_path(parent, &name),
            name,
            parent: parent.map(Arc::downgrade),
            state: RwLock::new(QueueState::default()),
        });
        queue.apply_config(conf)?;
        // hang the queue in the tree once its config applied cleanly
        if let Some(parent) = parent {
            parent.add_child(&queue)?;
        }
        event!(
            Level::DEBUG,
            queue = queue.path,
            managed = true,
            msg = "queue added"
        );
        Ok(queue)
    }

    /// Create a dynamic queue below an existing parent
    ///
    /// Dynamic queues come from placement rules so the name still needs a
    /// syntax check here.
    ///
    /// # Arguments
    ///
    /// * `name` - The name for the new queue
    /// * `leaf` - Whether the new queue holds applications
    /// * `parent` - The parent to hang this queue under
    pub fn dynamic(name: &str, leaf: bool, parent: &Arc<Queue>) -> Result<Arc<Queue>, Error> {
        if name != RECOVERY_QUEUE && !valid_queue_name(name) {
            return Err(Error::Validation(format!(
                "invalid queue name {name}, a name must only have alphanumeric characters, \
                 - or _, and be no longer than 64 characters"
            )));
        }
        let name = name.to_lowercase();
        // dynamic queues inherit the parents merged properties as they are
        let properties = parent.properties();
        let sort_type = SortType::parse(properties.get(APPLICATION_SORT_POLICY));
        let queue = Arc::new(Queue {
            path: build_path(Some(parent), &name),
            name,
            parent: Some(Arc::downgrade(parent)),
            state: RwLock::new(QueueState {
                properties,
                leaf,
                sort_type,
                ..QueueState::default()
            }),
        });
        parent.add_child(&queue)?;
        event!(
            Level::DEBUG,
            queue = queue.path,
            managed = false,
            msg = "queue added"
        );
        Ok(queue)
    }

    /// Apply a queue config to this queue
    ///
    /// Called at creation and on every config reload. Properties are merged
    /// fresh from the parent so parent updates flow down unless the child
    /// overrides the key.
    ///
    /// # Arguments
    ///
    /// * `conf` - The config to apply
    pub fn apply_config(&self, conf: &QueueConfig) -> Result<(), Error> {
        let submit_acl = Acl::parse(&conf.submit_acl)?;
        let admin_acl = Acl::parse(&conf.admin_acl)?;
        // snapshot the parents merged properties before we take our own lock
        let mut properties = match self.parent_queue() {
            Some(parent) => parent.properties(),
            None => HashMap::default(),
        };
        for (key, value) in &conf.properties {
            properties.insert(key.clone(), value.clone());
        }
        let mut state = self.state.write().unwrap();
        state.submit_acl = submit_acl;
        state.admin_acl = admin_acl;
        if !state.managed {
            // a dynamic queue that shows up in the config is promoted
            state.managed = true;
        }
        state.leaf = !conf.parent;
        if !conf.queues.is_empty() {
            state.leaf = false;
        }
        state.max_resource = if conf.resources.max.is_empty() {
            None
        } else {
            Some(Resource::from_map(conf.resources.max.clone()))
        };
        state.guaranteed = Resource::from_map(conf.resources.guaranteed.clone());
        state.sort_type = SortType::parse(properties.get(APPLICATION_SORT_POLICY));
        state.properties = properties;
        Ok(())
    }

    /// Recompute the sort type from the merged properties
    pub fn update_sort_type(&self) {
        let mut state = self.state.write().unwrap();
        state.sort_type = SortType::parse(state.properties.get(APPLICATION_SORT_POLICY));
    }

    /// Get the name of this queue
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the full dotted path of this queue
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Get the parent of this queue
    #[must_use]
    pub fn parent_queue(&self) -> Option<Arc<Queue>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Check if this queue holds applications instead of children
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.state.read().unwrap().leaf
    }

    /// Check if this queue came from the config
    #[must_use]
    pub fn is_managed(&self) -> bool {
        self.state.read().unwrap().managed
    }

    /// Check if this queue is draining towards removal
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.state.read().unwrap().lifecycle.is_draining()
    }

    /// Check if this queue takes part in scheduling
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.read().unwrap().lifecycle.is_running()
    }

    /// Check if this queue is out of scheduling entirely
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state.read().unwrap().lifecycle.is_stopped()
    }

    /// Get the lifecycle state name for info exports
    #[must_use]
    pub fn state_name(&self) -> &'static str {
        self.state.read().unwrap().lifecycle.current().as_str()
    }

    /// Drive a lifecycle event for this queue
    ///
    /// # Arguments
    ///
    /// * `queue_event` - The event to handle
    pub fn handle_event(&self, queue_event: ObjectEvent) -> Result<(), Error> {
        self.state.write().unwrap().lifecycle.handle(queue_event)
    }

    /// Get the merged properties of this queue
    #[must_use]
    pub fn properties(&self) -> HashMap<String, String> {
        self.state.read().unwrap().properties.clone()
    }

    /// Get the resources currently allocated under this queue
    #[must_use]
    pub fn allocated_resource(&self) -> Resource {
        self.state.read().unwrap().allocated.clone()
    }

    /// Get the pending resources of the asks under this queue
    #[must_use]
    pub fn pending_resource(&self) -> Resource {
        self.state.read().unwrap().pending.clone()
    }

    /// Get the maximum resources for this queue if set
    #[must_use]
    pub fn max_resource(&self) -> Option<Resource> {
        self.state.read().unwrap().max_resource.clone()
    }

    /// Get the guaranteed resources for this queue
    #[must_use]
    pub fn guaranteed_resource(&self) -> Resource {
        self.state.read().unwrap().guaranteed.clone()
    }

    /// Set the maximum resources on the root queue
    ///
    /// Every other queue gets its maximum from the config: a call on a non
    /// root queue only logs.
    ///
    /// # Arguments
    ///
    /// * `max` - The new maximum, the sum of the node capacities
    pub fn set_max_resource(&self, max: Resource) {
        if self.parent.is_some() {
            event!(
                Level::WARN,
                queue = self.path,
                msg = "max resources set on a queue that is not the root"
            );
            return;
        }
        self.state.write().unwrap().max_resource = Some(max);
    }

    /// Add a child below this queue
    ///
    /// # Arguments
    ///
    /// * `child` - The child queue to add
    pub fn add_child(&self, child: &Arc<Queue>) -> Result<(), Error> {
        let mut state = self.state.write().unwrap();
        if state.leaf {
            return Err(Error::Validation(format!(
                "cannot add a child queue to a leaf queue: {}",
                self.path
            )));
        }
        if state.lifecycle.is_draining() {
            return Err(Error::State(format!(
                "cannot add a child queue while queue is marked for removal: {}",
                self.path
            )));
        }
        state.children.insert(child.name.clone(), child.clone());
        state.child_order.push(child.name.clone());
        Ok(())
    }

    /// Remove a child from this queue
    ///
    /// Removing a child that is not there is a noop.
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the child to remove
    pub fn remove_child(&self, name: &str) {
        let mut state = self.state.write().unwrap();
        let lowered = name.to_lowercase();
        state.children.remove(&lowered);
        state.child_order.retain(|child| child != &lowered);
    }

    /// Get a child of this queue by name
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the child to get
    #[must_use]
    pub fn get_child(&self, name: &str) -> Option<Arc<Queue>> {
        self.state.read().unwrap().children.get(name).cloned()
    }

    /// Get a snapshot of the children of this queue
    #[must_use]
    pub fn children(&self) -> Vec<Arc<Queue>> {
        self.state.read().unwrap().children.values().cloned().collect()
    }

    /// Remove this queue from the tree
    ///
    /// A queue can only go when it has no children, no applications, no
    /// allocation and is not a managed queue in active use. Returns whether
    /// the queue was removed.
    pub fn remove_queue(&self) -> bool {
        // the root queue never leaves the tree
        let Some(parent) = self.parent_queue() else {
            return false;
        };
        {
            let mut state = self.state.write().unwrap();
            if state.managed && state.lifecycle.is_running() {
                return false;
            }
            if !state.children.is_empty() || !state.applications.is_empty() {
                return false;
            }
            if !state.allocated.is_zero() {
                return false;
            }
            // stamp the final state before the queue drops out of the tree
            if let Err(error) = state.lifecycle.handle(ObjectEvent::Stop) {
                event!(
                    Level::WARN,
                    queue = self.path,
                    error = %error,
                    msg = "failed to stop queue before removal"
                );
            }
        }
        event!(Level::INFO, queue = self.path, msg = "removing queue");
        parent.remove_child(&self.name);
        true
    }

    /// Mark this managed queue and its managed children for removal
    ///
    /// Dynamic queues clean themselves up when idle so they are skipped.
    pub fn mark_for_removal(&self) {
        let children = {
            let mut state = self.state.write().unwrap();
            if !state.managed {
                return;
            }
            if let Err(error) = state.lifecycle.handle(ObjectEvent::Remove) {
                event!(
                    Level::WARN,
                    queue = self.path,
                    error = %error,
                    msg = "failed to mark queue for removal"
                );
            }
            state.children.values().cloned().collect::<Vec<_>>()
        };
        event!(Level::INFO, queue = self.path, msg = "queue marked for removal");
        // cascade without holding our own lock
        for child in children {
            child.mark_for_removal();
        }
    }

    /// Check who may submit to this queue
    ///
    /// The walk climbs towards the root: any ancestors submit or admin ACL
    /// admitting the user is enough.
    ///
    /// # Arguments
    ///
    /// * `user` - The user to check
    #[must_use]
    pub fn check_submit_access(&self, user: &UserGroup) -> bool {
        let allowed = {
            let state = self.state.read().unwrap();
            state.submit_acl.check_access(user) || state.admin_acl.check_access(user)
        };
        if allowed {
            return true;
        }
        match self.parent_queue() {
            Some(parent) => parent.check_submit_access(user),
            None => false,
        }
    }

    /// Check who may administer this queue
    ///
    /// Only the admin ACLs count on this walk.
    ///
    /// # Arguments
    ///
    /// * `user` - The user to check
    #[must_use]
    pub fn check_admin_access(&self, user: &UserGroup) -> bool {
        let allowed = self.state.read().unwrap().admin_acl.check_access(user);
        if allowed {
            return true;
        }
        match self.parent_queue() {
            Some(parent) => parent.check_admin_access(user),
            None => false,
        }
    }

    /// Raise the allocated resources on this queue and its ancestors
    ///
    /// The raise is guarded by each ancestors maximum unless the resources
    /// come in through a node report: capacity that already exists in the
    /// cluster is never refused. Nothing changes when any ancestor refuses.
    ///
    /// # Arguments
    ///
    /// * `alloc` - The resources to raise the books by
    /// * `node_reported` - Whether a node report introduced the resources
    pub fn inc_allocated(&self, alloc: &Resource, node_reported: bool) -> Result<(), Error> {
        let parent = self.parent_queue();
        let mut state = self.state.write().unwrap();
        let raised = Resource::add(&state.allocated, alloc);
        if !node_reported {
            if let Some(max) = &state.max_resource {
                if !max.enough(&raised) {
                    return Err(Error::Capacity(format!(
                        "allocation {alloc} puts queue {} over maximum {max}",
                        self.path
                    )));
                }
            }
        }
        // our books only move once the whole ancestor chain agreed
        if let Some(parent) = &parent {
            parent.inc_allocated(alloc, node_reported)?;
        }
        state.allocated = raised;
        Ok(())
    }

    /// Lower the allocated resources on this queue and its ancestors
    ///
    /// Releasing more than is held aborts without touching any books.
    ///
    /// # Arguments
    ///
    /// * `alloc` - The resources to lower the books by
    pub fn dec_allocated(&self, alloc: &Resource) -> Result<(), Error> {
        let parent = self.parent_queue();
        let mut state = self.state.write().unwrap();
        if !state.allocated.enough(alloc) {
            return Err(Error::Invariant(format!(
                "released allocation {alloc} is larger than queue {} allocation {}",
                self.path, state.allocated
            )));
        }
        if let Some(parent) = &parent {
            parent.dec_allocated(alloc)?;
        }
        state.allocated = state.allocated.sub_floor(alloc);
        Ok(())
    }

    /// Raise the pending resources on this queue and its ancestors
    ///
    /// # Arguments
    ///
    /// * `delta` - The pending resources to add
    pub fn inc_pending(&self, delta: &Resource) {
        let parent = self.parent_queue();
        let mut state = self.state.write().unwrap();
        if let Some(parent) = &parent {
            parent.inc_pending(delta);
        }
        state.pending.add_to(delta);
    }

    /// Lower the pending resources on this queue and its ancestors
    ///
    /// Pending books are advisory so underflow clamps at zero with a
    /// warning instead of failing the caller.
    ///
    /// # Arguments
    ///
    /// * `delta` - The pending resources to remove
    pub fn dec_pending(&self, delta: &Resource) {
        let parent = self.parent_queue();
        let mut state = self.state.write().unwrap();
        if let Some(parent) = &parent {
            parent.dec_pending(delta);
        }
        if !state.pending.enough(delta) {
            event!(
                Level::WARN,
                queue = self.path,
                delta = %delta,
                pending = %state.pending,
                msg = "pending resource underflow clamped"
            );
        }
        state.pending = state.pending.sub_floor(delta);
    }

    /// Add an application to this leaf queue
    ///
    /// # Arguments
    ///
    /// * `app` - The application to add
    pub fn add_application(&self, app: &Arc<Application>) -> Result<(), Error> {
        let mut state = self.state.write().unwrap();
        if !state.leaf {
            return Err(Error::Validation(format!(
                "cannot add application {} to parent queue {}",
                app.application_id, self.path
            )));
        }
        if state.lifecycle.is_draining() || state.lifecycle.is_stopped() {
            return Err(Error::State(format!(
                "queue {} is marked for removal, no new applications",
                self.path
            )));
        }
        // first use pulls a new queue into active scheduling
        if let Err(error) = state.lifecycle.handle(ObjectEvent::Start) {
            return Err(Error::State(format!(
                "queue {} cannot start: {error}",
                self.path
            )));
        }
        state
            .applications
            .insert(app.application_id.clone(), app.clone());
        Ok(())
    }

    /// Remove an application from this leaf queue
    ///
    /// # Arguments
    ///
    /// * `application_id` - The application to remove
    pub fn remove_application(&self, application_id: &str) {
        let mut state = self.state.write().unwrap();
        state.applications.remove(application_id);
        state.reservations.remove(application_id);
    }

    /// Get a snapshot of the applications on this leaf queue
    #[must_use]
    pub fn applications(&self) -> Vec<Arc<Application>> {
        self.state.read().unwrap().applications.values().cloned().collect()
    }

    /// Count a new reservation for an application on this queue
    ///
    /// # Arguments
    ///
    /// * `application_id` - The application holding the reservation
    pub fn reserve(&self, application_id: &str) {
        let mut state = self.state.write().unwrap();
        *state.reservations.entry(application_id.to_owned()).or_insert(0) += 1;
    }

    /// Drop reservations for an application on this queue
    ///
    /// # Arguments
    ///
    /// * `application_id` - The application dropping reservations
    /// * `count` - How many reservations were dropped
    pub fn unreserve(&self, application_id: &str, count: usize) {
        let mut state = self.state.write().unwrap();
        if let Some(held) = state.reservations.get_mut(application_id) {
            if *held <= count {
                state.reservations.remove(application_id);
            } else {
                *held -= count;
            }
        }
    }

    /// Get the total reservation count on this queue
    #[must_use]
    pub fn reservation_count(&self) -> usize {
        self.state.read().unwrap().reservations.values().sum()
    }

    /// Get the children of this queue in scheduling order
    #[must_use]
    pub fn sorted_children(&self) -> Vec<Arc<Queue>> {
        // snapshot under our lock, order using the childrens own locks after
        let (mut children, order, sort_type) = {
            let state = self.state.read().unwrap();
            let children: Vec<Arc<Queue>> = state.children.values().cloned().collect();
            (children, state.child_order.clone(), state.sort_type)
        };
        match sort_type {
            SortType::Fifo => {
                // config order is the fifo order for children
                children.sort_by_key(|child| {
                    order
                        .iter()
                        .position(|name| name == child.name())
                        .unwrap_or(usize::MAX)
                });
            }
            SortType::Fair => {
                children.sort_by(|left, right| {
                    let left_share =
                        fair_share(&left.allocated_resource(), &left.guaranteed_resource());
                    let right_share =
                        fair_share(&right.allocated_resource(), &right.guaranteed_resource());
                    compare_f64(left_share, right_share)
                        .then_with(|| left.name().cmp(right.name()))
                });
            }
        }
        children
    }

    /// Get the applications of this leaf queue in scheduling order
    #[must_use]
    pub fn sorted_applications(&self) -> Vec<Arc<Application>> {
        let (mut apps, guaranteed, sort_type) = {
            let state = self.state.read().unwrap();
            let apps: Vec<Arc<Application>> = state.applications.values().cloned().collect();
            (apps, state.guaranteed.clone(), state.sort_type)
        };
        match sort_type {
            SortType::Fifo => apps.sort_by_key(|app| app.submitted()),
            SortType::Fair => {
                apps.sort_by(|left, right| {
                    let left_share = fair_share(&left.allocated_resource(), &guaranteed);
                    let right_share = fair_share(&right.allocated_resource(), &guaranteed);
                    compare_f64(left_share, right_share)
                        .then_with(|| left.submitted().cmp(&right.submitted()))
                });
            }
        }
        apps
    }

    /// Collect every pending ask below this queue
    ///
    /// # Arguments
    ///
    /// * `outstanding` - The list to collect the asks into
    pub fn collect_outstanding(&self, outstanding: &mut Vec<super::application::AllocationAsk>) {
        if self.is_leaf() {
            for app in self.applications() {
                outstanding.extend(app.sorted_asks());
            }
            return;
        }
        for child in self.sorted_children() {
            child.collect_outstanding(outstanding);
        }
    }

    /// Try to cut one allocation from the tree below this queue
    ///
    /// Children are visited in policy order and the first hit wins. The
    /// partition commits whatever this returns.
    ///
    /// # Arguments
    ///
    /// * `node_iter` - Builds an iterator over the schedulable nodes
    pub fn try_allocate(
        &self,
        node_iter: &dyn Fn() -> Option<NodeIterator>,
    ) -> Option<Allocation> {
        // nothing pending below us means nothing to do
        if !self.pending_resource().strictly_positive() {
            return None;
        }
        if self.is_leaf() {
            return self.try_allocate_leaf(node_iter);
        }
        for child in self.sorted_children() {
            if child.is_stopped() {
                continue;
            }
            if let Some(alloc) = child.try_allocate(node_iter) {
                return Some(alloc);
            }
        }
        None
    }

    /// Try to cut one allocation from the applications on this leaf
    ///
    /// # Arguments
    ///
    /// * `node_iter` - Builds an iterator over the schedulable nodes
    #[instrument(name = "Queue::try_allocate_leaf", skip_all, fields(queue = self.path))]
    fn try_allocate_leaf(
        &self,
        node_iter: &dyn Fn() -> Option<NodeIterator>,
    ) -> Option<Allocation> {
        for app in self.sorted_applications() {
            if !app.pending_resource().strictly_positive() {
                continue;
            }
            for ask in app.sorted_asks() {
                // walk the nodes in policy order for this ask
                let Some(mut nodes) = node_iter() else {
                    return None;
                };
                while let Some(node) = nodes.next() {
                    if !node.can_allocate(&ask.resource) {
                        continue;
                    }
                    // the node fits, now the queue caps get their say
                    match self.inc_allocated(&ask.resource, false) {
                        Ok(()) => {
                            if let Err(error) = app.allocate_ask(&ask.allocation_key) {
                                // put the queue books back, the ask vanished under us
                                event!(
                                    Level::WARN,
                                    queue = self.path,
                                    error = %error,
                                    msg = "ask disappeared during allocation"
                                );
                                let _ = self.dec_allocated(&ask.resource);
                                break;
                            }
                            return Some(Allocation::new(
                                &ask,
                                self.path.as_str(),
                                node.node_id(),
                                AllocationResult::Allocated,
                            ));
                        }
                        Err(_) => {
                            // a queue cap blocks this ask everywhere, hold the
                            // node with a reservation when the ask allows it
                            if !ask.placeholder && !app.is_reserved_on(node.node_id()) {
                                return Some(Allocation::new(
                                    &ask,
                                    self.path.as_str(),
                                    node.node_id(),
                                    AllocationResult::Reserved,
                                ));
                            }
                            break;
                        }
                    }
                }
            }
        }
        None
    }

    /// Try to satisfy or clean up the reservations below this queue
    ///
    /// # Arguments
    ///
    /// * `node_iter` - Builds an iterator over the schedulable nodes
    pub fn try_reserved_allocate(
        &self,
        node_iter: &dyn Fn() -> Option<NodeIterator>,
    ) -> Option<Allocation> {
        if self.is_leaf() {
            return self.try_reserved_allocate_leaf(node_iter);
        }
        for child in self.sorted_children() {
            if child.is_stopped() {
                continue;
            }
            if let Some(alloc) = child.try_reserved_allocate(node_iter) {
                return Some(alloc);
            }
        }
        None
    }

    /// Work the reservations held by the applications on this leaf
    ///
    /// A reservation whose ask ran out of repeats is cancelled. One whose
    /// node fits again is promoted in place, otherwise any other fitting
    /// node takes it.
    ///
    /// # Arguments
    ///
    /// * `node_iter` - Builds an iterator over the schedulable nodes
    #[instrument(name = "Queue::try_reserved_allocate_leaf", skip_all, fields(queue = self.path))]
    fn try_reserved_allocate_leaf(
        &self,
        node_iter: &dyn Fn() -> Option<NodeIterator>,
    ) -> Option<Allocation> {
        if self.reservation_count() == 0 {
            return None;
        }
        for app in self.sorted_applications() {
            for reservation in app.reservations() {
                let ask = &reservation.ask;
                let node = &reservation.node;
                // a reservation without pending repeats only needs cleanup
                if app.ask_repeats(&ask.allocation_key) == 0 {
                    return Some(Allocation::new(
                        ask,
                        self.path.as_str(),
                        node.node_id(),
                        AllocationResult::Unreserved,
                    ));
                }
                // the reserved node itself gets the first shot
                if node.can_allocate(&ask.resource) {
                    match self.inc_allocated(&ask.resource, false) {
                        Ok(()) => {
                            if app.allocate_ask(&ask.allocation_key).is_err() {
                                let _ = self.dec_allocated(&ask.resource);
                                continue;
                            }
                            return Some(Allocation::new(
                                ask,
                                self.path.as_str(),
                                node.node_id(),
                                AllocationResult::AllocatedReserved,
                            ));
                        }
                        // still capped, the reservation stays in place
                        Err(_) => continue,
                    }
                }
                // try to move the reservation onto any other fitting node
                let Some(mut nodes) = node_iter() else {
                    continue;
                };
                while let Some(other) = nodes.next() {
                    if other.node_id() == node.node_id() || !other.can_allocate(&ask.resource) {
                        continue;
                    }
                    match self.inc_allocated(&ask.resource, false) {
                        Ok(()) => {
                            if app.allocate_ask(&ask.allocation_key).is_err() {
                                let _ = self.dec_allocated(&ask.resource);
                                break;
                            }
                            return Some(
                                Allocation::new(
                                    ask,
                                    self.path.as_str(),
                                    other.node_id(),
                                    AllocationResult::AllocatedReserved,
                                )
                                .promoted_from(node.node_id()),
                            );
                        }
                        // the cap blocks this ask on every node alike
                        Err(_) => break,
                    }
                }
            }
        }
        None
    }

    /// Build the info snapshot for this queue and its children
    #[must_use]
    pub fn queue_info(&self) -> QueueInfo {
        let (capacities, status) = {
            let state = self.state.read().unwrap();
            let max = state.max_resource.clone().unwrap_or_default();
            let capacities = QueueCapacities {
                capacity: state.guaranteed.clone(),
                max_capacity: max.clone(),
                used_capacity: state.allocated.clone(),
                abs_used_capacity: Resource::abs_used_capacity(&max, &state.allocated),
            };
            (capacities, state.lifecycle.current().as_str().to_owned())
        };
        QueueInfo {
            queue_name: self.name.clone(),
            status,
            capacities,
            child_queues: self.children().iter().map(|child| child.queue_info()).collect(),
        }
    }
}

/// Build the dotted path for a queue
///
/// # Arguments
///
/// * `parent` - The parent the queue hangs under, none for the root
/// * `name` - The lower cased name of the queue
fn build_path(parent: Option<&Arc<Queue>>, name: &str) -> String {
    match parent {
        Some(parent) => format!("{}{DOT}{name}", parent.path),
        None => name.to_owned(),
    }
}
