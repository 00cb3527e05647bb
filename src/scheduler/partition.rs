//! The partition context gluing queues, applications and nodes together
//!
//! The partition serializes mutations to its maps with one lock. The
//! allocation descent deliberately runs without that lock and everything it
//! found is re-checked when the result is committed.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{event, instrument, Level};
use uuid::Uuid;

use crate::models::{NodeUsageMap, PartitionConfig, QueueConfig, QueueInfo, Resource, UserGroup, DOT, ROOT_QUEUE};
use crate::Error;
use super::objects::{
    Allocation, AllocationAsk, AllocationResult, Application, Node, Queue,
};
use super::placement::PlacementManager;
use super::policies::{sort_nodes, NodeIterator, NodeSortingPolicy};
use super::state::{ObjectEvent, StateMachine};

/// The lockable maps and settings of a partition
struct PartitionState {
    /// The applications assigned to this partition
    applications: HashMap<String, Arc<Application>>,
    /// The reservation count per application
    reserved_apps: HashMap<String, usize>,
    /// The nodes registered with this partition
    nodes: HashMap<String, Arc<Node>>,
    /// The committed allocations by uuid
    allocations: HashMap<Uuid, Allocation>,
    /// The sum of all node capacities
    total: Resource,
    /// The placement rule chain for this partition
    placement: PlacementManager,
    /// How nodes are ordered for allocation
    node_sort: NodeSortingPolicy,
    /// Whether allocations in this partition may be preempted
    preemptable: bool,
    /// The lifecycle state of this partition
    lifecycle: StateMachine,
}

/// An isolated scheduling domain owned by one resource manager
pub struct PartitionContext {
    /// The resource manager this partition belongs to
    pub rm_id: String,
    /// The name of this partition
    pub name: String,
    /// The root of the queue tree
    root: Arc<Queue>,
    /// The lockable maps and settings
    state: RwLock<PartitionState>,
}

impl PartitionContext {
    /// Create a partition from its config
    ///
    /// # Arguments
    ///
    /// * `conf` - The validated partition config
    /// * `rm_id` - The resource manager this partition belongs to
    pub fn new(conf: &PartitionConfig, rm_id: &str) -> Result<Self, Error> {
        if conf.name.is_empty() || rm_id.is_empty() {
            return Err(Error::Config(
                "partition cannot be created without name or RM".to_owned(),
            ));
        }
        conf.validate()?;
        // the queue structure starts at the single root queue
        let root_conf = &conf.queues[0];
        let root = Queue::managed(root_conf, None)?;
        Self::add_queues(&root_conf.queues, &root)?;
        event!(
            Level::INFO,
            partition = conf.name,
            rm = rm_id,
            msg = "root queue added"
        );
        let node_sort = NodeSortingPolicy::parse(&conf.node_sort_policy.policy_type)?;
        event!(
            Level::DEBUG,
            partition = conf.name,
            policy = node_sort.as_str(),
            msg = "node sort policy set"
        );
        let mut lifecycle = StateMachine::new();
        // a partition that built its tree is open for business
        lifecycle.handle(ObjectEvent::Start)?;
        Ok(PartitionContext {
            rm_id: rm_id.to_owned(),
            name: conf.name.clone(),
            root,
            state: RwLock::new(PartitionState {
                applications: HashMap::default(),
                reserved_apps: HashMap::default(),
                nodes: HashMap::default(),
                allocations: HashMap::default(),
                total: Resource::new(),
                placement: PlacementManager::new(&conf.placement_rules)?,
                node_sort,
                preemptable: conf.preemption.enabled,
                lifecycle,
            }),
        })
    }

    /// Build the queue tree below a parent recursively
    ///
    /// # Arguments
    ///
    /// * `confs` - The configs of the queues at this level
    /// * `parent` - The queue to hang them under
    fn add_queues(confs: &[QueueConfig], parent: &Arc<Queue>) -> Result<(), Error> {
        for conf in confs {
            let queue = Queue::managed(conf, Some(parent))?;
            if !conf.queues.is_empty() {
                Self::add_queues(&conf.queues, &queue)?;
            }
        }
        Ok(())
    }

    /// Apply a reloaded config to this partition
    ///
    /// The caller validated the config already: existing queues are updated
    /// in place, new ones created and queues that the new config dropped
    /// are marked for removal.
    ///
    /// # Arguments
    ///
    /// * `conf` - The validated new partition config
    #[instrument(name = "PartitionContext::update", skip_all, fields(partition = self.name))]
    pub fn update(&self, conf: &PartitionConfig) -> Result<(), Error> {
        conf.validate()?;
        {
            let mut state = self.state.write().unwrap();
            state.placement.replace_rules(&conf.placement_rules)?;
            state.node_sort = NodeSortingPolicy::parse(&conf.node_sort_policy.policy_type)?;
            state.preemptable = conf.preemption.enabled;
        }
        // update the tree from the root down
        let root_conf = &conf.queues[0];
        self.root.apply_config(root_conf)?;
        self.root.update_sort_type();
        Self::update_queues(&root_conf.queues, &self.root)
    }

    /// Update one level of the queue tree from a reloaded config
    ///
    /// # Arguments
    ///
    /// * `confs` - The configs of the queues at this level
    /// * `parent` - The queue these configs live under
    fn update_queues(confs: &[QueueConfig], parent: &Arc<Queue>) -> Result<(), Error> {
        let mut visited = Vec::with_capacity(confs.len());
        for conf in confs {
            let name = conf.name.to_lowercase();
            let queue = match parent.get_child(&name) {
                Some(queue) => {
                    queue.apply_config(conf)?;
                    queue
                }
                None => Queue::managed(conf, Some(parent))?,
            };
            queue.update_sort_type();
            Self::update_queues(&conf.queues, &queue)?;
            visited.push(name);
        }
        // everything the new config does not mention drains away
        for child in parent.children() {
            if child.is_managed() && !visited.iter().any(|name| name == child.name()) {
                child.mark_for_removal();
            }
        }
        Ok(())
    }

    /// Mark this partition for removal
    pub fn mark_for_removal(&self) {
        let mut state = self.state.write().unwrap();
        if let Err(error) = state.lifecycle.handle(ObjectEvent::Remove) {
            event!(
                Level::WARN,
                partition = self.name,
                error = %error,
                msg = "failed to mark partition for removal"
            );
        }
    }

    /// Check if this partition only drains existing work
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.state.read().unwrap().lifecycle.is_draining()
    }

    /// Check if this partition takes part in scheduling
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.read().unwrap().lifecycle.is_running()
    }

    /// Check if this partition is out of scheduling entirely
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state.read().unwrap().lifecycle.is_stopped()
    }

    /// Stop this partition entirely
    pub fn stop(&self) {
        let mut state = self.state.write().unwrap();
        if let Err(error) = state.lifecycle.handle(ObjectEvent::Stop) {
            event!(
                Level::WARN,
                partition = self.name,
                error = %error,
                msg = "failed to stop partition"
            );
        }
    }

    /// Check if allocations in this partition may be preempted
    #[must_use]
    pub fn is_preemptable(&self) -> bool {
        self.state.read().unwrap().preemptable
    }

    /// Get a queue by its full path
    ///
    /// # Arguments
    ///
    /// * `path` - The full dotted path of the queue
    #[must_use]
    pub fn get_queue(&self, path: &str) -> Option<Arc<Queue>> {
        let parts: Vec<String> = path
            .to_lowercase()
            .split(DOT)
            .map(ToOwned::to_owned)
            .collect();
        if parts.is_empty() || parts[0] != ROOT_QUEUE {
            return None;
        }
        let mut queue = self.root.clone();
        for part in &parts[1..] {
            queue = queue.get_child(part)?;
        }
        Some(queue)
    }

    /// Get the root queue of this partition
    #[must_use]
    pub fn root_queue(&self) -> Arc<Queue> {
        self.root.clone()
    }

    /// Add a new application to this partition
    ///
    /// Placement resolves the target queue when rules are configured, the
    /// submitted queue name is used as given otherwise.
    ///
    /// # Arguments
    ///
    /// * `app` - The application to add
    #[instrument(name = "PartitionContext::add_application", skip_all, fields(partition = self.name, app = app.application_id))]
    pub fn add_application(&self, app: Arc<Application>) -> Result<(), Error> {
        let mut state = self.state.write().unwrap();
        if state.lifecycle.is_draining() || state.lifecycle.is_stopped() {
            return Err(Error::State(format!(
                "partition {} is stopped, cannot add application {}",
                self.name, app.application_id
            )));
        }
        if state.applications.contains_key(&app.application_id) {
            return Err(Error::Validation(format!(
                "application {} already exists in partition {}",
                app.application_id, self.name
            )));
        }
        // work out where the application should land
        let (queue_path, create, acl_exempt) = if state.placement.is_initialised() {
            let outcome = state.placement.place(&app)?;
            app.set_queue_name(outcome.queue_path.clone());
            (outcome.queue_path, outcome.create, outcome.acl_exempt)
        } else {
            (app.queue_name().to_lowercase(), false, false)
        };
        let queue = match self.get_queue(&queue_path) {
            Some(queue) => queue,
            None if !state.placement.is_initialised() => {
                return Err(Error::Validation(format!(
                    "application {} rejected, cannot create queue {} without placement rules",
                    app.application_id, queue_path
                )));
            }
            None if !create => {
                return Err(Error::Validation(format!(
                    "application {} rejected, queue {} does not exist",
                    app.application_id, queue_path
                )));
            }
            None => self.create_queue(&queue_path, &app.user(), acl_exempt)?,
        };
        // the target must be a leaf the submitter may use
        if !queue.is_leaf() {
            return Err(Error::Validation(format!(
                "application {} rejected, queue {} is not a leaf queue",
                app.application_id, queue_path
            )));
        }
        if !acl_exempt && !queue.check_submit_access(&app.user()) {
            return Err(Error::Validation(format!(
                "application {} rejected, user {} has no submit access to queue {}",
                app.application_id,
                app.user().user,
                queue_path
            )));
        }
        queue.add_application(&app)?;
        app.set_queue(&queue);
        app.accept();
        state.applications.insert(app.application_id.clone(), app);
        Ok(())
    }

    /// Create the missing queues down to a rule produced leaf
    ///
    /// The lowest existing ancestor carries the ACL check and must be able
    /// to hold children.
    ///
    /// # Arguments
    ///
    /// * `path` - The full path of the leaf to create
    /// * `user` - The user the queues are created for
    /// * `acl_exempt` - Whether the ACL check is skipped
    fn create_queue(
        &self,
        path: &str,
        user: &UserGroup,
        acl_exempt: bool,
    ) -> Result<Arc<Queue>, Error> {
        if !path.starts_with(ROOT_QUEUE) || !path.contains(DOT) {
            return Err(Error::Validation(format!("illegal queue name passed in: {path}")));
        }
        // walk up until something exists, remembering what to create
        let mut to_create: Vec<&str> = Vec::default();
        let mut current = path;
        let mut queue = self.get_queue(current);
        while queue.is_none() {
            let split = current.rfind(DOT).ok_or_else(|| {
                Error::Validation(format!("illegal queue name passed in: {path}"))
            })?;
            to_create.push(&current[split + 1..]);
            current = &current[..split];
            queue = self.get_queue(current);
        }
        let mut queue = queue.unwrap_or_else(|| self.root.clone());
        // the existing parent is the lowest place to check access
        if !acl_exempt && !queue.check_submit_access(user) {
            return Err(Error::Validation(format!(
                "submit access to queue {current} denied during create of {path}"
            )));
        }
        if queue.is_leaf() {
            return Err(Error::Validation(format!(
                "creation of queue {path} failed, parent {current} is already a leaf"
            )));
        }
        event!(
            Level::DEBUG,
            parent = current,
            path = path,
            msg = "creating dynamic queues"
        );
        for (position, name) in to_create.iter().enumerate().rev() {
            // only the last created queue holds applications
            queue = Queue::dynamic(name, position == 0, &queue)?;
        }
        Ok(queue)
    }

    /// Remove an application and everything it holds
    ///
    /// Returns the allocations that were released so the caller can notify
    /// the resource manager.
    ///
    /// # Arguments
    ///
    /// * `application_id` - The application to remove
    #[instrument(name = "PartitionContext::remove_application", skip_all, fields(partition = self.name, app = application_id))]
    pub fn remove_application(&self, application_id: &str) -> Vec<Allocation> {
        let mut state = self.state.write().unwrap();
        let Some(app) = state.applications.remove(application_id) else {
            return Vec::default();
        };
        state.reserved_apps.remove(application_id);
        // drop all asks which also cancels every reservation they held
        app.remove_asks("");
        // unhook the application from its queue
        if let Some(queue) = app.queue() {
            queue.remove_application(application_id);
        }
        // release the allocations, the queue books are lowered in the call
        let released = app.remove_all_allocations();
        for alloc in &released {
            if state.allocations.remove(&alloc.uuid).is_none() {
                event!(
                    Level::WARN,
                    app = application_id,
                    uuid = %alloc.uuid,
                    msg = "allocation not found on the partition"
                );
            }
            match state.nodes.get(&alloc.node_id) {
                Some(node) => {
                    if node.remove_allocation(&alloc.uuid).is_none() {
                        event!(
                            Level::WARN,
                            app = application_id,
                            uuid = %alloc.uuid,
                            node = alloc.node_id,
                            msg = "allocation not found on the node"
                        );
                    }
                }
                None => {
                    event!(
                        Level::WARN,
                        app = application_id,
                        node = alloc.node_id,
                        msg = "node not found while removing application"
                    );
                }
            }
        }
        app.complete();
        event!(
            Level::DEBUG,
            app = application_id,
            released = released.len(),
            msg = "application removed from the scheduler"
        );
        released
    }

    /// Get an application by its id
    ///
    /// # Arguments
    ///
    /// * `application_id` - The application to get
    #[must_use]
    pub fn get_application(&self, application_id: &str) -> Option<Arc<Application>> {
        self.state.read().unwrap().applications.get(application_id).cloned()
    }

    /// Get a snapshot of the applications in this partition
    #[must_use]
    pub fn applications(&self) -> Vec<Arc<Application>> {
        self.state.read().unwrap().applications.values().cloned().collect()
    }

    /// Get a snapshot of the reservation counts per application
    #[must_use]
    pub fn reservations(&self) -> HashMap<String, usize> {
        self.state.read().unwrap().reserved_apps.clone()
    }

    /// Add a node and replay the allocations it reported
    ///
    /// A failed replay removes the node again so a half registered node
    /// never stays behind.
    ///
    /// # Arguments
    ///
    /// * `node` - The node to add
    /// * `existing_allocations` - The allocations recovered from the node
    #[instrument(name = "PartitionContext::add_node", skip_all, fields(partition = self.name, node = node.node_id()))]
    pub fn add_node(
        &self,
        node: Arc<Node>,
        existing_allocations: Vec<Allocation>,
    ) -> Result<(), Error> {
        let mut state = self.state.write().unwrap();
        if state.lifecycle.is_draining() || state.lifecycle.is_stopped() {
            return Err(Error::State(format!(
                "partition {} is stopped, cannot add node {}",
                self.name,
                node.node_id()
            )));
        }
        if state.nodes.contains_key(node.node_id()) {
            return Err(Error::Validation(format!(
                "partition {} already has a node {}, node names must be unique",
                self.name,
                node.node_id()
            )));
        }
        // new capacity raises the partition total and the root maximum
        state.total.add_to(&node.capacity());
        self.root.set_max_resource(state.total.clone());
        state.nodes.insert(node.node_id().to_owned(), node.clone());
        // replay what the node already runs
        if !existing_allocations.is_empty() {
            event!(
                Level::INFO,
                node = node.node_id(),
                existing = existing_allocations.len(),
                msg = "adding existing allocations"
            );
            for alloc in existing_allocations {
                if let Err(error) = self.add_recovered_allocation(&mut state, alloc) {
                    let released = self.remove_node_internal(&mut state, node.node_id());
                    event!(
                        Level::WARN,
                        node = node.node_id(),
                        released = released.len(),
                        error = %error,
                        msg = "failed to add existing allocations, node removed"
                    );
                    return Err(error);
                }
            }
        }
        event!(Level::INFO, node = node.node_id(), msg = "node added to partition");
        Ok(())
    }

    /// Replay one recovered allocation into the books
    ///
    /// Queue maximums are not checked: the capacity already exists in the
    /// cluster.
    ///
    /// # Arguments
    ///
    /// * `state` - The locked partition state
    /// * `alloc` - The recovered allocation
    fn add_recovered_allocation(
        &self,
        state: &mut PartitionState,
        alloc: Allocation,
    ) -> Result<(), Error> {
        if state.lifecycle.is_stopped() {
            return Err(Error::State(format!(
                "partition {} is stopped, cannot add allocation {}",
                self.name, alloc.allocation_key
            )));
        }
        if state.allocations.contains_key(&alloc.uuid) {
            return Err(Error::Validation(format!(
                "recovered allocation {} already exists in partition {}",
                alloc.uuid, self.name
            )));
        }
        let node = state.nodes.get(&alloc.node_id).ok_or_else(|| {
            Error::NotFound(format!("failed to find node {}", alloc.node_id))
        })?;
        let app = state.applications.get(&alloc.application_id).ok_or_else(|| {
            Error::NotFound(format!("failed to find application {}", alloc.application_id))
        })?;
        let queue = app.queue().ok_or_else(|| {
            Error::NotFound(format!(
                "application {} has no queue assigned",
                alloc.application_id
            ))
        })?;
        if !node.is_schedulable() {
            return Err(Error::State(format!(
                "node {} is not in a schedulable state",
                node.node_id()
            )));
        }
        // raise the books bottom up, node reported skips the cap checks
        queue.inc_allocated(&alloc.resource, true)?;
        if let Err(error) = node.add_allocation(alloc.clone()) {
            let _ = queue.dec_allocated(&alloc.resource);
            return Err(error);
        }
        app.recover_ask(&alloc.ask);
        app.add_allocation(alloc.clone());
        event!(
            Level::DEBUG,
            app = alloc.application_id,
            uuid = %alloc.uuid,
            msg = "recovered allocation"
        );
        state.allocations.insert(alloc.uuid, alloc);
        Ok(())
    }

    /// Remove a node and detach everything it held
    ///
    /// Returns the allocations that were released with the node.
    ///
    /// # Arguments
    ///
    /// * `node_id` - The node to remove
    #[instrument(name = "PartitionContext::remove_node", skip_all, fields(partition = self.name, node = node_id))]
    pub fn remove_node(&self, node_id: &str) -> Vec<Allocation> {
        let mut state = self.state.write().unwrap();
        self.remove_node_internal(&mut state, node_id)
    }

    /// Remove a node while already holding the partition lock
    ///
    /// # Arguments
    ///
    /// * `state` - The locked partition state
    /// * `node_id` - The node to remove
    fn remove_node_internal(&self, state: &mut PartitionState, node_id: &str) -> Vec<Allocation> {
        let Some(node) = state.nodes.remove(node_id) else {
            event!(Level::DEBUG, node = node_id, msg = "node was not found");
            return Vec::default();
        };
        // detach the allocations from their applications and queues
        let mut released = Vec::default();
        for alloc in node.allocations() {
            let Some(app) = state.applications.get(&alloc.application_id) else {
                event!(
                    Level::INFO,
                    app = alloc.application_id,
                    node = node_id,
                    msg = "app not found, skipping while removing the node"
                );
                continue;
            };
            if app.remove_allocation(&alloc.uuid).is_none() {
                event!(
                    Level::INFO,
                    app = alloc.application_id,
                    uuid = %alloc.uuid,
                    msg = "allocation not found, skipping while removing the node"
                );
                continue;
            }
            if let Some(queue) = app.queue() {
                if let Err(error) = queue.dec_allocated(&alloc.resource) {
                    event!(
                        Level::WARN,
                        app = alloc.application_id,
                        error = %error,
                        msg = "failed to release resources from queue"
                    );
                }
            }
            state.allocations.remove(&alloc.uuid);
            released.push(alloc);
        }
        // lower the totals now that the capacity left the cluster
        state.total = state.total.sub_floor(&node.capacity());
        self.root.set_max_resource(state.total.clone());
        // credit back the reservations held on the node
        for (application_id, count) in node.unreserve_apps() {
            if let Some(app) = state.applications.get(&application_id) {
                app.unreserve_node(node_id);
                if let Some(queue) = app.queue() {
                    queue.unreserve(&application_id, count);
                }
            }
            Self::unreserve_count(state, &application_id, count);
        }
        event!(Level::INFO, node = node_id, released = released.len(), msg = "node removed");
        released
    }

    /// Get a node by its id
    ///
    /// # Arguments
    ///
    /// * `node_id` - The node to get
    #[must_use]
    pub fn get_node(&self, node_id: &str) -> Option<Arc<Node>> {
        self.state.read().unwrap().nodes.get(node_id).cloned()
    }

    /// Get a snapshot of the nodes in this partition
    #[must_use]
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.state.read().unwrap().nodes.values().cloned().collect()
    }

    /// Apply a resource manager update to a node
    ///
    /// # Arguments
    ///
    /// * `node_id` - The node to update
    /// * `occupied` - The new outside consumption when reported
    /// * `schedulable` - The new schedulable flag when reported
    pub fn update_node(
        &self,
        node_id: &str,
        occupied: Option<Resource>,
        schedulable: Option<bool>,
    ) -> Result<(), Error> {
        let node = self.get_node(node_id).ok_or_else(|| {
            Error::NotFound(format!("node {node_id} not found in partition {}", self.name))
        })?;
        if let Some(occupied) = occupied {
            node.set_occupied(occupied);
        }
        if let Some(schedulable) = schedulable {
            node.set_schedulable(schedulable);
        }
        Ok(())
    }

    /// Build the node iterator for one allocation attempt
    ///
    /// The snapshot excludes unschedulable nodes, and reserved nodes when
    /// asked, and is ordered by the partitions node sort policy.
    ///
    /// # Arguments
    ///
    /// * `exclude_reserved` - Whether reserved nodes are left out
    fn node_iterator(&self, exclude_reserved: bool) -> Option<NodeIterator> {
        let (mut nodes, policy) = {
            let state = self.state.read().unwrap();
            let nodes: Vec<Arc<Node>> = state
                .nodes
                .values()
                .filter(|node| node.is_schedulable() && !(exclude_reserved && node.is_reserved()))
                .cloned()
                .collect();
            (nodes, state.node_sort)
        };
        if nodes.is_empty() {
            return None;
        }
        sort_nodes(&mut nodes, policy);
        Some(NodeIterator::new(nodes))
    }

    /// Try one regular allocation for this partition
    ///
    /// The descent over the queue tree runs without the partition lock and
    /// the result is committed under it. Returns the committed allocation
    /// for the resource manager.
    #[instrument(name = "PartitionContext::try_allocate", skip_all, fields(partition = self.name))]
    pub fn try_allocate(&self) -> Option<Allocation> {
        if self.is_stopped() {
            return None;
        }
        // nothing pending anywhere means nothing to do
        if !self.root.pending_resource().strictly_positive() {
            return None;
        }
        let alloc = self.root.try_allocate(&|| self.node_iterator(true))?;
        self.allocate(alloc)
    }

    /// Try to satisfy or clean up one reservation for this partition
    #[instrument(name = "PartitionContext::try_reserved_allocate", skip_all, fields(partition = self.name))]
    pub fn try_reserved_allocate(&self) -> Option<Allocation> {
        if self.is_stopped() {
            return None;
        }
        // without reservations there is nothing to work on
        if self.state.read().unwrap().reserved_apps.is_empty() {
            return None;
        }
        let alloc = self
            .root
            .try_reserved_allocate(&|| self.node_iterator(true))?;
        self.allocate(alloc)
    }

    /// Commit what the allocation descent found
    ///
    /// The application and node are fetched again under the partition lock:
    /// either may have been removed while the descent ran.
    ///
    /// # Arguments
    ///
    /// * `alloc` - The allocation the descent produced
    fn allocate(&self, mut alloc: Allocation) -> Option<Allocation> {
        let mut state = self.state.write().unwrap();
        // the application must still be there
        let Some(app) = state.applications.get(&alloc.application_id).cloned() else {
            event!(
                Level::INFO,
                app = alloc.application_id,
                msg = "application was removed while allocating"
            );
            self.roll_back_books(&alloc, None);
            return None;
        };
        match alloc.result {
            AllocationResult::Reserved => {
                // the reservation holds no queue books, just the slots
                if let Some(node) = state.nodes.get(&alloc.node_id).cloned() {
                    Self::reserve_internal(&mut state, &app, &node, &alloc.ask);
                }
                None
            }
            AllocationResult::Unreserved => {
                if let Some(node) = state.nodes.get(&alloc.node_id).cloned() {
                    Self::unreserve_internal(&mut state, &app, &node, &alloc.ask.allocation_key);
                }
                None
            }
            AllocationResult::Allocated | AllocationResult::AllocatedReserved => {
                // a promoted reservation gives its slots back first
                if alloc.result == AllocationResult::AllocatedReserved {
                    let held_on = alloc
                        .reserved_node_id
                        .clone()
                        .unwrap_or_else(|| alloc.node_id.clone());
                    if let Some(node) = state.nodes.get(&held_on).cloned() {
                        Self::unreserve_internal(&mut state, &app, &node, &alloc.ask.allocation_key);
                    }
                }
                // the target node must still be there
                let Some(node) = state.nodes.get(&alloc.node_id).cloned() else {
                    event!(
                        Level::INFO,
                        node = alloc.node_id,
                        app = alloc.application_id,
                        msg = "node was removed while allocating"
                    );
                    self.roll_back_books(&alloc, Some(&app));
                    return None;
                };
                // a uuid clash points at entropy problems, regenerate
                while state.allocations.contains_key(&alloc.uuid) {
                    let fresh = Uuid::new_v4();
                    event!(
                        Level::WARN,
                        uuid = %alloc.uuid,
                        fresh = %fresh,
                        msg = "uuid clash, random generator might be lacking entropy"
                    );
                    alloc.uuid = fresh;
                }
                if let Err(error) = node.add_allocation(alloc.clone()) {
                    event!(
                        Level::INFO,
                        node = alloc.node_id,
                        error = %error,
                        msg = "node filled up while allocating"
                    );
                    self.roll_back_books(&alloc, Some(&app));
                    return None;
                }
                app.add_allocation(alloc.clone());
                state.allocations.insert(alloc.uuid, alloc.clone());
                event!(
                    Level::INFO,
                    app = alloc.application_id,
                    key = alloc.allocation_key,
                    resource = %alloc.resource,
                    node = alloc.node_id,
                    msg = "scheduler allocation processed"
                );
                Some(alloc)
            }
        }
    }

    /// Undo the book keeping of a failed commit
    ///
    /// The descent raised the queue books and consumed an ask repeat before
    /// the commit could fail. Called with the partition lock held so only
    /// queue and application locks may be taken here.
    ///
    /// # Arguments
    ///
    /// * `alloc` - The allocation that failed to commit
    /// * `app` - The application to give the ask repeat back to, when it
    ///   still exists
    fn roll_back_books(&self, alloc: &Allocation, app: Option<&Arc<Application>>) {
        if matches!(
            alloc.result,
            AllocationResult::Reserved | AllocationResult::Unreserved
        ) {
            return;
        }
        if let Some(queue) = self.get_queue(&alloc.queue_path) {
            if let Err(error) = queue.dec_allocated(&alloc.resource) {
                event!(
                    Level::WARN,
                    queue = alloc.queue_path,
                    error = %error,
                    msg = "failed to roll back queue books"
                );
            }
        }
        if let Some(app) = app {
            app.restore_ask(&alloc.allocation_key);
        }
    }

    /// Book a reservation on the partition
    ///
    /// # Arguments
    ///
    /// * `state` - The locked partition state
    /// * `app` - The application holding the reservation
    /// * `node` - The node the reservation is held on
    /// * `ask` - The ask the reservation is held for
    fn reserve_internal(
        state: &mut PartitionState,
        app: &Arc<Application>,
        node: &Arc<Node>,
        ask: &AllocationAsk,
    ) {
        // an application reserves a node at most once
        if app.is_reserved_on(node.node_id()) {
            event!(
                Level::INFO,
                app = app.application_id,
                node = node.node_id(),
                msg = "application is already reserved on node"
            );
            return;
        }
        if let Err(error) = app.reserve(node, ask) {
            event!(
                Level::DEBUG,
                app = app.application_id,
                error = %error,
                msg = "failed to handle reservation"
            );
            return;
        }
        if let Some(queue) = app.queue() {
            queue.reserve(&app.application_id);
        }
        *state
            .reserved_apps
            .entry(app.application_id.clone())
            .or_insert(0) += 1;
        event!(
            Level::INFO,
            app = app.application_id,
            key = ask.allocation_key,
            node = node.node_id(),
            msg = "allocation ask is reserved"
        );
    }

    /// Drop a reservation from the partition books
    ///
    /// # Arguments
    ///
    /// * `state` - The locked partition state
    /// * `app` - The application dropping the reservation
    /// * `node` - The node the reservation was held on
    /// * `allocation_key` - The ask the reservation was held for
    fn unreserve_internal(
        state: &mut PartitionState,
        app: &Arc<Application>,
        node: &Arc<Node>,
        allocation_key: &str,
    ) {
        if state.reserved_apps.get(&app.application_id).copied().unwrap_or(0) == 0 {
            event!(
                Level::INFO,
                app = app.application_id,
                msg = "application is not reserved in partition"
            );
            return;
        }
        let removed = app.unreserve(node, allocation_key);
        if let Some(queue) = app.queue() {
            queue.unreserve(&app.application_id, removed);
        }
        Self::unreserve_count(state, &app.application_id, removed);
        event!(
            Level::INFO,
            app = app.application_id,
            key = allocation_key,
            node = node.node_id(),
            removed = removed,
            msg = "allocation ask is unreserved"
        );
    }

    /// Lower the reservation counter for an application
    ///
    /// # Arguments
    ///
    /// * `state` - The locked partition state
    /// * `application_id` - The application to lower the counter for
    /// * `count` - How many reservations were dropped
    fn unreserve_count(state: &mut PartitionState, application_id: &str, count: usize) {
        if let Some(held) = state.reserved_apps.get_mut(application_id) {
            if *held <= count {
                state.reserved_apps.remove(application_id);
            } else {
                *held -= count;
            }
        }
    }

    /// Remove allocations released by the resource manager
    ///
    /// Returns the released allocations.
    ///
    /// # Arguments
    ///
    /// * `application_id` - The application releasing allocations
    /// * `uuid` - The allocation to release, none releases all
    pub fn remove_allocation(&self, application_id: &str, uuid: Option<Uuid>) -> Vec<Allocation> {
        let mut state = self.state.write().unwrap();
        let Some(app) = state.applications.get(application_id).cloned() else {
            return Vec::default();
        };
        let released = match uuid {
            // the queue books are lowered inside the application call
            None => app.remove_all_allocations(),
            Some(uuid) => match app.remove_allocation(&uuid) {
                Some(alloc) => {
                    if let Some(queue) = app.queue() {
                        if let Err(error) = queue.dec_allocated(&alloc.resource) {
                            event!(
                                Level::WARN,
                                app = application_id,
                                error = %error,
                                msg = "failed to release resources from queue"
                            );
                        }
                    }
                    vec![alloc]
                }
                None => Vec::default(),
            },
        };
        // detach the released allocations from their nodes
        for alloc in &released {
            match state.nodes.get(&alloc.node_id) {
                Some(node) => {
                    if node.remove_allocation(&alloc.uuid).is_none() {
                        event!(
                            Level::INFO,
                            app = application_id,
                            uuid = %alloc.uuid,
                            msg = "node allocation not found while releasing resources"
                        );
                    }
                }
                None => {
                    event!(
                        Level::INFO,
                        app = application_id,
                        node = alloc.node_id,
                        msg = "node not found while releasing resources"
                    );
                }
            }
            state.allocations.remove(&alloc.uuid);
        }
        released
    }

    /// Remove pending asks released by the resource manager
    ///
    /// # Arguments
    ///
    /// * `application_id` - The application releasing asks
    /// * `allocation_key` - The ask to release, empty releases all
    pub fn remove_allocation_ask(&self, application_id: &str, allocation_key: &str) {
        let mut state = self.state.write().unwrap();
        let Some(app) = state.applications.get(application_id).cloned() else {
            return;
        };
        let cancelled = app.remove_asks(allocation_key);
        if cancelled != 0 {
            event!(
                Level::INFO,
                app = application_id,
                key = allocation_key,
                cancelled = cancelled,
                msg = "released reserved asks"
            );
            if let Some(queue) = app.queue() {
                queue.unreserve(application_id, cancelled);
            }
            Self::unreserve_count(&mut state, application_id, cancelled);
        }
    }

    /// Add a pending ask to an application in this partition
    ///
    /// # Arguments
    ///
    /// * `application_id` - The application asking for resources
    /// * `ask` - The ask to add
    pub fn add_allocation_ask(&self, application_id: &str, ask: AllocationAsk) -> Result<(), Error> {
        if self.is_stopped() {
            return Err(Error::State(format!(
                "partition {} is stopped, cannot add ask {}",
                self.name, ask.allocation_key
            )));
        }
        let app = self.get_application(application_id).ok_or_else(|| {
            Error::NotFound(format!(
                "application {application_id} not found in partition {}",
                self.name
            ))
        })?;
        app.add_ask(ask)
    }

    /// Replay allocations recovered outside a node registration
    ///
    /// # Arguments
    ///
    /// * `allocations` - The recovered allocations to replay
    pub fn add_recovered_allocations(&self, allocations: Vec<Allocation>) -> Result<(), Error> {
        let mut state = self.state.write().unwrap();
        for alloc in allocations {
            self.add_recovered_allocation(&mut state, alloc)?;
        }
        Ok(())
    }

    /// Remove drained and idle queues from the tree
    ///
    /// Draining queues leave once they are empty, dynamic queues leave as
    /// soon as nothing uses them.
    pub fn clean_queues(&self) {
        Self::clean_queue(&self.root);
    }

    /// Clean one queue and everything below it
    ///
    /// # Arguments
    ///
    /// * `queue` - The queue to clean
    fn clean_queue(queue: &Arc<Queue>) {
        for child in queue.children() {
            Self::clean_queue(&child);
        }
        if queue.is_draining() || !queue.is_managed() {
            queue.remove_queue();
        }
    }

    /// Collect a snapshot of every pending ask in this partition
    #[must_use]
    pub fn calculate_outstanding_requests(&self) -> Vec<AllocationAsk> {
        if !self.root.pending_resource().strictly_positive() {
            return Vec::default();
        }
        let mut outstanding = Vec::default();
        self.root.collect_outstanding(&mut outstanding);
        outstanding
    }

    /// Get the sum of all node capacities in this partition
    #[must_use]
    pub fn total_partition_resource(&self) -> Resource {
        self.state.read().unwrap().total.clone()
    }

    /// Get the resources allocated across this partition
    #[must_use]
    pub fn allocated_resource(&self) -> Resource {
        self.root.allocated_resource()
    }

    /// Get the number of applications in this partition
    #[must_use]
    pub fn application_count(&self) -> usize {
        self.state.read().unwrap().applications.len()
    }

    /// Get the number of nodes in this partition
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.state.read().unwrap().nodes.len()
    }

    /// Get the number of committed allocations in this partition
    #[must_use]
    pub fn allocation_count(&self) -> usize {
        self.state.read().unwrap().allocations.len()
    }

    /// Get the info snapshot of the whole queue tree
    #[must_use]
    pub fn queue_info(&self) -> QueueInfo {
        self.root.queue_info()
    }

    /// Bucket the nodes by how much of each resource they use
    ///
    /// Every resource name maps to ten buckets where bucket N counts the
    /// nodes with an allocated share between N*10% and (N+1)*10%.
    #[must_use]
    pub fn calculate_nodes_resource_usage(&self) -> NodeUsageMap {
        let nodes = self.nodes();
        let mut usage: NodeUsageMap = NodeUsageMap::default();
        for node in nodes {
            let capacity = node.capacity();
            let allocated = node.allocated_resource();
            for (name, total) in capacity.iter() {
                if *total > 0 {
                    let share = allocated.get(name) as f64 / *total as f64;
                    let bucket = (((share * 10.0).ceil() - 1.0).max(0.0) as usize).min(9);
                    let distribution = usage.entry(name.clone()).or_insert_with(|| vec![0; 10]);
                    distribution[bucket] += 1;
                }
            }
        }
        usage
    }
}
