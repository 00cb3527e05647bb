//! The cluster context fanning resource manager traffic out to partitions
//!
//! Every resource manager owns its own set of partitions. The cluster maps
//! each request onto the right partition and collects the responses the
//! wire layer hands back to the resource manager.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{event, instrument, Level};
use uuid::Uuid;

use crate::models::{resolve_user, PartitionConfig, Resource};
use crate::Error;
use super::objects::{Allocation, AllocationAsk, Application, Node, TerminationReason};
use super::partition::PartitionContext;

/// A node registration from a resource manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNodeRequest {
    /// The id of the new node
    pub node_id: String,
    /// The partition the node belongs to
    pub partition: String,
    /// The total capacity of the node
    pub capacity: Resource,
    /// The resources consumed outside the schedulers books
    pub occupied: Resource,
    /// The allocations already running on the node
    pub existing_allocations: Vec<Allocation>,
}

/// A node state update from a resource manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateNodeRequest {
    /// The id of the node to update
    pub node_id: String,
    /// The partition the node belongs to
    pub partition: String,
    /// The new outside consumption when reported
    pub occupied: Option<Resource>,
    /// The new schedulable flag when reported
    pub schedulable: Option<bool>,
}

/// A node removal from a resource manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveNodeRequest {
    /// The id of the node to remove
    pub node_id: String,
    /// The partition the node belongs to
    pub partition: String,
}

/// An application submission from a resource manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewApplicationRequest {
    /// The id of the new application
    pub application_id: String,
    /// The partition the application is submitted to
    pub partition: String,
    /// The queue the submitter asked for
    pub queue_name: String,
    /// The submitting user
    pub user: String,
    /// Free form labels the submitter attached
    pub tags: HashMap<String, String>,
}

/// An application removal from a resource manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveApplicationRequest {
    /// The id of the application to remove
    pub application_id: String,
    /// The partition the application lives in
    pub partition: String,
}

/// A new ask from a resource manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAskRequest {
    /// The key identifying this ask within its application
    pub allocation_key: String,
    /// The application asking for resources
    pub application_id: String,
    /// The partition the application lives in
    pub partition: String,
    /// The resources one repeat of the ask needs
    pub resource: Resource,
    /// How many repeats are requested
    pub max_allocations: u64,
    /// The priority of the ask
    pub priority: i32,
    /// Whether the ask is a placeholder
    pub placeholder: bool,
}

/// An ask release from a resource manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskReleaseRequest {
    /// The application releasing asks
    pub application_id: String,
    /// The partition the application lives in
    pub partition: String,
    /// The ask to release, empty releases all
    pub allocation_key: String,
}

/// An allocation release from a resource manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationReleaseRequest {
    /// The application releasing allocations
    pub application_id: String,
    /// The partition the application lives in
    pub partition: String,
    /// The allocation to release, none releases all
    pub uuid: Option<Uuid>,
}

/// An allocation recovered outside a node registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveredAllocationRequest {
    /// The partition the allocation belongs to
    pub partition: String,
    /// The recovered allocation
    pub allocation: Allocation,
}

/// An allocation handed back to the resource manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationRelease {
    /// The released allocation
    pub allocation: Allocation,
    /// Why the allocation was released
    pub reason: TerminationReason,
}

/// An application the core refused
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedApplication {
    /// The id of the refused application
    pub application_id: String,
    /// Why the application was refused
    pub reason: String,
}

/// A node the core refused
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedNode {
    /// The id of the refused node
    pub node_id: String,
    /// Why the node was refused
    pub reason: String,
}

/// An ask the core refused
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedAsk {
    /// The key of the refused ask
    pub allocation_key: String,
    /// The application the ask belonged to
    pub application_id: String,
    /// Why the ask was refused
    pub reason: String,
}

/// What an update call hands back to the resource manager
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct UpdateResponse {
    /// The allocations released back to the resource manager
    pub released_allocations: Vec<AllocationRelease>,
    /// The applications the core refused
    pub rejected_applications: Vec<RejectedApplication>,
    /// The nodes the core refused
    pub rejected_nodes: Vec<RejectedNode>,
    /// The asks the core refused
    pub rejected_asks: Vec<RejectedAsk>,
}

/// The partitions of every registered resource manager
pub struct ClusterContext {
    /// The partitions by resource manager and partition name
    partitions: RwLock<HashMap<String, HashMap<String, Arc<PartitionContext>>>>,
}

impl Default for ClusterContext {
    fn default() -> Self {
        ClusterContext::new()
    }
}

impl ClusterContext {
    /// Create an empty cluster context
    #[must_use]
    pub fn new() -> Self {
        ClusterContext {
            partitions: RwLock::new(HashMap::default()),
        }
    }

    /// Register a resource manager and build its partitions
    ///
    /// # Arguments
    ///
    /// * `rm_id` - The id of the resource manager
    /// * `configs` - The partition configs to build
    #[instrument(name = "ClusterContext::register_rm", skip_all, fields(rm = rm_id))]
    pub fn register_rm(&self, rm_id: &str, configs: &[PartitionConfig]) -> Result<(), Error> {
        let mut partitions = self.partitions.write().unwrap();
        if partitions.contains_key(rm_id) {
            return Err(Error::Validation(format!(
                "resource manager {rm_id} is already registered, reload the config instead"
            )));
        }
        // build every partition before any of them becomes visible
        let mut built = HashMap::with_capacity(configs.len());
        for conf in configs {
            let partition = PartitionContext::new(conf, rm_id)?;
            built.insert(partition.name.clone(), Arc::new(partition));
        }
        partitions.insert(rm_id.to_owned(), built);
        event!(Level::INFO, rm = rm_id, msg = "resource manager registered");
        Ok(())
    }

    /// Reload the partition configs for a resource manager
    ///
    /// The whole reload is validated first: a bad config leaves every
    /// partition on its previous config. Partitions the new config dropped
    /// start draining.
    ///
    /// # Arguments
    ///
    /// * `rm_id` - The id of the resource manager
    /// * `configs` - The new partition configs
    #[instrument(name = "ClusterContext::reload_config", skip_all, fields(rm = rm_id))]
    pub fn reload_config(&self, rm_id: &str, configs: &[PartitionConfig]) -> Result<(), Error> {
        // reject the reload as a whole before anything changes
        for conf in configs {
            conf.validate()?;
        }
        let mut partitions = self.partitions.write().unwrap();
        let existing = partitions.get_mut(rm_id).ok_or_else(|| {
            Error::NotFound(format!("resource manager {rm_id} is not registered"))
        })?;
        for conf in configs {
            match existing.get(&conf.name) {
                Some(partition) => partition.update(conf)?,
                None => {
                    let partition = PartitionContext::new(conf, rm_id)?;
                    existing.insert(partition.name.clone(), Arc::new(partition));
                }
            }
        }
        // partitions the new config does not mention drain away
        for (name, partition) in existing.iter() {
            if !configs.iter().any(|conf| &conf.name == name) {
                partition.mark_for_removal();
            }
        }
        event!(Level::INFO, rm = rm_id, msg = "config reloaded");
        Ok(())
    }

    /// Handle a resource manager going away
    ///
    /// Every partition of the resource manager starts draining.
    ///
    /// # Arguments
    ///
    /// * `rm_id` - The id of the resource manager
    pub fn remove_rm(&self, rm_id: &str) {
        let partitions = self.partitions.read().unwrap();
        if let Some(owned) = partitions.get(rm_id) {
            for partition in owned.values() {
                partition.mark_for_removal();
            }
            event!(Level::INFO, rm = rm_id, msg = "resource manager partitions draining");
        }
    }

    /// Get a partition of a resource manager
    ///
    /// # Arguments
    ///
    /// * `rm_id` - The id of the resource manager
    /// * `partition` - The name of the partition
    #[must_use]
    pub fn get_partition(&self, rm_id: &str, partition: &str) -> Option<Arc<PartitionContext>> {
        self.partitions
            .read()
            .unwrap()
            .get(rm_id)
            .and_then(|owned| owned.get(partition))
            .cloned()
    }

    /// Get every partition of a resource manager
    ///
    /// # Arguments
    ///
    /// * `rm_id` - The id of the resource manager
    #[must_use]
    pub fn partitions(&self, rm_id: &str) -> Vec<Arc<PartitionContext>> {
        self.partitions
            .read()
            .unwrap()
            .get(rm_id)
            .map(|owned| owned.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Look a partition up or explain why it is missing
    ///
    /// # Arguments
    ///
    /// * `rm_id` - The id of the resource manager
    /// * `partition` - The name of the partition
    fn partition(&self, rm_id: &str, partition: &str) -> Result<Arc<PartitionContext>, Error> {
        self.get_partition(rm_id, partition).ok_or_else(|| {
            Error::NotFound(format!(
                "partition {partition} not found for resource manager {rm_id}"
            ))
        })
    }

    /// Apply node adds, removes and updates from a resource manager
    ///
    /// # Arguments
    ///
    /// * `rm_id` - The id of the resource manager
    /// * `adds` - The nodes to register
    /// * `removes` - The nodes to remove
    /// * `updates` - The node state updates to apply
    #[instrument(name = "ClusterContext::update_node", skip_all, fields(rm = rm_id))]
    pub fn update_node(
        &self,
        rm_id: &str,
        adds: Vec<NewNodeRequest>,
        removes: Vec<RemoveNodeRequest>,
        updates: Vec<UpdateNodeRequest>,
    ) -> UpdateResponse {
        let mut response = UpdateResponse::default();
        for add in adds {
            let outcome = self.partition(rm_id, &add.partition).and_then(|partition| {
                let node = Arc::new(Node::new(
                    add.node_id.clone(),
                    add.capacity.clone(),
                    add.occupied.clone(),
                ));
                partition.add_node(node, add.existing_allocations)
            });
            if let Err(error) = outcome {
                response.rejected_nodes.push(RejectedNode {
                    node_id: add.node_id,
                    reason: error.to_string(),
                });
            }
        }
        for update in updates {
            let outcome = self.partition(rm_id, &update.partition).and_then(|partition| {
                partition.update_node(&update.node_id, update.occupied, update.schedulable)
            });
            if let Err(error) = outcome {
                response.rejected_nodes.push(RejectedNode {
                    node_id: update.node_id,
                    reason: error.to_string(),
                });
            }
        }
        for remove in removes {
            if let Ok(partition) = self.partition(rm_id, &remove.partition) {
                let released = partition.remove_node(&remove.node_id);
                response
                    .released_allocations
                    .extend(released.into_iter().map(|allocation| AllocationRelease {
                        allocation,
                        reason: TerminationReason::ReleasedByNodeRemoval,
                    }));
            }
        }
        response
    }

    /// Apply application adds and removes from a resource manager
    ///
    /// # Arguments
    ///
    /// * `rm_id` - The id of the resource manager
    /// * `adds` - The applications to submit
    /// * `removes` - The applications to remove
    #[instrument(name = "ClusterContext::update_application", skip_all, fields(rm = rm_id))]
    pub fn update_application(
        &self,
        rm_id: &str,
        adds: Vec<NewApplicationRequest>,
        removes: Vec<RemoveApplicationRequest>,
    ) -> UpdateResponse {
        let mut response = UpdateResponse::default();
        for add in adds {
            let outcome = self.partition(rm_id, &add.partition).and_then(|partition| {
                // the user group cache owns identity resolution
                let user = resolve_user(&add.user);
                let app = Arc::new(Application::new(
                    add.application_id.clone(),
                    add.partition.clone(),
                    add.queue_name.clone(),
                    user,
                    add.tags.clone(),
                ));
                partition.add_application(app)
            });
            if let Err(error) = outcome {
                response.rejected_applications.push(RejectedApplication {
                    application_id: add.application_id,
                    reason: error.to_string(),
                });
            }
        }
        for remove in removes {
            if let Ok(partition) = self.partition(rm_id, &remove.partition) {
                let released = partition.remove_application(&remove.application_id);
                response
                    .released_allocations
                    .extend(released.into_iter().map(|allocation| AllocationRelease {
                        allocation,
                        reason: TerminationReason::ReleasedByApp,
                    }));
                // removals may leave drained or idle queues behind
                partition.clean_queues();
            }
        }
        response
    }

    /// Apply ask and allocation traffic from a resource manager
    ///
    /// # Arguments
    ///
    /// * `rm_id` - The id of the resource manager
    /// * `asks` - The new asks to add
    /// * `ask_releases` - The asks to release
    /// * `allocation_releases` - The allocations to release
    /// * `recovered` - Allocations recovered outside a node registration
    #[instrument(name = "ClusterContext::update_allocation", skip_all, fields(rm = rm_id))]
    pub fn update_allocation(
        &self,
        rm_id: &str,
        asks: Vec<NewAskRequest>,
        ask_releases: Vec<AskReleaseRequest>,
        allocation_releases: Vec<AllocationReleaseRequest>,
        recovered: Vec<RecoveredAllocationRequest>,
    ) -> UpdateResponse {
        let mut response = UpdateResponse::default();
        for request in asks {
            let outcome = self.partition(rm_id, &request.partition).and_then(|partition| {
                let mut ask = AllocationAsk::new(
                    request.allocation_key.clone(),
                    request.application_id.clone(),
                    request.resource.clone(),
                    request.max_allocations,
                )
                .priority(request.priority);
                if request.placeholder {
                    ask = ask.placeholder();
                }
                partition.add_allocation_ask(&request.application_id, ask)
            });
            if let Err(error) = outcome {
                response.rejected_asks.push(RejectedAsk {
                    allocation_key: request.allocation_key,
                    application_id: request.application_id,
                    reason: error.to_string(),
                });
            }
        }
        for request in recovered {
            if let Ok(partition) = self.partition(rm_id, &request.partition) {
                if let Err(error) = partition.add_recovered_allocations(vec![request.allocation]) {
                    event!(
                        Level::WARN,
                        rm = rm_id,
                        error = %error,
                        msg = "failed to recover allocation"
                    );
                }
            }
        }
        for request in ask_releases {
            if let Ok(partition) = self.partition(rm_id, &request.partition) {
                partition.remove_allocation_ask(&request.application_id, &request.allocation_key);
            }
        }
        for request in allocation_releases {
            if let Ok(partition) = self.partition(rm_id, &request.partition) {
                let released = partition.remove_allocation(&request.application_id, request.uuid);
                response
                    .released_allocations
                    .extend(released.into_iter().map(|allocation| AllocationRelease {
                        allocation,
                        reason: TerminationReason::ReleasedByApp,
                    }));
            }
        }
        response
    }

    /// Run one allocation cycle over every partition
    ///
    /// Reservations get their shot first, then the regular descent runs.
    /// Returns the committed allocations for the resource managers.
    #[instrument(name = "ClusterContext::schedule_cycle", skip_all)]
    pub fn schedule_cycle(&self) -> Vec<Allocation> {
        // snapshot the partitions so scheduling never holds the cluster lock
        let partitions: Vec<Arc<PartitionContext>> = {
            let map = self.partitions.read().unwrap();
            map.values().flat_map(|owned| owned.values().cloned()).collect()
        };
        let mut committed = Vec::default();
        for partition in partitions {
            if let Some(alloc) = partition.try_reserved_allocate() {
                committed.push(alloc);
            }
            if let Some(alloc) = partition.try_allocate() {
                committed.push(alloc);
            }
        }
        committed
    }
}
