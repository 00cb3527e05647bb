//! The shared builders for tests driving whole partitions
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use hafnium::models::{
    PartitionConfig, PlacementRuleConfig, QueueConfig, QueueResourcesConfig, Resource, UserGroup,
};
use hafnium::scheduler::objects::{AllocationAsk, Application, Node};
use hafnium::scheduler::PartitionContext;

/// The resource manager id used across the tests
pub const RM_ID: &str = "test-rm";

/// The partition name used across the tests
pub const PARTITION: &str = "test";

/// Build a resource vector from literal pairs
pub fn res(pairs: &[(&str, u64)]) -> Resource {
    let mut built = Resource::new();
    for (name, quantity) in pairs {
        built.set(*name, *quantity);
    }
    built
}

/// Build the config for a partition with a single default leaf
pub fn base_config() -> PartitionConfig {
    PartitionConfig {
        name: PARTITION.to_owned(),
        queues: vec![QueueConfig {
            name: "root".to_owned(),
            parent: true,
            submit_acl: "*".to_owned(),
            queues: vec![QueueConfig {
                name: "default".to_owned(),
                ..QueueConfig::default()
            }],
            ..QueueConfig::default()
        }],
        ..PartitionConfig::default()
    }
}

/// Build the config for a partition with a nested queue structure
///
/// root -> leaf
///      -> parent -> sub-leaf
pub fn configured_config() -> PartitionConfig {
    PartitionConfig {
        name: PARTITION.to_owned(),
        queues: vec![QueueConfig {
            name: "root".to_owned(),
            parent: true,
            submit_acl: "*".to_owned(),
            queues: vec![
                QueueConfig {
                    name: "leaf".to_owned(),
                    ..QueueConfig::default()
                },
                QueueConfig {
                    name: "parent".to_owned(),
                    parent: true,
                    queues: vec![QueueConfig {
                        name: "sub-leaf".to_owned(),
                        ..QueueConfig::default()
                    }],
                    ..QueueConfig::default()
                },
            ],
            ..QueueConfig::default()
        }],
        ..PartitionConfig::default()
    }
}

/// Build a partition with a single default leaf
pub fn base_partition() -> PartitionContext {
    PartitionContext::new(&base_config(), RM_ID).expect("base partition create failed")
}

/// Build a partition with a default leaf capped at a maximum
///
/// # Arguments
///
/// * `max` - The maximum resources for the default leaf
pub fn capped_partition(max: &Resource) -> PartitionContext {
    let mut conf = base_config();
    conf.queues[0].queues[0].resources = QueueResourcesConfig {
        max: max.iter().map(|(name, quantity)| (name.clone(), *quantity)).collect(),
        ..QueueResourcesConfig::default()
    };
    PartitionContext::new(&conf, RM_ID).expect("capped partition create failed")
}

/// Build a partition with a nested queue structure
pub fn configured_partition() -> PartitionContext {
    PartitionContext::new(&configured_config(), RM_ID).expect("configured partition create failed")
}

/// Build a partition placing applications into per user queues
pub fn user_placed_partition() -> PartitionContext {
    let mut conf = base_config();
    conf.placement_rules = vec![PlacementRuleConfig {
        name: "user".to_owned(),
        create: true,
        parent: Some(Box::new(PlacementRuleConfig {
            name: "fixed".to_owned(),
            value: Some("root".to_owned()),
            ..PlacementRuleConfig::default()
        })),
        ..PlacementRuleConfig::default()
    }];
    PartitionContext::new(&conf, RM_ID).expect("placed partition create failed")
}

/// Build a node with a capacity and nothing occupied
///
/// # Arguments
///
/// * `node_id` - The id for the node
/// * `capacity` - The total capacity for the node
pub fn node(node_id: &str, capacity: &Resource) -> Arc<Node> {
    Arc::new(Node::new(node_id, capacity.clone(), Resource::new()))
}

/// Build an application for a user with groups
///
/// # Arguments
///
/// * `application_id` - The id for the application
/// * `queue_name` - The queue the application targets
/// * `user` - The submitting user
pub fn app_for(application_id: &str, queue_name: &str, user: &str) -> Arc<Application> {
    Arc::new(Application::new(
        application_id,
        PARTITION,
        queue_name,
        UserGroup::new(user, vec![format!("{user}-group")]),
        HashMap::default(),
    ))
}

/// Build an application for the default test user
///
/// # Arguments
///
/// * `application_id` - The id for the application
/// * `queue_name` - The queue the application targets
pub fn app(application_id: &str, queue_name: &str) -> Arc<Application> {
    app_for(application_id, queue_name, "testuser")
}

/// Build a repeatable ask
///
/// # Arguments
///
/// * `allocation_key` - The key for the ask
/// * `application_id` - The application the ask belongs to
/// * `resource` - The resources one repeat needs
/// * `repeat` - How many repeats are requested
pub fn ask(allocation_key: &str, application_id: &str, resource: &Resource, repeat: u64) -> AllocationAsk {
    AllocationAsk::new(allocation_key, application_id, resource.clone(), repeat)
}
