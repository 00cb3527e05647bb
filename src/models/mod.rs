//! Wrappers for all objects shared across the scheduling core

pub mod acl;
pub mod conf;
pub mod info;
pub mod resources;

pub use acl::{cache_user, resolve_user, Acl, UserGroup};
pub use conf::{
    clean_name_part, valid_queue_name, NodeSortPolicyConfig, PartitionConfig, PlacementRuleConfig,
    PreemptionConfig, QueueConfig, QueueResourcesConfig, APPLICATION_SORT_POLICY, DOT, DOT_REPLACE,
    RECOVERY_QUEUE, ROOT_QUEUE,
};
pub use info::{NodeUsageMap, QueueCapacities, QueueInfo};
pub use resources::Resource;
