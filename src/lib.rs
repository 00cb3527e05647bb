//! The Hafnium scheduling core
//!
//! Hafnium matches pending resource asks from multi tenant applications
//! against node capacity under hierarchical queue policies. Resource
//! managers register partitions, nodes and applications through the
//! cluster context and drive the allocation cycle for the decisions.

mod error;
pub mod models;
pub mod scheduler;

pub use error::Error;
pub use models::{PartitionConfig, QueueConfig, Resource, UserGroup};
pub use scheduler::{ClusterContext, PartitionContext};
