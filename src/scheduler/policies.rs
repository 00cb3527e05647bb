//! The sort policies used across the scheduler
//!
//! Nodes are ordered per partition, children per parent queue and
//! applications per leaf queue. The node policy comes from the partition
//! config, the queue policies from the merged queue properties.

use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{event, Level};

use crate::models::Resource;
use crate::Error;
use super::objects::Node;

/// How the nodes of a partition are ordered for allocation
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum NodeSortingPolicy {
    /// Fill the least utilized node first to spread load
    #[default]
    Fair,
    /// Fill the most utilized node first to pack tightly
    BinPacking,
}

impl NodeSortingPolicy {
    /// Parse a node sorting policy from its config value
    ///
    /// An empty value defaults to fair.
    ///
    /// # Arguments
    ///
    /// * `raw` - The raw policy name from the config
    pub fn parse(raw: &str) -> Result<Self, Error> {
        match raw {
            "" | "fair" => Ok(NodeSortingPolicy::Fair),
            "binpacking" => Ok(NodeSortingPolicy::BinPacking),
            other => Err(Error::Config(format!("undefined node sort policy: {other}"))),
        }
    }

    /// Get this policy as a str for logging
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeSortingPolicy::Fair => "fair",
            NodeSortingPolicy::BinPacking => "binpacking",
        }
    }
}

/// How applications or child queues are ordered
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SortType {
    /// Lowest usage share first
    #[default]
    Fair,
    /// Submission or config order
    Fifo,
}

impl SortType {
    /// Parse a sort type from the queue property value
    ///
    /// A missing property defaults to fair. An unknown value was already
    /// rejected by config validation so it only downgrades with a warning
    /// here.
    ///
    /// # Arguments
    ///
    /// * `raw` - The property value when set
    #[must_use]
    pub fn parse(raw: Option<&String>) -> Self {
        match raw.map(String::as_str) {
            None | Some("fair") => SortType::Fair,
            Some("fifo") => SortType::Fifo,
            Some(other) => {
                event!(Level::WARN, policy = other, msg = "unknown sort policy, using fair");
                SortType::Fair
            }
        }
    }
}

/// An iterator over a sorted node snapshot
///
/// The snapshot is cut and ordered once per attempt so the allocation
/// descent never iterates live partition state.
pub struct NodeIterator {
    /// The ordered node snapshot
    nodes: Vec<Arc<Node>>,
    /// The next node to hand out
    index: usize,
}

impl NodeIterator {
    /// Create a new iterator over an ordered node snapshot
    ///
    /// # Arguments
    ///
    /// * `nodes` - The ordered nodes to iterate
    #[must_use]
    pub fn new(nodes: Vec<Arc<Node>>) -> Self {
        NodeIterator { nodes, index: 0 }
    }

    /// Get the next node in order
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<Arc<Node>> {
        let node = self.nodes.get(self.index).cloned();
        self.index += 1;
        node
    }
}

/// Order a node snapshot in place for a sort policy
///
/// # Arguments
///
/// * `nodes` - The nodes to order
/// * `policy` - The policy to order them by
pub fn sort_nodes(nodes: &mut [Arc<Node>], policy: NodeSortingPolicy) {
    match policy {
        // least utilized first so load spreads over the partition
        NodeSortingPolicy::Fair => nodes.sort_by(|left, right| {
            compare_f64(left.dominant_utilization(), right.dominant_utilization())
                .then_with(|| left.node_id().cmp(right.node_id()))
        }),
        // most utilized first so nodes fill up one by one
        NodeSortingPolicy::BinPacking => nodes.sort_by(|left, right| {
            compare_f64(right.dominant_utilization(), left.dominant_utilization())
                .then_with(|| left.node_id().cmp(right.node_id()))
        }),
    }
}

/// The usage share used for fair ordering
///
/// The share is the dominant used fraction over the guaranteed dimensions.
/// Usage without any guarantee sorts last so guaranteed queues and
/// applications catch up first.
///
/// # Arguments
///
/// * `used` - The resources currently in use
/// * `guaranteed` - The guaranteed resources to compare against
#[must_use]
pub fn fair_share(used: &Resource, guaranteed: &Resource) -> f64 {
    let mut dominant: Option<f64> = None;
    for (name, quantity) in guaranteed.iter() {
        if *quantity > 0 {
            let share = used.get(name) as f64 / *quantity as f64;
            dominant = Some(dominant.map_or(share, |current| current.max(share)));
        }
    }
    match dominant {
        Some(share) => share,
        // no guarantee to weigh against: idle sorts first, usage sorts last
        None if used.strictly_positive() => f64::MAX,
        None => 0.0,
    }
}

/// Compare two floats with a total order for sorting
///
/// # Arguments
///
/// * `left` - The left hand value
/// * `right` - The right hand value
pub fn compare_f64(left: f64, right: f64) -> Ordering {
    left.partial_cmp(&right).unwrap_or(Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a resource vector from literal pairs
    fn res(pairs: &[(&str, u64)]) -> Resource {
        let mut built = Resource::new();
        for (name, quantity) in pairs {
            built.set(*name, *quantity);
        }
        built
    }

    #[test]
    fn node_policy_parsing() {
        assert_eq!(NodeSortingPolicy::parse("").unwrap(), NodeSortingPolicy::Fair);
        assert_eq!(NodeSortingPolicy::parse("fair").unwrap(), NodeSortingPolicy::Fair);
        assert_eq!(
            NodeSortingPolicy::parse("binpacking").unwrap(),
            NodeSortingPolicy::BinPacking
        );
        assert!(NodeSortingPolicy::parse("random").is_err());
    }

    #[test]
    fn sort_type_defaults_to_fair() {
        assert_eq!(SortType::parse(None), SortType::Fair);
        assert_eq!(SortType::parse(Some(&"fifo".to_owned())), SortType::Fifo);
    }

    #[test]
    fn fair_share_prefers_idle_guarantees() {
        let guaranteed = res(&[("memory", 100)]);
        assert!(fair_share(&res(&[("memory", 10)]), &guaranteed)
            < fair_share(&res(&[("memory", 90)]), &guaranteed));
        // usage with no guarantee sorts behind everything
        assert!(fair_share(&res(&[("memory", 1)]), &Resource::new())
            > fair_share(&res(&[("memory", 90)]), &guaranteed));
        assert_eq!(fair_share(&Resource::new(), &Resource::new()), 0.0);
    }

    #[test]
    fn node_ordering_follows_policy() {
        let empty = Arc::new(Node::new("node-a", res(&[("memory", 100)]), Resource::new()));
        let busy = Arc::new(Node::new("node-b", res(&[("memory", 100)]), Resource::new()));
        // consume most of the busy node
        let ask = super::super::objects::AllocationAsk::new(
            "ask-1",
            "app-1",
            res(&[("memory", 80)]),
            1,
        );
        let alloc = super::super::objects::Allocation::new(
            &ask,
            "root.default",
            "node-b",
            super::super::objects::AllocationResult::Allocated,
        );
        busy.add_allocation(alloc).unwrap();
        let mut nodes = vec![busy.clone(), empty.clone()];
        sort_nodes(&mut nodes, NodeSortingPolicy::Fair);
        assert_eq!(nodes[0].node_id(), "node-a");
        sort_nodes(&mut nodes, NodeSortingPolicy::BinPacking);
        assert_eq!(nodes[0].node_id(), "node-b");
    }
}
