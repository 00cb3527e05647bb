//! The partition and queue configuration shape
//!
//! Loading and reloading the config from disk is owned by the resource
//! manager glue. The core only defines the shape and the validation that
//! gates every load: a config that fails validation is rejected as a whole
//! and the previous config stays in force.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use crate::Error;
use super::acl::Acl;

/// The path separator for queue paths
pub const DOT: &str = ".";

/// The replacement for dots embedded in rule produced names
pub const DOT_REPLACE: &str = "_dot_";

/// The name of the root queue of every partition
pub const ROOT_QUEUE: &str = "root";

/// The queue property that selects how applications are sorted
pub const APPLICATION_SORT_POLICY: &str = "application.sort.policy";

/// The reserved queue name recovered applications are placed under
///
/// The name sits outside the normal naming rules so a submitter can never
/// target it directly.
pub const RECOVERY_QUEUE: &str = "@recovery@";

/// The pattern all queue names must match
static QUEUE_NAME_REGEX: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new("^[a-zA-Z0-9_-]{1,64}$").unwrap());

/// Check a single queue name against the naming rules
///
/// # Arguments
///
/// * `name` - The queue name to check
pub fn valid_queue_name(name: &str) -> bool {
    QUEUE_NAME_REGEX.is_match(name)
}

/// Helps serde default a value to false
fn default_false() -> bool {
    false
}

/// The config for a single partition
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// The name of this partition
    pub name: String,
    /// The queue tree starting at the root queue
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
    /// The ordered placement rules for this partition
    #[serde(default)]
    pub placement_rules: Vec<PlacementRuleConfig>,
    /// The preemption settings for this partition
    #[serde(default)]
    pub preemption: PreemptionConfig,
    /// The node sort policy for this partition
    #[serde(default)]
    pub node_sort_policy: NodeSortPolicyConfig,
}

/// The config for a single queue in the tree
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// The name of this queue
    pub name: String,
    /// Whether this queue is a parent queue instead of a leaf
    #[serde(default = "default_false")]
    pub parent: bool,
    /// The ACL controlling who can submit to this queue
    #[serde(default)]
    pub submit_acl: String,
    /// The ACL controlling who can administer this queue
    #[serde(default)]
    pub admin_acl: String,
    /// The resource limits for this queue
    #[serde(default)]
    pub resources: QueueResourcesConfig,
    /// Free form properties, merged with the parents properties
    #[serde(default)]
    pub properties: HashMap<String, String>,
    /// The child queues below this queue
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
}

/// The resource limits for a queue
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct QueueResourcesConfig {
    /// The maximum resources the queue may have allocated
    #[serde(default)]
    pub max: HashMap<String, u64>,
    /// The resources the queue is guaranteed to receive
    #[serde(default)]
    pub guaranteed: HashMap<String, u64>,
}

/// The config for one placement rule in the chain
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PlacementRuleConfig {
    /// The name of the rule to apply
    pub name: String,
    /// Whether this rule may create missing queues
    #[serde(default = "default_false")]
    pub create: bool,
    /// The value for rules that need one (fixed path, tag name)
    #[serde(default)]
    pub value: Option<String>,
    /// The rule producing the parent path for this rule
    #[serde(default)]
    pub parent: Option<Box<PlacementRuleConfig>>,
}

/// The preemption settings for a partition
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PreemptionConfig {
    /// Whether allocations in this partition may be preempted
    #[serde(default = "default_false")]
    pub enabled: bool,
}

/// The node sort policy settings for a partition
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct NodeSortPolicyConfig {
    /// The policy name, empty defaults to fair
    #[serde(default)]
    pub policy_type: String,
}

/// The rule names the placement manager understands
const RULE_NAMES: [&str; 6] = ["provided", "user", "primarygroup", "fixed", "tag", "recovery"];

impl PartitionConfig {
    /// Parse and validate a partition config from its YAML form
    ///
    /// A config that does not parse or does not validate is rejected as a
    /// whole.
    ///
    /// # Arguments
    ///
    /// * `raw` - The raw YAML to parse
    pub fn from_yaml(raw: &str) -> Result<Self, Error> {
        let conf: PartitionConfig = serde_yaml::from_str(raw)?;
        conf.validate()?;
        Ok(conf)
    }

    /// Validate this partition config as a whole
    ///
    /// Validation failures reject the entire config so a partially applied
    /// tree can never exist.
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::Config("partition name must be set".to_owned()));
        }
        // the tree must start with a single root queue that can hold children
        if self.queues.len() != 1 || !self.queues[0].name.eq_ignore_ascii_case(ROOT_QUEUE) {
            return Err(Error::Config(format!(
                "partition {} must have a single '{ROOT_QUEUE}' queue at the top",
                self.name
            )));
        }
        if !self.queues[0].parent {
            return Err(Error::Config(format!(
                "the '{ROOT_QUEUE}' queue of partition {} must be a parent queue",
                self.name
            )));
        }
        self.queues[0].validate()?;
        // check the placement rules
        for rule in &self.placement_rules {
            rule.validate()?;
        }
        // check the node sort policy value
        match self.node_sort_policy.policy_type.as_str() {
            "" | "fair" | "binpacking" => Ok(()),
            other => Err(Error::Config(format!("undefined node sort policy: {other}"))),
        }
    }
}

impl QueueConfig {
    /// Validate this queue config and its children
    pub fn validate(&self) -> Result<(), Error> {
        if !valid_queue_name(&self.name) {
            return Err(Error::Config(format!(
                "invalid queue name {}, a name must only have alphanumeric characters, \
                 - or _, and be no longer than 64 characters",
                self.name
            )));
        }
        // a queue with children must be flagged as a parent
        if !self.parent && !self.queues.is_empty() {
            return Err(Error::Config(format!(
                "leaf queue {} cannot have child queues",
                self.name
            )));
        }
        // both ACLs must parse
        Acl::parse(&self.submit_acl)?;
        Acl::parse(&self.admin_acl)?;
        // the sort policy property must be a known value when set
        if let Some(policy) = self.properties.get(APPLICATION_SORT_POLICY) {
            match policy.as_str() {
                "fair" | "fifo" => (),
                other => {
                    return Err(Error::Config(format!(
                        "undefined application sort policy on queue {}: {other}",
                        self.name
                    )))
                }
            }
        }
        // sibling names must be unique after lower casing
        let mut seen = HashSet::with_capacity(self.queues.len());
        for child in &self.queues {
            if !seen.insert(child.name.to_lowercase()) {
                return Err(Error::Config(format!(
                    "duplicate child queue {} under queue {}",
                    child.name, self.name
                )));
            }
            child.validate()?;
        }
        Ok(())
    }
}

impl PlacementRuleConfig {
    /// Validate this rule and its parent chain
    pub fn validate(&self) -> Result<(), Error> {
        let lowered = self.name.to_lowercase();
        if !RULE_NAMES.contains(&lowered.as_str()) {
            return Err(Error::Config(format!("undefined placement rule: {}", self.name)));
        }
        // the rules that resolve through a value need one
        if matches!(lowered.as_str(), "fixed" | "tag")
            && self.value.as_deref().unwrap_or("").is_empty()
        {
            return Err(Error::Config(format!(
                "placement rule {} needs a value",
                self.name
            )));
        }
        if let Some(parent) = &self.parent {
            parent.validate()?;
        }
        Ok(())
    }
}

/// Lower case a name part and replace embedded dots
///
/// Queue names are always lower cased on intake and a dot would otherwise
/// split the path in the wrong place.
///
/// # Arguments
///
/// * `name` - The raw name part to clean
#[must_use]
pub fn clean_name_part(name: &str) -> String {
    name.to_lowercase().replace(DOT, DOT_REPLACE)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal valid partition config
    fn base_conf() -> PartitionConfig {
        PartitionConfig {
            name: "test".to_owned(),
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

    #[test]
    fn base_config_is_valid() {
        base_conf().validate().unwrap();
    }

    #[test]
    fn missing_root_is_rejected() {
        let mut conf = base_conf();
        conf.queues[0].name = "main".to_owned();
        assert!(conf.validate().is_err());
    }

    #[test]
    fn bad_queue_name_is_rejected() {
        let mut conf = base_conf();
        conf.queues[0].queues[0].name = "bad.name".to_owned();
        assert!(conf.validate().is_err());
        conf.queues[0].queues[0].name = "x".repeat(65);
        assert!(conf.validate().is_err());
    }

    #[test]
    fn duplicate_siblings_are_rejected() {
        let mut conf = base_conf();
        let copy = conf.queues[0].queues[0].clone();
        conf.queues[0].queues.push(copy);
        assert!(conf.validate().is_err());
    }

    #[test]
    fn unknown_sort_policy_is_rejected() {
        let mut conf = base_conf();
        conf.queues[0].queues[0]
            .properties
            .insert(APPLICATION_SORT_POLICY.to_owned(), "random".to_owned());
        assert!(conf.validate().is_err());
    }

    #[test]
    fn unknown_placement_rule_is_rejected() {
        let mut conf = base_conf();
        conf.placement_rules.push(PlacementRuleConfig {
            name: "roulette".to_owned(),
            ..PlacementRuleConfig::default()
        });
        assert!(conf.validate().is_err());
    }

    #[test]
    fn name_parts_are_cleaned() {
        assert_eq!(clean_name_part("Alice.Smith"), "alice_dot_smith");
        assert_eq!(clean_name_part("TEAM"), "team");
    }

    #[test]
    fn config_parses_from_yaml() {
        let raw = r"
name: test
queues:
  - name: root
    parent: true
    submit_acl: '*'
    queues:
      - name: default
        resources:
          max:
            memory: 100
";
        let conf = PartitionConfig::from_yaml(raw).unwrap();
        assert_eq!(conf.queues[0].queues[0].resources.max.get("memory"), Some(&100));
    }

    #[test]
    fn broken_yaml_reports_a_config_error() {
        let error = PartitionConfig::from_yaml("queues: [").unwrap_err();
        assert_eq!(error.kind(), "Config");
    }
}
