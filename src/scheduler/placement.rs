//! The placement rule chain mapping applications to queues
//!
//! Rules are evaluated in config order and the first rule producing a
//! queue path wins. A rule can carry a parent rule that produces the path
//! to hang the resolved name under. With no rules configured placement is
//! disabled and the submitters queue name is used as given.

use serde::{Deserialize, Serialize};
use tracing::{event, instrument, Level};

use crate::models::{clean_name_part, PlacementRuleConfig, DOT, RECOVERY_QUEUE, ROOT_QUEUE};
use crate::Error;
use super::objects::Application;

/// The rule kinds the chain understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleKind {
    /// Use the queue name the submitter sent
    Provided,
    /// Place under a queue named after the submitting user
    User,
    /// Place under a queue named after the users primary group
    PrimaryGroup,
    /// Place under a fixed configured queue
    Fixed,
    /// Place under a queue named after an application label
    Tag,
    /// Place recovered applications under the recovery queue
    Recovery,
}

impl RuleKind {
    /// Parse a rule kind from its config name
    ///
    /// # Arguments
    ///
    /// * `raw` - The rule name from the config
    pub fn parse(raw: &str) -> Result<Self, Error> {
        match raw.to_lowercase().as_str() {
            "provided" => Ok(RuleKind::Provided),
            "user" => Ok(RuleKind::User),
            "primarygroup" => Ok(RuleKind::PrimaryGroup),
            "fixed" => Ok(RuleKind::Fixed),
            "tag" => Ok(RuleKind::Tag),
            "recovery" => Ok(RuleKind::Recovery),
            other => Err(Error::Config(format!("undefined placement rule: {other}"))),
        }
    }
}

/// A compiled placement rule
#[derive(Debug, Clone)]
pub struct PlacementRule {
    /// What this rule resolves names from
    kind: RuleKind,
    /// Whether this rule may create missing queues
    create: bool,
    /// The value for the fixed and tag kinds
    value: Option<String>,
    /// The rule producing the parent path
    parent: Option<Box<PlacementRule>>,
}

/// Where a placement run resolved to
#[derive(Debug, Clone)]
pub struct PlacementOutcome {
    /// The full path of the resolved leaf queue
    pub queue_path: String,
    /// Whether missing queues on the path may be created
    pub create: bool,
    /// Whether the submit ACL check is skipped for this placement
    pub acl_exempt: bool,
}

impl PlacementRule {
    /// Compile a rule from its config
    ///
    /// # Arguments
    ///
    /// * `conf` - The rule config to compile
    pub fn from_config(conf: &PlacementRuleConfig) -> Result<Self, Error> {
        let parent = match &conf.parent {
            Some(parent) => Some(Box::new(PlacementRule::from_config(parent)?)),
            None => None,
        };
        Ok(PlacementRule {
            kind: RuleKind::parse(&conf.name)?,
            create: conf.create,
            value: conf.value.clone(),
            parent,
        })
    }

    /// Resolve the parent path for this rule
    ///
    /// Without a parent rule everything hangs directly under the root.
    ///
    /// # Arguments
    ///
    /// * `app` - The application being placed
    fn parent_path(&self, app: &Application) -> Option<String> {
        match &self.parent {
            Some(parent) => parent.resolve(app),
            None => Some(ROOT_QUEUE.to_owned()),
        }
    }

    /// Resolve an application to a queue path through this rule
    ///
    /// # Arguments
    ///
    /// * `app` - The application being placed
    fn resolve(&self, app: &Application) -> Option<String> {
        match self.kind {
            RuleKind::Provided => {
                let provided = app.queue_name();
                if provided.is_empty() {
                    return None;
                }
                qualify(&self.parent_path(app)?, &provided)
            }
            RuleKind::User => {
                let user = app.user();
                if user.user.is_empty() {
                    return None;
                }
                Some(join(&self.parent_path(app)?, &user.user))
            }
            RuleKind::PrimaryGroup => {
                let user = app.user();
                let group = user.groups.first()?;
                Some(join(&self.parent_path(app)?, group))
            }
            RuleKind::Fixed => {
                let value = self.value.as_deref()?;
                qualify(&self.parent_path(app)?, value)
            }
            RuleKind::Tag => {
                let tag = app.tag(self.value.as_deref()?)?;
                if tag.is_empty() {
                    return None;
                }
                Some(join(&self.parent_path(app)?, &tag))
            }
            RuleKind::Recovery => Some(format!("{ROOT_QUEUE}{DOT}{RECOVERY_QUEUE}")),
        }
    }
}

/// Join a parent path and a cleaned name part
///
/// # Arguments
///
/// * `parent` - The parent path to hang the name under
/// * `name` - The raw name part
fn join(parent: &str, name: &str) -> String {
    format!("{parent}{DOT}{}", clean_name_part(name))
}

/// Qualify a possibly full path against a parent path
///
/// A name that is already rooted is taken as given, anything else hangs
/// under the parent.
///
/// # Arguments
///
/// * `parent` - The parent path to hang unrooted names under
/// * `name` - The possibly rooted name
fn qualify(parent: &str, name: &str) -> Option<String> {
    let lowered = name.to_lowercase();
    if lowered == ROOT_QUEUE || lowered.starts_with(&format!("{ROOT_QUEUE}{DOT}")) {
        return Some(lowered);
    }
    Some(join(parent, &lowered))
}

/// The ordered placement rule chain of a partition
#[derive(Debug, Default)]
pub struct PlacementManager {
    /// The compiled rules in evaluation order
    rules: Vec<PlacementRule>,
}

impl PlacementManager {
    /// Compile a manager from the configured rules
    ///
    /// # Arguments
    ///
    /// * `configs` - The rule configs in evaluation order
    pub fn new(configs: &[PlacementRuleConfig]) -> Result<Self, Error> {
        let rules = configs
            .iter()
            .map(PlacementRule::from_config)
            .collect::<Result<Vec<PlacementRule>, Error>>()?;
        Ok(PlacementManager { rules })
    }

    /// Check if placement is enabled at all
    #[must_use]
    pub fn is_initialised(&self) -> bool {
        !self.rules.is_empty()
    }

    /// Swap in a newly configured rule chain
    ///
    /// # Arguments
    ///
    /// * `configs` - The new rule configs in evaluation order
    pub fn replace_rules(&mut self, configs: &[PlacementRuleConfig]) -> Result<(), Error> {
        self.rules = PlacementManager::new(configs)?.rules;
        Ok(())
    }

    /// Run an application through the rule chain
    ///
    /// # Arguments
    ///
    /// * `app` - The application to place
    #[instrument(name = "PlacementManager::place", skip_all, fields(app = app.application_id))]
    pub fn place(&self, app: &Application) -> Result<PlacementOutcome, Error> {
        for rule in &self.rules {
            if let Some(queue_path) = rule.resolve(app) {
                event!(
                    Level::DEBUG,
                    app = app.application_id,
                    queue = queue_path,
                    rule = ?rule.kind,
                    msg = "application placed"
                );
                return Ok(PlacementOutcome {
                    queue_path,
                    create: rule.create,
                    acl_exempt: rule.kind == RuleKind::Recovery,
                });
            }
        }
        Err(Error::Validation(format!(
            "application {} rejected by placement rules",
            app.application_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserGroup;

    /// Build an application for placement runs
    fn app(queue_name: &str, user: &str, groups: &[&str], tags: &[(&str, &str)]) -> Application {
        let tags = tags
            .iter()
            .map(|(name, value)| ((*name).to_owned(), (*value).to_owned()))
            .collect();
        Application::new(
            "app-1",
            "test",
            queue_name,
            UserGroup::new(user, groups.iter().map(|g| (*g).to_owned()).collect()),
            tags,
        )
    }

    /// Build a rule config by name
    fn rule(name: &str) -> PlacementRuleConfig {
        PlacementRuleConfig {
            name: name.to_owned(),
            ..PlacementRuleConfig::default()
        }
    }

    #[test]
    fn provided_rule_takes_the_submitted_name() {
        let manager = PlacementManager::new(&[rule("provided")]).unwrap();
        let placed = manager.place(&app("root.Default", "alice", &[], &[])).unwrap();
        assert_eq!(placed.queue_path, "root.default");
        // an unrooted name hangs under the root
        let placed = manager.place(&app("batch", "alice", &[], &[])).unwrap();
        assert_eq!(placed.queue_path, "root.batch");
    }

    #[test]
    fn user_rule_builds_a_user_queue() {
        let manager = PlacementManager::new(&[PlacementRuleConfig {
            name: "user".to_owned(),
            create: true,
            ..PlacementRuleConfig::default()
        }])
        .unwrap();
        let placed = manager.place(&app("", "Alice.Smith", &[], &[])).unwrap();
        assert_eq!(placed.queue_path, "root.alice_dot_smith");
        assert!(placed.create);
    }

    #[test]
    fn parent_rule_feeds_the_child() {
        let manager = PlacementManager::new(&[PlacementRuleConfig {
            name: "user".to_owned(),
            create: true,
            parent: Some(Box::new(PlacementRuleConfig {
                name: "fixed".to_owned(),
                value: Some("root.users".to_owned()),
                ..PlacementRuleConfig::default()
            })),
            ..PlacementRuleConfig::default()
        }])
        .unwrap();
        let placed = manager.place(&app("", "alice", &[], &[])).unwrap();
        assert_eq!(placed.queue_path, "root.users.alice");
    }

    #[test]
    fn chain_falls_through_to_the_next_rule() {
        let manager =
            PlacementManager::new(&[rule("provided"), rule("primarygroup")]).unwrap();
        // no provided name, no groups: the chain rejects
        assert!(manager.place(&app("", "alice", &[], &[])).is_err());
        // the group rule picks it up once a group resolves
        let placed = manager.place(&app("", "alice", &["devs"], &[])).unwrap();
        assert_eq!(placed.queue_path, "root.devs");
    }

    #[test]
    fn tag_rule_reads_application_labels() {
        let mut conf = rule("tag");
        conf.value = Some("namespace".to_owned());
        let manager = PlacementManager::new(&[conf]).unwrap();
        let placed = manager
            .place(&app("", "alice", &[], &[("namespace", "Team.A")]))
            .unwrap();
        assert_eq!(placed.queue_path, "root.team_dot_a");
        assert!(manager.place(&app("", "alice", &[], &[])).is_err());
    }

    #[test]
    fn recovery_rule_is_acl_exempt() {
        let manager = PlacementManager::new(&[rule("recovery")]).unwrap();
        let placed = manager.place(&app("", "alice", &[], &[])).unwrap();
        assert_eq!(placed.queue_path, "root.@recovery@");
        assert!(placed.acl_exempt);
    }
}
