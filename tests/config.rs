//! Tests for config validation and reload behavior

mod utils;

use hafnium::models::{PartitionConfig, QueueConfig};
use hafnium::scheduler::PartitionContext;
use utils::*;

#[test]
fn reload_prunes_queues_the_config_dropped() {
    let partition = configured_partition();
    assert!(partition.get_queue("root.leaf").is_some());
    assert!(partition.get_queue("root.parent.sub-leaf").is_some());

    // reload with only the plain leaf left
    let mut conf = configured_config();
    conf.queues[0].queues.truncate(1);
    partition.update(&conf).unwrap();

    // the dropped branch drains and then leaves the tree
    let parent = partition.get_queue("root.parent").unwrap();
    assert!(parent.is_draining());
    assert!(partition.get_queue("root.parent.sub-leaf").unwrap().is_draining());
    assert!(!partition.get_queue("root.leaf").unwrap().is_draining());
    partition.clean_queues();
    assert!(partition.get_queue("root.parent").is_none());
    assert!(partition.get_queue("root.leaf").is_some());
}

#[test]
fn reload_adds_new_queues() {
    let partition = base_partition();
    let mut conf = base_config();
    conf.queues[0].queues.push(QueueConfig {
        name: "batch".to_owned(),
        ..QueueConfig::default()
    });
    partition.update(&conf).unwrap();
    let batch = partition.get_queue("root.batch").expect("new queue expected");
    assert!(batch.is_leaf());
    assert!(batch.is_managed());
}

#[test]
fn reload_promotes_a_dynamic_queue() {
    let partition = user_placed_partition();
    partition.add_application(app_for("app-x", "", "alice")).unwrap();
    let queue = partition.get_queue("root.alice").unwrap();
    assert!(!queue.is_managed());

    let mut conf = base_config();
    conf.queues[0].queues.push(QueueConfig {
        name: "alice".to_owned(),
        ..QueueConfig::default()
    });
    partition.update(&conf).unwrap();
    assert!(queue.is_managed());
}

#[test]
fn invalid_reload_is_rejected_as_a_whole() {
    let partition = base_partition();
    let mut conf = base_config();
    conf.queues[0].queues[0].name = "bad.name".to_owned();
    assert!(partition.update(&conf).is_err());
    // the previous tree is still in force
    assert!(partition.get_queue("root.default").is_some());
}

#[test]
fn partition_needs_a_root_queue() {
    let conf = PartitionConfig {
        name: "test".to_owned(),
        queues: vec![QueueConfig {
            name: "main".to_owned(),
            parent: true,
            ..QueueConfig::default()
        }],
        ..PartitionConfig::default()
    };
    assert!(PartitionContext::new(&conf, RM_ID).is_err());
    assert!(PartitionContext::new(&base_config(), "").is_err());
}

#[test]
fn sort_policy_property_survives_a_reload() {
    let mut conf = base_config();
    conf.queues[0]
        .properties
        .insert("application.sort.policy".to_owned(), "fifo".to_owned());
    let partition = PartitionContext::new(&conf, RM_ID).unwrap();
    let leaf = partition.get_queue("root.default").unwrap();
    // the leaf inherits the property through the merge
    assert_eq!(
        leaf.properties().get("application.sort.policy"),
        Some(&"fifo".to_owned())
    );
    // a reload that overrides on the leaf wins over the parent
    let mut reloaded = conf.clone();
    reloaded.queues[0].queues[0]
        .properties
        .insert("application.sort.policy".to_owned(), "fair".to_owned());
    partition.update(&reloaded).unwrap();
    assert_eq!(
        leaf.properties().get("application.sort.policy"),
        Some(&"fair".to_owned())
    );
}
