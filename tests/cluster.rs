//! Tests driving the resource manager interface end to end

mod utils;

use std::collections::HashMap;

use hafnium::scheduler::cluster::{
    AllocationReleaseRequest, AskReleaseRequest, NewApplicationRequest, NewAskRequest,
    NewNodeRequest, RemoveApplicationRequest, RemoveNodeRequest,
};
use hafnium::scheduler::objects::TerminationReason;
use hafnium::ClusterContext;
use utils::*;

/// Build a node registration request
fn node_request(node_id: &str) -> NewNodeRequest {
    NewNodeRequest {
        node_id: node_id.to_owned(),
        partition: PARTITION.to_owned(),
        capacity: res(&[("memory", 100)]),
        occupied: res(&[]),
        existing_allocations: Vec::new(),
    }
}

/// Build an application submission request
fn app_request(application_id: &str, queue_name: &str) -> NewApplicationRequest {
    NewApplicationRequest {
        application_id: application_id.to_owned(),
        partition: PARTITION.to_owned(),
        queue_name: queue_name.to_owned(),
        user: "testuser".to_owned(),
        tags: HashMap::default(),
    }
}

/// Build an ask request
fn ask_request(allocation_key: &str, application_id: &str, memory: u64, repeat: u64) -> NewAskRequest {
    NewAskRequest {
        allocation_key: allocation_key.to_owned(),
        application_id: application_id.to_owned(),
        partition: PARTITION.to_owned(),
        resource: res(&[("memory", memory)]),
        max_allocations: repeat,
        priority: 0,
        placeholder: false,
    }
}

#[test]
fn register_and_schedule_through_the_cluster() {
    let cluster = ClusterContext::new();
    cluster.register_rm(RM_ID, &[base_config()]).unwrap();
    // a second registration has to go through a reload instead
    assert!(cluster.register_rm(RM_ID, &[base_config()]).is_err());

    let response = cluster.update_node(RM_ID, vec![node_request("node-1")], Vec::new(), Vec::new());
    assert!(response.rejected_nodes.is_empty());
    let response = cluster.update_application(
        RM_ID,
        vec![app_request("app-1", "root.default")],
        Vec::new(),
    );
    assert!(response.rejected_applications.is_empty());
    let response = cluster.update_allocation(
        RM_ID,
        vec![ask_request("ask-1", "app-1", 10, 2)],
        Vec::new(),
        Vec::new(),
        Vec::new(),
    );
    assert!(response.rejected_asks.is_empty());

    // two cycles place the two repeats
    let committed = cluster.schedule_cycle();
    assert_eq!(committed.len(), 1);
    let committed = cluster.schedule_cycle();
    assert_eq!(committed.len(), 1);
    assert!(cluster.schedule_cycle().is_empty());
    let partition = cluster.get_partition(RM_ID, PARTITION).unwrap();
    assert_eq!(partition.allocated_resource(), res(&[("memory", 20)]));
}

#[test]
fn rejected_traffic_is_reported_back() {
    let cluster = ClusterContext::new();
    cluster.register_rm(RM_ID, &[base_config()]).unwrap();
    // an application for a queue that does not exist
    let response = cluster.update_application(
        RM_ID,
        vec![app_request("app-1", "root.missing")],
        Vec::new(),
    );
    assert_eq!(response.rejected_applications.len(), 1);
    assert_eq!(response.rejected_applications[0].application_id, "app-1");
    // an ask for an application that does not exist
    let response = cluster.update_allocation(
        RM_ID,
        vec![ask_request("ask-1", "ghost", 10, 1)],
        Vec::new(),
        Vec::new(),
        Vec::new(),
    );
    assert_eq!(response.rejected_asks.len(), 1);
    // a node for a partition that does not exist
    let mut bad_node = node_request("node-1");
    bad_node.partition = "other".to_owned();
    let response = cluster.update_node(RM_ID, vec![bad_node], Vec::new(), Vec::new());
    assert_eq!(response.rejected_nodes.len(), 1);
}

#[test]
fn releases_carry_their_reason() {
    let cluster = ClusterContext::new();
    cluster.register_rm(RM_ID, &[base_config()]).unwrap();
    cluster.update_node(RM_ID, vec![node_request("node-1")], Vec::new(), Vec::new());
    cluster.update_application(RM_ID, vec![app_request("app-1", "root.default")], Vec::new());
    cluster.update_allocation(
        RM_ID,
        vec![ask_request("ask-1", "app-1", 10, 2)],
        Vec::new(),
        Vec::new(),
        Vec::new(),
    );
    cluster.schedule_cycle();
    cluster.schedule_cycle();

    // an application release reports back as released by the app
    let response = cluster.update_allocation(
        RM_ID,
        Vec::new(),
        Vec::new(),
        vec![AllocationReleaseRequest {
            application_id: "app-1".to_owned(),
            partition: PARTITION.to_owned(),
            uuid: None,
        }],
        Vec::new(),
    );
    assert_eq!(response.released_allocations.len(), 2);
    assert!(response
        .released_allocations
        .iter()
        .all(|release| release.reason == TerminationReason::ReleasedByApp));

    // refill and release through a node removal instead
    cluster.update_allocation(
        RM_ID,
        vec![ask_request("ask-2", "app-1", 10, 1)],
        Vec::new(),
        Vec::new(),
        Vec::new(),
    );
    cluster.schedule_cycle();
    let response = cluster.update_node(
        RM_ID,
        Vec::new(),
        vec![RemoveNodeRequest {
            node_id: "node-1".to_owned(),
            partition: PARTITION.to_owned(),
        }],
        Vec::new(),
    );
    assert_eq!(response.released_allocations.len(), 1);
    assert_eq!(
        response.released_allocations[0].reason,
        TerminationReason::ReleasedByNodeRemoval
    );
}

#[test]
fn removing_an_rm_drains_its_partitions() {
    let cluster = ClusterContext::new();
    cluster.register_rm(RM_ID, &[base_config()]).unwrap();
    cluster.remove_rm(RM_ID);
    let partition = cluster.get_partition(RM_ID, PARTITION).unwrap();
    assert!(partition.is_draining());
    // a draining partition refuses new nodes and applications
    let response = cluster.update_node(RM_ID, vec![node_request("node-1")], Vec::new(), Vec::new());
    assert_eq!(response.rejected_nodes.len(), 1);
    let response = cluster.update_application(
        RM_ID,
        vec![app_request("app-1", "root.default")],
        Vec::new(),
    );
    assert_eq!(response.rejected_applications.len(), 1);
}

#[test]
fn reload_reaches_the_running_partitions() {
    let cluster = ClusterContext::new();
    cluster.register_rm(RM_ID, &[base_config()]).unwrap();
    // a second partition appears, the old one is kept
    let mut other = base_config();
    other.name = "spare".to_owned();
    cluster.reload_config(RM_ID, &[base_config(), other]).unwrap();
    assert!(cluster.get_partition(RM_ID, "spare").is_some());
    assert!(!cluster.get_partition(RM_ID, PARTITION).unwrap().is_draining());
    // dropping a partition from the config drains it
    cluster.reload_config(RM_ID, &[base_config()]).unwrap();
    assert!(cluster.get_partition(RM_ID, "spare").unwrap().is_draining());
}

#[test]
fn ask_release_flows_through_the_cluster() {
    let cluster = ClusterContext::new();
    cluster.register_rm(RM_ID, &[base_config()]).unwrap();
    cluster.update_application(RM_ID, vec![app_request("app-1", "root.default")], Vec::new());
    cluster.update_allocation(
        RM_ID,
        vec![ask_request("ask-1", "app-1", 10, 3)],
        Vec::new(),
        Vec::new(),
        Vec::new(),
    );
    let partition = cluster.get_partition(RM_ID, PARTITION).unwrap();
    assert_eq!(
        partition.get_application("app-1").unwrap().pending_resource(),
        res(&[("memory", 30)])
    );
    cluster.update_allocation(
        RM_ID,
        Vec::new(),
        vec![AskReleaseRequest {
            application_id: "app-1".to_owned(),
            partition: PARTITION.to_owned(),
            allocation_key: "ask-1".to_owned(),
        }],
        Vec::new(),
        Vec::new(),
    );
    assert!(partition.get_application("app-1").unwrap().pending_resource().is_zero());
    // removing the application cleans the partition maps
    cluster.update_application(
        RM_ID,
        Vec::new(),
        vec![RemoveApplicationRequest {
            application_id: "app-1".to_owned(),
            partition: PARTITION.to_owned(),
        }],
    );
    assert!(partition.get_application("app-1").is_none());
}
