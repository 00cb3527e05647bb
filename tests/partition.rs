//! Tests driving whole partitions through the allocation cycle

mod utils;

use hafnium::models::Resource;
use hafnium::scheduler::objects::{Allocation, AllocationResult};
use utils::*;
use uuid::Uuid;

#[test]
fn basic_allocation_fills_the_queue() {
    let partition = base_partition();
    partition
        .add_node(node("node-1", &res(&[("memory", 100)])), Vec::new())
        .unwrap();
    partition.add_application(app("app-1", "root.default")).unwrap();
    partition
        .add_allocation_ask("app-1", ask("ask-1", "app-1", &res(&[("memory", 10)]), 3))
        .unwrap();

    // three repeats should land as three allocations
    for _ in 0..3 {
        let alloc = partition.try_allocate().expect("allocation expected");
        assert_eq!(alloc.result, AllocationResult::Allocated);
        assert_eq!(alloc.node_id, "node-1");
    }
    // nothing is left to place
    assert!(partition.try_allocate().is_none());

    let queue = partition.get_queue("root.default").unwrap();
    assert_eq!(queue.allocated_resource(), res(&[("memory", 30)]));
    let node = partition.get_node("node-1").unwrap();
    assert_eq!(node.available(), res(&[("memory", 70)]));
    assert_eq!(partition.allocation_count(), 3);
}

#[test]
fn queue_cap_turns_the_overflow_into_a_reservation() {
    let partition = capped_partition(&res(&[("memory", 20)]));
    partition
        .add_node(node("node-1", &res(&[("memory", 100)])), Vec::new())
        .unwrap();
    partition.add_application(app("app-1", "root.default")).unwrap();
    partition
        .add_allocation_ask("app-1", ask("ask-1", "app-1", &res(&[("memory", 10)]), 3))
        .unwrap();

    assert!(partition.try_allocate().is_some());
    assert!(partition.try_allocate().is_some());
    // the third repeat hits the queue cap and only reserves
    assert!(partition.try_allocate().is_none());

    let queue = partition.get_queue("root.default").unwrap();
    assert_eq!(queue.allocated_resource(), res(&[("memory", 20)]));
    assert_eq!(partition.reservations().get("app-1"), Some(&1));
    let node = partition.get_node("node-1").unwrap();
    assert!(node.is_reserved());
    // the reservation holds no node resources
    assert_eq!(node.available(), res(&[("memory", 80)]));
    // a repeat cycle does not stack another reservation
    assert!(partition.try_allocate().is_none());
    assert_eq!(partition.reservations().get("app-1"), Some(&1));
}

#[test]
fn reservation_is_promoted_once_the_cap_lifts() {
    let partition = capped_partition(&res(&[("memory", 20)]));
    partition
        .add_node(node("node-1", &res(&[("memory", 100)])), Vec::new())
        .unwrap();
    partition.add_application(app("app-1", "root.default")).unwrap();
    partition
        .add_allocation_ask("app-1", ask("ask-1", "app-1", &res(&[("memory", 10)]), 3))
        .unwrap();
    assert!(partition.try_allocate().is_some());
    assert!(partition.try_allocate().is_some());
    assert!(partition.try_allocate().is_none());
    assert_eq!(partition.reservations().get("app-1"), Some(&1));

    // a second node alone does not help while the cap holds
    partition
        .add_node(node("node-2", &res(&[("memory", 100)])), Vec::new())
        .unwrap();
    assert!(partition.try_reserved_allocate().is_none());
    assert_eq!(partition.reservations().get("app-1"), Some(&1));
    let queue = partition.get_queue("root.default").unwrap();
    assert_eq!(queue.allocated_resource(), res(&[("memory", 20)]));

    // lift the cap and make the reserved node too full to use
    let mut conf = base_config();
    conf.queues[0].queues[0].resources.max =
        res(&[("memory", 30)]).iter().map(|(k, v)| (k.clone(), *v)).collect();
    partition.update(&conf).unwrap();
    partition
        .update_node("node-1", Some(res(&[("memory", 95)])), None)
        .unwrap();

    let alloc = partition.try_reserved_allocate().expect("promotion expected");
    assert_eq!(alloc.result, AllocationResult::AllocatedReserved);
    assert_eq!(alloc.node_id, "node-2");
    assert_eq!(alloc.reserved_node_id.as_deref(), Some("node-1"));
    assert_eq!(queue.allocated_resource(), res(&[("memory", 30)]));
    // the reservation is gone on both sides
    assert!(partition.reservations().is_empty());
    assert!(!partition.get_node("node-1").unwrap().is_reserved());
}

#[test]
fn node_removal_returns_the_resources() {
    let partition = base_partition();
    partition
        .add_node(node("node-1", &res(&[("memory", 100)])), Vec::new())
        .unwrap();
    partition.add_application(app("app-1", "root.default")).unwrap();
    partition
        .add_allocation_ask("app-1", ask("ask-1", "app-1", &res(&[("memory", 10)]), 3))
        .unwrap();
    for _ in 0..3 {
        partition.try_allocate().expect("allocation expected");
    }

    let released = partition.remove_node("node-1");
    assert_eq!(released.len(), 3);
    assert!(partition.allocated_resource().is_zero());
    assert!(partition.total_partition_resource().is_zero());
    assert_eq!(partition.allocation_count(), 0);
    // the application holds nothing any more either
    let app = partition.get_application("app-1").unwrap();
    assert!(app.allocated_resource().is_zero());
}

#[test]
fn draining_queue_rejects_new_apps_but_drains_old_work() {
    let partition = base_partition();
    partition
        .add_node(node("node-1", &res(&[("memory", 100)])), Vec::new())
        .unwrap();
    partition.add_application(app("app-1", "root.default")).unwrap();
    partition
        .add_allocation_ask("app-1", ask("ask-1", "app-1", &res(&[("memory", 10)]), 1))
        .unwrap();

    // mark the leaf for removal, existing work keeps scheduling
    let queue = partition.get_queue("root.default").unwrap();
    queue.mark_for_removal();
    assert!(queue.is_draining());
    assert!(partition.add_application(app("app-2", "root.default")).is_err());
    let alloc = partition.try_allocate().expect("draining queue still allocates");
    assert_eq!(alloc.result, AllocationResult::Allocated);

    // the queue leaves the tree once everything drained away
    partition.clean_queues();
    assert!(partition.get_queue("root.default").is_some());
    let released = partition.remove_application("app-1");
    assert_eq!(released.len(), 1);
    partition.clean_queues();
    assert!(partition.get_queue("root.default").is_none());
}

#[test]
fn add_then_remove_application_restores_the_partition() {
    let partition = base_partition();
    assert_eq!(partition.application_count(), 0);
    partition.add_application(app("app-1", "root.default")).unwrap();
    assert_eq!(partition.application_count(), 1);
    let released = partition.remove_application("app-1");
    assert!(released.is_empty());
    assert_eq!(partition.application_count(), 0);
    assert!(partition.reservations().is_empty());
    assert_eq!(partition.allocation_count(), 0);
}

#[test]
fn duplicate_ids_are_rejected() {
    let partition = base_partition();
    partition.add_application(app("app-1", "root.default")).unwrap();
    assert!(partition.add_application(app("app-1", "root.default")).is_err());
    partition
        .add_node(node("node-1", &res(&[("memory", 100)])), Vec::new())
        .unwrap();
    assert!(partition
        .add_node(node("node-1", &res(&[("memory", 100)])), Vec::new())
        .is_err());
}

#[test]
fn node_recovery_replays_reported_allocations() {
    let partition = base_partition();
    partition.add_application(app("app-1", "root.default")).unwrap();
    // recovered allocations keep the uuid the resource manager reported
    let reported = Uuid::new_v4();
    let recovered = Allocation::from_recovery(
        reported,
        &ask("ask-1", "app-1", &res(&[("memory", 40)]), 1),
        "root.default",
        "node-1",
    );
    assert_eq!(recovered.uuid, reported);
    let before = partition.total_partition_resource();
    partition
        .add_node(node("node-1", &res(&[("memory", 100)])), vec![recovered])
        .unwrap();

    // the books know the recovered allocation on every object
    assert_eq!(partition.allocation_count(), 1);
    let queue = partition.get_queue("root.default").unwrap();
    assert_eq!(queue.allocated_resource(), res(&[("memory", 40)]));
    let node = partition.get_node("node-1").unwrap();
    assert_eq!(node.available(), res(&[("memory", 60)]));
    let app = partition.get_application("app-1").unwrap();
    assert_eq!(app.allocated_resource(), res(&[("memory", 40)]));

    // removing the node hands the same allocations back
    let released = partition.remove_node("node-1");
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].uuid, reported);
    assert!(before.is_zero() && partition.total_partition_resource().is_zero());
}

#[test]
fn failed_recovery_rolls_the_node_back() {
    let partition = base_partition();
    // the application for this allocation was never submitted
    let recovered = Allocation::from_recovery(
        Uuid::new_v4(),
        &ask("ask-1", "ghost-app", &res(&[("memory", 40)]), 1),
        "root.default",
        "node-1",
    );
    assert!(partition
        .add_node(node("node-1", &res(&[("memory", 100)])), vec![recovered])
        .is_err());
    // the half registered node may not stay behind
    assert!(partition.get_node("node-1").is_none());
    assert!(partition.total_partition_resource().is_zero());
    assert_eq!(partition.node_count(), 0);
}

#[test]
fn releasing_asks_cancels_their_reservations() {
    let partition = capped_partition(&res(&[("memory", 20)]));
    partition
        .add_node(node("node-1", &res(&[("memory", 100)])), Vec::new())
        .unwrap();
    partition.add_application(app("app-1", "root.default")).unwrap();
    partition
        .add_allocation_ask("app-1", ask("ask-1", "app-1", &res(&[("memory", 10)]), 3))
        .unwrap();
    assert!(partition.try_allocate().is_some());
    assert!(partition.try_allocate().is_some());
    assert!(partition.try_allocate().is_none());
    assert_eq!(partition.reservations().get("app-1"), Some(&1));

    // dropping every ask also drops the reservation books everywhere
    partition.remove_allocation_ask("app-1", "");
    assert!(partition.reservations().is_empty());
    assert!(!partition.get_node("node-1").unwrap().is_reserved());
    let app = partition.get_application("app-1").unwrap();
    assert_eq!(app.reservation_count(), 0);
    assert!(app.pending_resource().is_zero());
    let queue = partition.get_queue("root.default").unwrap();
    assert!(queue.pending_resource().is_zero());
}

#[test]
fn books_stay_balanced_across_the_cycle() {
    let partition = base_partition();
    partition
        .add_node(node("node-1", &res(&[("memory", 60)])), Vec::new())
        .unwrap();
    partition
        .add_node(node("node-2", &res(&[("memory", 60)])), Vec::new())
        .unwrap();
    partition.add_application(app("app-1", "root.default")).unwrap();
    partition.add_application(app("app-2", "root.default")).unwrap();
    partition
        .add_allocation_ask("app-1", ask("ask-1", "app-1", &res(&[("memory", 20)]), 2))
        .unwrap();
    partition
        .add_allocation_ask("app-2", ask("ask-2", "app-2", &res(&[("memory", 10)]), 3))
        .unwrap();
    while partition.try_allocate().is_some() {}

    // the three books must agree at every quiescent point
    let node_total = partition
        .nodes()
        .iter()
        .fold(Resource::new(), |acc, node| Resource::add(&acc, &node.allocated_resource()));
    let app_total = partition
        .applications()
        .iter()
        .fold(Resource::new(), |acc, app| Resource::add(&acc, &app.allocated_resource()));
    assert_eq!(node_total, partition.allocated_resource());
    assert_eq!(app_total, partition.allocated_resource());
    assert_eq!(partition.allocated_resource(), res(&[("memory", 70)]));
    // every committed allocation is known to its app and node
    for node in partition.nodes() {
        for alloc in node.allocations() {
            let app = partition.get_application(&alloc.application_id).unwrap();
            assert!(app.allocation_count() > 0);
        }
    }
}

#[test]
fn usage_histogram_buckets_nodes() {
    let partition = base_partition();
    partition
        .add_node(node("node-1", &res(&[("memory", 100)])), Vec::new())
        .unwrap();
    partition.add_application(app("app-1", "root.default")).unwrap();
    partition
        .add_allocation_ask("app-1", ask("ask-1", "app-1", &res(&[("memory", 45)]), 1))
        .unwrap();
    partition.try_allocate().expect("allocation expected");

    let usage = partition.calculate_nodes_resource_usage();
    let buckets = usage.get("memory").expect("memory distribution expected");
    assert_eq!(buckets.len(), 10);
    // 45% lands in the 40 to 50 bucket
    assert_eq!(buckets[4], 1);
    assert_eq!(buckets.iter().sum::<u64>(), 1);
}

#[test]
fn outstanding_requests_snapshot_pending_asks() {
    let partition = base_partition();
    partition.add_application(app("app-1", "root.default")).unwrap();
    assert!(partition.calculate_outstanding_requests().is_empty());
    partition
        .add_allocation_ask("app-1", ask("ask-1", "app-1", &res(&[("memory", 10)]), 2))
        .unwrap();
    let outstanding = partition.calculate_outstanding_requests();
    assert_eq!(outstanding.len(), 1);
    assert_eq!(outstanding[0].max_allocations, 2);
}

#[test]
fn queue_info_reports_the_tree() {
    let partition = capped_partition(&res(&[("memory", 20)]));
    partition
        .add_node(node("node-1", &res(&[("memory", 100)])), Vec::new())
        .unwrap();
    partition.add_application(app("app-1", "root.default")).unwrap();
    partition
        .add_allocation_ask("app-1", ask("ask-1", "app-1", &res(&[("memory", 10)]), 1))
        .unwrap();
    partition.try_allocate().expect("allocation expected");

    let info = partition.queue_info();
    assert_eq!(info.queue_name, "root");
    assert_eq!(info.child_queues.len(), 1);
    let leaf = &info.child_queues[0];
    assert_eq!(leaf.queue_name, "default");
    assert_eq!(leaf.capacities.used_capacity, res(&[("memory", 10)]));
    assert_eq!(leaf.capacities.max_capacity, res(&[("memory", 20)]));
    assert_eq!(leaf.capacities.abs_used_capacity, res(&[("memory", 50)]));
    // the snapshot serializes for the web layer as is
    let rendered = serde_json::to_string(&info).unwrap();
    assert!(rendered.contains("\"queueName\":\"root\""));
    assert!(rendered.contains("\"maxCapacity\""));
}
