//! Message routing: first-touch allocation, buffering, passivation and
//! dead letters.

mod support;

use shoal_sharding::coordinator::messages::Register;
use shoal_sharding::coordinator::ShardCoordinator;
use shoal_sharding::directory::coordinator_path;
use shoal_sharding::{Envelope, NodeName, RegionKey, ShardId, TypeName};
use std::time::Duration;
use support::*;

#[tokio::test]
async fn test_first_touch_allocates_to_least_loaded_region() {
    let cluster = TestCluster::new(fast_config());
    let n1 = cluster.start_node("n1", false);

    // n1 registers first so ties break toward it.
    eventually_async("n1 registered", Duration::from_secs(3), || async {
        stats(&n1.region).await.has_coordinator
    })
    .await;
    let n2 = cluster.start_node("n2", false);
    eventually_async("n2 registered", Duration::from_secs(3), || async {
        stats(&n2.region).await.has_coordinator
    })
    .await;

    // First touch through n2; the coordinator still picks n1 (tie by
    // registration order) and n2 learns the home.
    increment(&n2.region, "A-1", 7).await;

    eventually_async("message delivered via n1", Duration::from_secs(3), || async {
        get_count(&n2.region, "A-1").await == Some(7)
    })
    .await;

    let n1_stats = stats(&n1.region).await;
    assert!(n1_stats.hosted_shards.contains(&ShardId::from("A")));
    let n2_stats = stats(&n2.region).await;
    assert!(n2_stats.hosted_shards.is_empty());
}

#[tokio::test]
async fn test_buffer_overflow_drops_excess_to_dead_letters() {
    let mut config = fast_config();
    config.buffer_size = 10;
    let cluster = TestCluster::new(config);

    // The oldest member exists but runs no sharding yet, so no
    // coordinator is reachable and everything buffers.
    cluster.member_up("n1");
    let n2 = cluster.start_node("n2", false);

    for amount in 1..=15u64 {
        increment(&n2.region, "Z-1", amount).await;
    }

    eventually("five drops recorded", Duration::from_secs(2), || {
        n2.dead_letters.dropped() == 5
    })
    .await;
    let region_stats = stats(&n2.region).await;
    assert_eq!(region_stats.buffered_messages, 10);

    // Bring the coordinator up; the ten survivors must arrive in order.
    let _n1 = cluster.start_node("n1", false);
    let probe = cluster.probe.clone();
    eventually("buffered messages flushed", Duration::from_secs(5), move || {
        probe.deliveries("Z-1") == (1..=10).collect::<Vec<_>>()
    })
    .await;
}

#[tokio::test]
async fn test_unrecognized_messages_go_to_dead_letters() {
    let cluster = TestCluster::new(fast_config());
    let n1 = cluster.start_node("n1", false);

    n1.region
        .tell(Envelope(CounterMsg::Unrelated))
        .send()
        .await
        .unwrap();

    eventually("unrelated message dropped", Duration::from_secs(2), || {
        n1.dead_letters.dropped() == 1
    })
    .await;
}

#[tokio::test]
async fn test_passivate_with_racing_message_restarts_entry() {
    let cluster = TestCluster::new(fast_config());
    let n1 = cluster.start_node("n1", false);

    increment(&n1.region, "A-1", 5).await;
    eventually_async("entry live", Duration::from_secs(3), || async {
        get_count(&n1.region, "A-1").await == Some(5)
    })
    .await;

    // Slow stop leaves a window for the racing increment to land in the
    // shard's passivation buffer.
    passivate(&n1.region, "A-1", 200).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    increment(&n1.region, "A-1", 3).await;

    // The entry is restarted with the buffered message; counter state
    // does not survive passivation.
    eventually_async("entry restarted with buffer", Duration::from_secs(3), || async {
        get_count(&n1.region, "A-1").await == Some(3)
    })
    .await;
    assert_eq!(cluster.probe.created_count("A-1"), 2);
}

#[tokio::test]
async fn test_duplicate_registration_persists_no_new_event() {
    let cluster = TestCluster::new(fast_config());
    let n1 = cluster.start_node("n1", false);
    eventually_async("n1 registered", Duration::from_secs(3), || async {
        stats(&n1.region).await.has_coordinator
    })
    .await;

    let pid = coordinator_path("sharding", &TypeName::from("counter"));
    let events_before = cluster.journal.event_count(&pid);
    assert!(events_before >= 1);

    // Replay the registration by hand; the coordinator must ack without
    // persisting anything new.
    let coordinator = cluster
        .directory
        .select::<ShardCoordinator<CounterMsg>>(&NodeName::from("n1"), &pid)
        .expect("coordinator published");
    let key = RegionKey::of(
        &NodeName::from("n1"),
        "sharding",
        &TypeName::from("counter"),
    );
    coordinator
        .tell(Register {
            region: n1.region.clone(),
            key,
        })
        .send()
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(cluster.journal.event_count(&pid), events_before);

    // Still fully functional afterwards.
    increment(&n1.region, "A-1", 1).await;
    eventually_async("routing still works", Duration::from_secs(3), || async {
        get_count(&n1.region, "A-1").await == Some(1)
    })
    .await;
}
