//! Recovery: coordinator failover, remembered entries and persistence
//! failure retries.

mod support;

use shoal_sharding::{NodeName, ShardId};
use std::time::Duration;
use support::*;

#[tokio::test]
async fn test_coordinator_failover_recovers_allocations() {
    let cluster = TestCluster::new(fast_config());
    let n1 = cluster.start_node("n1", false);
    eventually_async("n1 registered", Duration::from_secs(3), || async {
        stats(&n1.region).await.has_coordinator
    })
    .await;
    let n2 = cluster.start_node("n2", false);
    eventually_async("n2 registered", Duration::from_secs(3), || async {
        stats(&n2.region).await.has_coordinator
    })
    .await;

    // A lands on n1 (tie to first registered), B on n2.
    increment(&n1.region, "A-1", 1).await;
    eventually_async("A hosted", Duration::from_secs(3), || async {
        get_count(&n1.region, "A-1").await == Some(1)
    })
    .await;
    increment(&n1.region, "B-1", 2).await;
    eventually_async("B hosted on n2", Duration::from_secs(3), || async {
        stats(&n2.region).await.hosted_shards == vec![ShardId::from("B")]
    })
    .await;

    // Remove the oldest node; n2 must take over the coordinator, recover
    // the persisted map and keep B exactly where it was.
    cluster.cluster.member_removed(&NodeName::from("n1"));
    n1.sharding.shutdown().await;

    eventually_async("n2 re-registered to new coordinator", Duration::from_secs(5), || async {
        stats(&n2.region).await.has_coordinator
    })
    .await;

    // B survived in place with its state.
    eventually_async("B still answers", Duration::from_secs(5), || async {
        get_count(&n2.region, "B-1").await == Some(2)
    })
    .await;

    // A's region is gone; the new coordinator reallocates on demand and
    // the entry starts fresh.
    increment(&n2.region, "A-1", 10).await;
    eventually_async("A reallocated to n2", Duration::from_secs(5), || async {
        get_count(&n2.region, "A-1").await == Some(10)
    })
    .await;
    let hosted = stats(&n2.region).await.hosted_shards;
    assert!(hosted.contains(&ShardId::from("A")));
    assert!(hosted.contains(&ShardId::from("B")));
}

#[tokio::test]
async fn test_remembered_entries_recreated_after_restart() {
    let cluster = TestCluster::new(fast_config());
    let n1 = cluster.start_node("n1", true);

    increment(&n1.region, "A-1", 1).await;
    increment(&n1.region, "A-2", 1).await;
    eventually_async("both entries live", Duration::from_secs(3), || async {
        get_count(&n1.region, "A-1").await == Some(1)
            && get_count(&n1.region, "A-2").await == Some(1)
    })
    .await;

    // Passivate A-2 cleanly; its stop is persisted.
    passivate(&n1.region, "A-2", 0).await;
    let journal = cluster.journal.clone();
    eventually("entry stop persisted", Duration::from_secs(3), move || {
        // started A-1, started A-2, stopped A-2
        journal.event_count("/sharding/counterShard/A") == 3
    })
    .await;

    // Restart the node against the same journal.
    n1.sharding.shutdown().await;
    let n1 = cluster.start_node("n1", true);

    // The shard is re-hosted on re-registration and only the remembered
    // entry comes back, without any message prompting it.
    eventually("A-1 recreated from journal", Duration::from_secs(5), || {
        cluster.probe.created_count("A-1") == 2
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        cluster.probe.created_count("A-2"),
        1,
        "passivated entry must stay stopped"
    );

    // Entry state itself is not remembered, only existence.
    assert_eq!(get_count(&n1.region, "A-1").await, Some(0));
}

#[tokio::test]
async fn test_shard_persistence_failure_is_retried() {
    let cluster = TestCluster::new(fast_config());
    let n1 = cluster.start_node("n1", true);

    // Warm up so the shard exists before the fault is injected.
    increment(&n1.region, "A-1", 1).await;
    eventually_async("warmup delivered", Duration::from_secs(3), || async {
        get_count(&n1.region, "A-1").await == Some(1)
    })
    .await;

    // The next append (EntryStarted for A-2) fails; the message parks in
    // the entry buffer until the retry lands it.
    cluster.journal.fail_next_appends(1);
    increment(&n1.region, "A-2", 9).await;

    eventually_async("delivery after retry", Duration::from_secs(5), || async {
        get_count(&n1.region, "A-2").await == Some(9)
    })
    .await;
    assert_eq!(cluster.probe.deliveries("A-2"), vec![9]);
}
