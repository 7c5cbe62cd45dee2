//! Rebalancing: shard handoff between regions and the handoff timeout.

mod support;

use shoal_sharding::{LeastShardConfig, ShardId};
use std::time::Duration;
use support::*;

fn rebalancing_config(hand_off_timeout: Duration) -> shoal_sharding::ShardingConfig {
    let mut config = fast_config();
    config.rebalance_interval = Duration::from_millis(100);
    config.hand_off_timeout = hand_off_timeout;
    config.least_shard = LeastShardConfig {
        rebalance_threshold: 1,
        max_simultaneous_rebalance: 1,
    };
    config
}

#[tokio::test]
async fn test_rebalance_moves_shard_to_empty_region() {
    let cluster = TestCluster::new(rebalancing_config(Duration::from_secs(5)));
    let n1 = cluster.start_node("n1", false);

    increment(&n1.region, "A-1", 1).await;
    increment(&n1.region, "B-1", 1).await;
    eventually_async("both shards on n1", Duration::from_secs(3), || async {
        stats(&n1.region).await.hosted_shards.len() == 2
    })
    .await;

    // An empty region joins; the imbalance is 2 vs 0 and the first
    // allocated shard ("A") must move over.
    let n2 = cluster.start_node("n2", false);

    eventually_async("shard A moved to n2", Duration::from_secs(5), || async {
        let on_n2 = stats(&n2.region).await.hosted_shards;
        let on_n1 = stats(&n1.region).await.hosted_shards;
        on_n2 == vec![ShardId::from("A")] && on_n1 == vec![ShardId::from("B")]
    })
    .await;

    // Entry state was dropped with the old shard; new messages reach the
    // new home and start from scratch.
    increment(&n1.region, "A-1", 10).await;
    eventually_async("A-1 recreated on n2", Duration::from_secs(3), || async {
        get_count(&n1.region, "A-1").await == Some(10)
    })
    .await;
    // B kept its state throughout.
    assert_eq!(get_count(&n2.region, "B-1").await, Some(1));
}

#[tokio::test]
async fn test_handoff_timeout_leaves_shard_allocated() {
    let cluster = TestCluster::new(rebalancing_config(Duration::from_millis(150)));
    let n1 = cluster.start_node("n1", false);

    increment(&n1.region, "A-1", 1).await;
    increment(&n1.region, "B-1", 1).await;
    eventually_async("both shards on n1", Duration::from_secs(3), || async {
        stats(&n1.region).await.hosted_shards.len() == 2
    })
    .await;

    // Park A-1 in a long receive so it cannot honor the stop within the
    // handoff timeout.
    increment_slow(&n1.region, "A-1", 1, 1200).await;
    let n2 = cluster.start_node("n2", false);

    // The first rebalance attempt must time out and leave the busy shard
    // where it is.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let on_n2 = stats(&n2.region).await.hosted_shards;
    assert!(on_n2.is_empty(), "busy shard must not move early: {on_n2:?}");

    // The healthy shard keeps answering the whole time.
    assert_eq!(get_count(&n2.region, "B-1").await, Some(1));

    // Once the entry unblocks, later ticks complete the move and the
    // shard is usable again wherever it lands.
    increment(&n1.region, "A-1", 5).await;
    eventually_async("shard A usable after retry", Duration::from_secs(6), || async {
        get_count(&n1.region, "A-1").await.is_some()
    })
    .await;
}
