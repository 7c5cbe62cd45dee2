//! Shared fixture for the sharding protocol tests: an in-process
//! multi-node cluster of counter entries with observable lifecycle.
#![allow(dead_code)]

use async_trait::async_trait;
use kameo::request::MessageSend;
use kameo::actor::ActorRef;
use shoal_sharding::{
    ClusterSharding, Envelope, EntryAction, EntryBehavior, EntryId, EntryTypeSettings,
    GetRegionStats, LocalCluster, LogDeadLetters, MemoryJournal, NodeName, PathDirectory,
    RegionStats, ShardId, ShardRegion, ShardingConfig,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Test message vocabulary for counter entries. Ids look like
/// `"A-1"`; the shard is the part before the dash.
pub enum CounterMsg {
    Increment {
        id: String,
        amount: u64,
        /// Simulated work inside the entry, for timeout scenarios.
        delay_ms: u64,
    },
    Get {
        id: String,
        reply: oneshot::Sender<u64>,
    },
    /// Passivation stop message; the entry stops after `delay_ms`.
    Stop { id: String, delay_ms: u64 },
    /// Ask the entry to passivate itself with a `Stop`.
    PassivateNow { id: String, stop_delay_ms: u64 },
    /// Not part of the sharded vocabulary; must be dead-lettered.
    Unrelated,
}

impl CounterMsg {
    fn id(&self) -> Option<&str> {
        match self {
            CounterMsg::Increment { id, .. }
            | CounterMsg::Get { id, .. }
            | CounterMsg::Stop { id, .. }
            | CounterMsg::PassivateNow { id, .. } => Some(id),
            CounterMsg::Unrelated => None,
        }
    }
}

/// Shared observation log across all nodes of a test cluster.
#[derive(Clone, Default)]
pub struct Probe {
    inner: Arc<Mutex<ProbeInner>>,
}

#[derive(Default)]
struct ProbeInner {
    created: HashMap<String, usize>,
    delivered: HashMap<String, Vec<u64>>,
}

impl Probe {
    pub fn record_created(&self, id: &str) {
        *self
            .inner
            .lock()
            .unwrap()
            .created
            .entry(id.to_string())
            .or_default() += 1;
    }

    pub fn record_delivered(&self, id: &str, amount: u64) {
        self.inner
            .lock()
            .unwrap()
            .delivered
            .entry(id.to_string())
            .or_default()
            .push(amount);
    }

    pub fn created_count(&self, id: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .created
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    pub fn deliveries(&self, id: &str) -> Vec<u64> {
        self.inner
            .lock()
            .unwrap()
            .delivered
            .get(id)
            .cloned()
            .unwrap_or_default()
    }
}

pub struct CounterBehavior {
    id: String,
    count: u64,
    probe: Probe,
}

#[async_trait]
impl EntryBehavior<CounterMsg> for CounterBehavior {
    async fn receive(&mut self, msg: CounterMsg) -> EntryAction<CounterMsg> {
        match msg {
            CounterMsg::Increment {
                amount, delay_ms, ..
            } => {
                if delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                self.count += amount;
                self.probe.record_delivered(&self.id, amount);
                EntryAction::Continue
            }
            CounterMsg::Get { reply, .. } => {
                let _ = reply.send(self.count);
                EntryAction::Continue
            }
            CounterMsg::PassivateNow { id, stop_delay_ms } => {
                EntryAction::Passivate(CounterMsg::Stop {
                    id,
                    delay_ms: stop_delay_ms,
                })
            }
            CounterMsg::Stop { delay_ms, .. } => {
                if delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                EntryAction::Stop
            }
            CounterMsg::Unrelated => EntryAction::Continue,
        }
    }
}

fn extract(msg: CounterMsg) -> Result<(EntryId, CounterMsg), CounterMsg> {
    match msg.id() {
        Some(id) => {
            let id = EntryId::from(id);
            Ok((id, msg))
        }
        None => Err(msg),
    }
}

fn resolve(msg: &CounterMsg) -> ShardId {
    match msg.id() {
        Some(id) => ShardId::from(id.split('-').next().unwrap_or("")),
        None => ShardId::from(""),
    }
}

/// Shared cluster infrastructure: membership, journal, directory, probe.
pub struct TestCluster {
    pub cluster: LocalCluster,
    pub journal: Arc<MemoryJournal>,
    pub directory: PathDirectory,
    pub probe: Probe,
    pub config: ShardingConfig,
}

pub struct TestNode {
    pub sharding: Arc<ClusterSharding>,
    pub region: ActorRef<ShardRegion<CounterMsg>>,
    pub dead_letters: LogDeadLetters,
}

impl TestCluster {
    pub fn new(config: ShardingConfig) -> Self {
        Self {
            cluster: LocalCluster::new(),
            journal: Arc::new(MemoryJournal::new()),
            directory: PathDirectory::new(),
            probe: Probe::default(),
            config,
        }
    }

    /// Bring a member up without starting sharding on it.
    pub fn member_up(&self, name: &str) {
        self.cluster.member_up(NodeName::from(name), []);
    }

    /// Bring a member up and start the counter entry type on it.
    pub fn start_node(&self, name: &str, remember_entries: bool) -> TestNode {
        self.member_up(name);
        let sharding = Arc::new(ClusterSharding::new(
            name,
            self.config.clone(),
            Arc::new(self.cluster.clone()),
            self.journal.clone(),
            self.directory.clone(),
        ));

        let probe = self.probe.clone();
        let dead_letters = LogDeadLetters::new();
        let settings = EntryTypeSettings::new("counter", extract, resolve)
            .with_factory(move |id: &EntryId| -> Box<dyn EntryBehavior<CounterMsg>> {
                probe.record_created(id.as_str());
                Box::new(CounterBehavior {
                    id: id.as_str().to_string(),
                    count: 0,
                    probe: probe.clone(),
                })
            })
            .with_remember_entries(remember_entries)
            .with_dead_letters(dead_letters.clone());

        let region = sharding.start(settings).expect("start entry type");
        TestNode {
            sharding,
            region,
            dead_letters,
        }
    }
}

/// Config with intervals short enough for tests.
pub fn fast_config() -> ShardingConfig {
    ShardingConfig {
        retry_interval: Duration::from_millis(50),
        coordinator_failure_backoff: Duration::from_millis(100),
        shard_start_timeout: Duration::from_millis(500),
        shard_failure_backoff: Duration::from_millis(100),
        entry_restart_backoff: Duration::from_millis(100),
        // effectively disabled unless a test opts in
        rebalance_interval: Duration::from_secs(3600),
        snapshot_interval: Duration::from_secs(3600),
        ..ShardingConfig::default()
    }
}

pub async fn increment(region: &ActorRef<ShardRegion<CounterMsg>>, id: &str, amount: u64) {
    increment_slow(region, id, amount, 0).await;
}

pub async fn increment_slow(
    region: &ActorRef<ShardRegion<CounterMsg>>,
    id: &str,
    amount: u64,
    delay_ms: u64,
) {
    region
        .tell(Envelope(CounterMsg::Increment {
            id: id.to_string(),
            amount,
            delay_ms,
        }))
        .send()
        .await
        .expect("region alive");
}

pub async fn passivate(
    region: &ActorRef<ShardRegion<CounterMsg>>,
    id: &str,
    stop_delay_ms: u64,
) {
    region
        .tell(Envelope(CounterMsg::PassivateNow {
            id: id.to_string(),
            stop_delay_ms,
        }))
        .send()
        .await
        .expect("region alive");
}

/// Current count of an entry, if it answers within a second.
pub async fn get_count(region: &ActorRef<ShardRegion<CounterMsg>>, id: &str) -> Option<u64> {
    let (tx, rx) = oneshot::channel();
    region
        .tell(Envelope(CounterMsg::Get {
            id: id.to_string(),
            reply: tx,
        }))
        .send()
        .await
        .ok()?;
    tokio::time::timeout(Duration::from_secs(1), rx).await.ok()?.ok()
}

pub async fn stats(region: &ActorRef<ShardRegion<CounterMsg>>) -> RegionStats {
    region
        .ask(GetRegionStats)
        .send()
        .await
        .expect("region alive")
}

/// Poll until `check` yields true or the deadline passes.
pub async fn eventually<F>(what: &str, deadline: Duration, mut check: F)
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    loop {
        if check() {
            return;
        }
        assert!(
            start.elapsed() < deadline,
            "condition not met within {deadline:?}: {what}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Async variant of [`eventually`].
pub async fn eventually_async<F, Fut>(what: &str, deadline: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    loop {
        if check().await {
            return;
        }
        assert!(
            start.elapsed() < deadline,
            "condition not met within {deadline:?}: {what}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
