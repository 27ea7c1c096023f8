//! Peer selection: round-robin, weighted, and fair load balancing.
//!
//! Items wrap a session holder plus a rolling five-bucket window of
//! per-second statistics. Selection strategies share one `get(hint)`
//! surface:
//!
//! - **round-robin** cycles an index and ignores the hint;
//! - **weighted** builds non-decreasing prefix sums over base weights and
//!   picks the smallest index whose prefix covers `hint mod total`, so
//!   hashing a caller key yields a stable peer;
//! - **fair** derives a weight per call from the window,
//!   `base × success_ratio × exp(−α·avg_latency_ms) ÷ (1 + in_flight)`,
//!   and excludes disconnected items entirely.
//!
//! [`SdLoadBalance`] bridges the discovery feed: every change event
//! becomes an add/delete delta applied under a write lock followed by an
//! index rebuild, with a factory callback building the session holder for
//! each new instance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::discovery::{InstanceMap, ServiceDiscovery, ServiceInstance};
use crate::error::SelectError;
use crate::rpc::Codec;
use crate::session::Session;

/// Latency damping factor for the fair weight (per millisecond).
const FAIR_ALPHA: f64 = 0.001;

/// Number of one-second statistics buckets.
const WINDOW_BUCKETS: u64 = 5;

/// Default base weight for discovery-fed items whose instance data names
/// none.
const DEFAULT_WEIGHT: u32 = 10;

/// A connection an item can hand out.
pub trait SessionHolder: Send + Sync + 'static {
    /// Whether the underlying stream is connected.
    fn is_connected(&self) -> bool;

    /// Tears the connection down.
    fn close(&self);
}

impl<C: Codec> SessionHolder for Session<C> {
    fn is_connected(&self) -> bool {
        Session::is_connected(self)
    }

    fn close(&self) {
        Session::close(self);
    }
}

/// How one tracked request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Completed with a response.
    Ok,
    /// Hit its deadline.
    Timeout,
    /// Failed with an I/O or protocol error.
    Error,
}

#[derive(Debug, Default)]
struct StatsBucket {
    second: AtomicU64,
    used_time_ms: AtomicU64,
    total: AtomicU32,
    oks: AtomicU32,
    timeouts: AtomicU32,
    errs: AtomicU32,
}

impl StatsBucket {
    fn roll_to(&self, now_s: u64) {
        if self.second.swap(now_s, Ordering::AcqRel) != now_s {
            self.used_time_ms.store(0, Ordering::Relaxed);
            self.total.store(0, Ordering::Relaxed);
            self.oks.store(0, Ordering::Relaxed);
            self.timeouts.store(0, Ordering::Relaxed);
            self.errs.store(0, Ordering::Relaxed);
        }
    }
}

/// Aggregated view over the live window.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct StatsSnapshot {
    /// Summed request latency, milliseconds.
    pub used_time_ms: u64,
    /// Requests issued.
    pub total: u32,
    /// Requests completed successfully.
    pub oks: u32,
    /// Requests that timed out.
    pub timeouts: u32,
    /// Requests that failed.
    pub errs: u32,
}

/// Rolling per-second statistics window.
#[derive(Debug, Default)]
pub struct StatsWindow {
    buckets: [StatsBucket; WINDOW_BUCKETS as usize],
}

impl StatsWindow {
    fn bucket(&self, now_s: u64) -> &StatsBucket {
        let bucket = &self.buckets[(now_s % WINDOW_BUCKETS) as usize];
        bucket.roll_to(now_s);
        bucket
    }

    /// Sums the buckets still inside the window.
    #[must_use]
    pub fn aggregate(&self, now_s: u64) -> StatsSnapshot {
        let mut snapshot = StatsSnapshot::default();
        let oldest = now_s.saturating_sub(WINDOW_BUCKETS - 1);
        for bucket in &self.buckets {
            let second = bucket.second.load(Ordering::Acquire);
            if second < oldest || second > now_s {
                continue;
            }
            snapshot.used_time_ms += bucket.used_time_ms.load(Ordering::Relaxed);
            snapshot.total += bucket.total.load(Ordering::Relaxed);
            snapshot.oks += bucket.oks.load(Ordering::Relaxed);
            snapshot.timeouts += bucket.timeouts.load(Ordering::Relaxed);
            snapshot.errs += bucket.errs.load(Ordering::Relaxed);
        }
        snapshot
    }
}

/// One selectable peer.
pub struct LoadBalanceItem {
    id: u64,
    holder: Arc<dyn SessionHolder>,
    weight: u32,
    window: StatsWindow,
    doing: AtomicU32,
}

impl std::fmt::Debug for LoadBalanceItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalanceItem")
            .field("id", &self.id)
            .field("weight", &self.weight)
            .field("doing", &self.doing.load(Ordering::Relaxed))
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl LoadBalanceItem {
    /// Wraps a holder with a base weight.
    #[must_use]
    pub fn new(id: u64, holder: Arc<dyn SessionHolder>, weight: u32) -> Arc<Self> {
        Arc::new(Self {
            id,
            holder,
            weight,
            window: StatsWindow::default(),
            doing: AtomicU32::new(0),
        })
    }

    /// The peer's id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Base weight.
    #[must_use]
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// The wrapped connection.
    #[must_use]
    pub fn holder(&self) -> &Arc<dyn SessionHolder> {
        &self.holder
    }

    /// Valid means the underlying stream is connected.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.holder.is_connected()
    }

    /// Requests currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> u32 {
        self.doing.load(Ordering::Relaxed)
    }

    /// Statistics over the live window.
    #[must_use]
    pub fn stats(&self, now_s: u64) -> StatsSnapshot {
        self.window.aggregate(now_s)
    }

    /// Records a request being issued.
    pub fn on_issue(&self, now_s: u64) {
        self.doing.fetch_add(1, Ordering::Relaxed);
        self.window.bucket(now_s).total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a request finishing.
    pub fn on_complete(&self, now_s: u64, elapsed_ms: u64, outcome: RequestOutcome) {
        let prev = self.doing.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "complete without matching issue");
        let bucket = self.window.bucket(now_s);
        bucket.used_time_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
        match outcome {
            RequestOutcome::Ok => bucket.oks.fetch_add(1, Ordering::Relaxed),
            RequestOutcome::Timeout => bucket.timeouts.fetch_add(1, Ordering::Relaxed),
            RequestOutcome::Error => bucket.errs.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// The per-call fair weight; zero for invalid items.
    #[must_use]
    pub fn fair_weight(&self, now_s: u64) -> f64 {
        if !self.is_valid() {
            return 0.0;
        }
        let stats = self.stats(now_s);
        let success_ratio = if stats.total == 0 {
            1.0
        } else {
            f64::from(stats.oks) / f64::from(stats.total)
        };
        let avg_latency = if stats.oks == 0 {
            0.0
        } else {
            stats.used_time_ms as f64 / f64::from(stats.oks)
        };
        let doing = f64::from(self.doing.load(Ordering::Relaxed));
        f64::from(self.weight) * success_ratio * (-FAIR_ALPHA * avg_latency).exp() / (1.0 + doing)
    }
}

/// Selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Uniform cyclic selection.
    RoundRobin,
    /// Static prefix-sum weighted selection.
    Weighted,
    /// Statistics-derived weighting per call.
    Fair,
}

#[derive(Default)]
struct BalanceIndex {
    items: HashMap<u64, Arc<LoadBalanceItem>>,
    order: Vec<Arc<LoadBalanceItem>>,
    prefix: Vec<u64>,
    total_weight: u64,
}

impl BalanceIndex {
    fn rebuild(&mut self) {
        let mut order: Vec<Arc<LoadBalanceItem>> = self.items.values().cloned().collect();
        order.sort_by_key(|item| item.id);
        let mut prefix = Vec::with_capacity(order.len());
        let mut total = 0u64;
        for item in &order {
            total += u64::from(item.weight);
            prefix.push(total);
        }
        self.order = order;
        self.prefix = prefix;
        self.total_weight = total;
    }
}

/// A peer set with one selection strategy.
pub struct LoadBalance {
    strategy: Strategy,
    index: RwLock<BalanceIndex>,
    cursor: AtomicUsize,
}

impl std::fmt::Debug for LoadBalance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalance")
            .field("strategy", &self.strategy)
            .field("items", &self.index.read().order.len())
            .finish()
    }
}

impl LoadBalance {
    /// An empty set with the given strategy.
    #[must_use]
    pub fn new(strategy: Strategy) -> Arc<Self> {
        Arc::new(Self {
            strategy,
            index: RwLock::new(BalanceIndex::default()),
            cursor: AtomicUsize::new(0),
        })
    }

    /// The configured strategy.
    #[must_use]
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Adds (or replaces) one item and rebuilds the index.
    pub fn add(&self, item: Arc<LoadBalanceItem>) {
        let mut index = self.index.write();
        index.items.insert(item.id, item);
        index.rebuild();
    }

    /// Removes one item and rebuilds the index.
    pub fn del(&self, id: u64) -> Option<Arc<LoadBalanceItem>> {
        let mut index = self.index.write();
        let removed = index.items.remove(&id);
        if removed.is_some() {
            index.rebuild();
        }
        removed
    }

    /// Replaces the whole set.
    pub fn set(&self, items: Vec<Arc<LoadBalanceItem>>) {
        let mut index = self.index.write();
        index.items = items.into_iter().map(|item| (item.id, item)).collect();
        index.rebuild();
    }

    /// Applies a discovery delta under one lock, then rebuilds.
    pub fn update(
        &self,
        adds: Vec<Arc<LoadBalanceItem>>,
        dels: &[u64],
    ) -> Vec<Arc<LoadBalanceItem>> {
        let mut index = self.index.write();
        let mut removed = Vec::new();
        for id in dels {
            if let Some(item) = index.items.remove(id) {
                removed.push(item);
            }
        }
        for item in adds {
            index.items.insert(item.id, item);
        }
        index.rebuild();
        removed
    }

    /// Looks one item up by id.
    #[must_use]
    pub fn get_by_id(&self, id: u64) -> Option<Arc<LoadBalanceItem>> {
        self.index.read().items.get(&id).cloned()
    }

    /// Number of items, valid or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.read().order.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.read().order.is_empty()
    }

    /// Selects a peer. `hint` steers weighted selection (hash a caller
    /// key for stable assignment); round-robin ignores it.
    pub fn get(&self, hint: u64) -> Result<Arc<LoadBalanceItem>, SelectError> {
        let index = self.index.read();
        if index.order.is_empty() {
            return Err(SelectError::NoService);
        }
        match self.strategy {
            Strategy::RoundRobin => {
                let n = index.order.len();
                let start = self.cursor.fetch_add(1, Ordering::Relaxed);
                for offset in 0..n {
                    let item = &index.order[(start + offset) % n];
                    if item.is_valid() {
                        return Ok(Arc::clone(item));
                    }
                }
                Err(SelectError::NoConnection)
            }
            Strategy::Weighted => {
                if index.total_weight == 0 {
                    return Err(SelectError::NoConnection);
                }
                let target = hint % index.total_weight;
                let chosen = index
                    .prefix
                    .partition_point(|&prefix| prefix <= target);
                let n = index.order.len();
                for offset in 0..n {
                    let item = &index.order[(chosen + offset) % n];
                    if item.is_valid() {
                        return Ok(Arc::clone(item));
                    }
                }
                Err(SelectError::NoConnection)
            }
            Strategy::Fair => {
                let now_s = crate::timer::monotonic_ms() / 1000;
                let weights: Vec<f64> = index
                    .order
                    .iter()
                    .map(|item| item.fair_weight(now_s))
                    .collect();
                let total: f64 = weights.iter().sum();
                if total <= 0.0 {
                    // All invalid, or every live peer weighted to zero:
                    // fall back to any valid item before giving up.
                    return index
                        .order
                        .iter()
                        .find(|item| item.is_valid())
                        .cloned()
                        .ok_or(SelectError::NoConnection);
                }
                let steer = if hint == u64::MAX {
                    self.cursor.fetch_add(1, Ordering::Relaxed) as u64
                } else {
                    hint
                };
                let mut target = (steer % 10_000) as f64 / 10_000.0 * total;
                for (item, weight) in index.order.iter().zip(&weights) {
                    if *weight <= 0.0 {
                        continue;
                    }
                    if target < *weight {
                        return Ok(Arc::clone(item));
                    }
                    target -= *weight;
                }
                // Floating point spill lands on the last live item.
                index
                    .order
                    .iter()
                    .zip(&weights)
                    .rev()
                    .find(|(_, weight)| **weight > 0.0)
                    .map(|(item, _)| Arc::clone(item))
                    .ok_or(SelectError::NoConnection)
            }
        }
    }
}

/// Factory building the session holder for a newly discovered instance.
pub type HolderFactory =
    Arc<dyn Fn(&ServiceInstance) -> Option<Arc<dyn SessionHolder>> + Send + Sync + 'static>;

/// Discovery-fed collection of per-service balancers.
pub struct SdLoadBalance {
    discovery: Arc<dyn ServiceDiscovery>,
    balances: RwLock<HashMap<(String, String), Arc<LoadBalance>>>,
    strategies: RwLock<HashMap<(String, String), Strategy>>,
    default_strategy: Strategy,
    factory: RwLock<Option<HolderFactory>>,
}

impl std::fmt::Debug for SdLoadBalance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdLoadBalance")
            .field("services", &self.balances.read().len())
            .field("default_strategy", &self.default_strategy)
            .finish()
    }
}

impl SdLoadBalance {
    /// Wraps a discovery feed; fair selection is the default strategy.
    #[must_use]
    pub fn new(discovery: Arc<dyn ServiceDiscovery>) -> Arc<Self> {
        Arc::new(Self {
            discovery,
            balances: RwLock::new(HashMap::new()),
            strategies: RwLock::new(HashMap::new()),
            default_strategy: Strategy::Fair,
            factory: RwLock::new(None),
        })
    }

    /// Installs the holder factory. Must run before [`SdLoadBalance::start`].
    pub fn set_factory(&self, factory: HolderFactory) {
        *self.factory.write() = Some(factory);
    }

    /// Pins a strategy for one `(domain, service)`.
    pub fn set_strategy(&self, domain: &str, service: &str, strategy: Strategy) {
        self.strategies
            .write()
            .insert((domain.to_string(), service.to_string()), strategy);
    }

    /// Subscribes to the feed and starts it.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.discovery
            .set_callback(Arc::new(move |domain, service, old, new| {
                if let Some(this) = weak.upgrade() {
                    this.on_change(domain, service, old, new);
                }
            }));
        self.discovery.start();
        info!("sd load balance started");
    }

    /// Stops the feed.
    pub fn stop(&self) {
        self.discovery.stop();
    }

    /// The balancer for `(domain, service)`, if the feed produced one.
    #[must_use]
    pub fn get(&self, domain: &str, service: &str) -> Option<Arc<LoadBalance>> {
        self.balances
            .read()
            .get(&(domain.to_string(), service.to_string()))
            .cloned()
    }

    fn strategy_for(&self, domain: &str, service: &str) -> Strategy {
        self.strategies
            .read()
            .get(&(domain.to_string(), service.to_string()))
            .copied()
            .unwrap_or(self.default_strategy)
    }

    fn on_change(&self, domain: &str, service: &str, old: &InstanceMap, new: &InstanceMap) {
        let balance = {
            let mut balances = self.balances.write();
            Arc::clone(
                balances
                    .entry((domain.to_string(), service.to_string()))
                    .or_insert_with(|| LoadBalance::new(self.strategy_for(domain, service))),
            )
        };

        let dels: Vec<u64> = old.keys().filter(|id| !new.contains_key(id)).copied().collect();
        let factory = self.factory.read().clone();
        let mut adds = Vec::new();
        for (id, instance) in new {
            if old.contains_key(id) {
                continue;
            }
            let Some(factory) = &factory else {
                warn!(domain, service, "no holder factory installed; skipping adds");
                break;
            };
            match factory(instance) {
                Some(holder) => {
                    let weight = instance.data.parse().unwrap_or(DEFAULT_WEIGHT);
                    adds.push(LoadBalanceItem::new(*id, holder, weight));
                }
                None => {
                    debug!(domain, service, addr = %instance.addr(), "holder factory declined instance");
                }
            }
        }

        let removed = balance.update(adds, &dels);
        for item in removed {
            item.holder().close();
        }
        debug!(
            domain,
            service,
            items = balance.len(),
            "balancer updated from discovery"
        );
    }
}
