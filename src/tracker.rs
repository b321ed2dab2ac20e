// Copyright 2024 The Shardplane Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Live per-shard metric estimates, split/merge detection, and the
//! metrics request surface.
//!
//! Every tracked shard runs two cooperative tasks: `track_bytes`
//! subscribes to the storage metrics collaborator and publishes
//! [`ShardMetrics`] to a watch variable; `track_shard` watches that
//! variable for threshold crossings and emits split or merge work.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    keyspace::{Key, KeyRange, RangeMap},
    monitor::{DdEvent, RuntimeMonitor},
    physical::PhysicalShardCollection,
    registry::ShardTeamRegistry,
    types::{RelocateReason, RelocateShard, ShardMetrics, StorageMetrics},
    DistributorConfig, Error, Result,
};

/// Storage-server side of shard tracking.
#[async_trait]
pub trait ShardMetricsProvider: Send + Sync {
    /// Resolves once the range's metrics fall outside `[min, max]`,
    /// returning the fresh reading.
    async fn wait_metrics(
        &self,
        range: &KeyRange,
        min: &StorageMetrics,
        max: &StorageMetrics,
    ) -> Result<StorageMetrics>;

    /// Keys that cut `range` into pieces of roughly `chunk_bytes`.
    async fn split_points(&self, range: &KeyRange, chunk_bytes: i64) -> Result<Vec<Key>>;
}

/// Permitted size and bandwidth band for one shard; the tracker asks
/// for a new reading whenever the observed metrics leave it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardSizeBounds {
    pub max: StorageMetrics,
    pub min: StorageMetrics,
    pub permitted_error: StorageMetrics,
}

/// The band around the current estimate within which changes are not
/// interesting.
pub fn shard_size_bounds(
    current: &ShardMetrics,
    cfg: &crate::ShardTrackerConfig,
) -> ShardSizeBounds {
    let bytes = current.metrics.bytes;
    ShardSizeBounds {
        max: StorageMetrics {
            bytes: bytes + bytes / 4 + 1,
            bytes_written_per_ksec: cfg.max_shard_bytes_per_ksec,
            bytes_read_per_ksec: StorageMetrics::INFINITY,
        },
        min: StorageMetrics {
            bytes: (bytes - bytes / 4).max(0),
            bytes_written_per_ksec: 0,
            bytes_read_per_ksec: 0,
        },
        permitted_error: StorageMetrics::with_bytes(bytes / 8),
    }
}

/// Maximum shard size as a function of the database size estimate.
pub fn max_shard_size(db_size_estimate: f64, cfg: &crate::ShardTrackerConfig) -> i64 {
    let scaled =
        cfg.min_shard_bytes + (db_size_estimate.max(0.0).sqrt() as i64) * cfg.shard_bytes_per_sqrt_bytes;
    scaled.min(cfg.max_shard_bytes)
}

pub struct GetMetricsRequest {
    pub range: KeyRange,
    pub reply: oneshot::Sender<StorageMetrics>,
}

pub struct GetTopKMetricsReply {
    pub metrics: Vec<(KeyRange, StorageMetrics)>,
    pub min_read_load: f64,
    pub max_read_load: f64,
}

/// Returns true when `a` outranks `b`.
pub type MetricsComparator = fn(&StorageMetrics, &StorageMetrics) -> bool;

fn by_read_bandwidth(a: &StorageMetrics, b: &StorageMetrics) -> bool {
    a.bytes_read_per_ksec > b.bytes_read_per_ksec
}

pub struct GetTopKMetricsRequest {
    pub ranges: Vec<KeyRange>,
    pub top_k: usize,
    pub comparator: MetricsComparator,
    pub max_bytes_read_per_ksec: i64,
    pub min_bytes_read_per_ksec: i64,
    pub reply: oneshot::Sender<GetTopKMetricsReply>,
}

impl GetTopKMetricsRequest {
    pub fn new(ranges: Vec<KeyRange>, top_k: usize, reply: oneshot::Sender<GetTopKMetricsReply>) -> Self {
        GetTopKMetricsRequest {
            ranges,
            top_k,
            comparator: by_read_bandwidth,
            max_bytes_read_per_ksec: StorageMetrics::INFINITY,
            min_bytes_read_per_ksec: 0,
            reply,
        }
    }
}

/// One row of the operator-facing shard enumeration.
#[derive(Clone, Debug)]
pub struct DdMetrics {
    pub range: KeyRange,
    pub shard_bytes: i64,
}

pub struct GetMetricsListRequest {
    pub range: KeyRange,
    pub shard_limit: usize,
    pub reply: oneshot::Sender<Vec<DdMetrics>>,
}

struct ShardTasks {
    track_bytes: JoinHandle<()>,
    track_shard: JoinHandle<()>,
}

impl Drop for ShardTasks {
    fn drop(&mut self) {
        self.track_bytes.abort();
        self.track_shard.abort();
    }
}

/// What the tracker keeps per shard. Cloning shares the watchers, so a
/// map split leaves both halves on the old tasks until they are
/// replaced.
#[derive(Clone)]
pub struct ShardTrackedData {
    pub stats: watch::Receiver<Option<ShardMetrics>>,
    tasks: Arc<ShardTasks>,
}

pub(crate) struct TrackerContext {
    pub cfg: DistributorConfig,
    pub provider: Arc<dyn ShardMetricsProvider>,
    pub registry: Arc<Mutex<ShardTeamRegistry>>,
    pub physical: Arc<Mutex<PhysicalShardCollection>>,
    pub monitor: Arc<RuntimeMonitor>,
    pub relocate_tx: mpsc::UnboundedSender<RelocateShard>,
    pub shards: Mutex<RangeMap<Option<ShardTrackedData>>>,
    reported_oversized: Mutex<HashSet<u64>>,
    start: Instant,
}

impl TrackerContext {
    fn now_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

pub struct DataDistributionTracker {
    ctx: Arc<TrackerContext>,
}

impl DataDistributionTracker {
    pub fn new(
        cfg: DistributorConfig,
        provider: Arc<dyn ShardMetricsProvider>,
        registry: Arc<Mutex<ShardTeamRegistry>>,
        physical: Arc<Mutex<PhysicalShardCollection>>,
        monitor: Arc<RuntimeMonitor>,
        relocate_tx: mpsc::UnboundedSender<RelocateShard>,
    ) -> Self {
        DataDistributionTracker {
            ctx: Arc::new(TrackerContext {
                cfg,
                provider,
                registry,
                physical,
                monitor,
                relocate_tx,
                shards: Mutex::new(RangeMap::new(None)),
                reported_oversized: Mutex::new(HashSet::new()),
                start: Instant::now(),
            }),
        }
    }

    /// Attaches watchers for `range` as one shard.
    pub fn track_shard(&self, range: KeyRange) {
        install_tracker(&self.ctx, range, None);
    }

    /// Serves requests and re-attaches watchers after boundary changes
    /// until all request senders close.
    pub async fn run(
        self,
        mut restart_rx: mpsc::UnboundedReceiver<KeyRange>,
        mut get_metrics_rx: mpsc::UnboundedReceiver<GetMetricsRequest>,
        mut get_top_k_rx: mpsc::UnboundedReceiver<GetTopKMetricsRequest>,
        mut get_metrics_list_rx: mpsc::UnboundedReceiver<GetMetricsListRequest>,
        mut get_average_shard_bytes_rx: mpsc::UnboundedReceiver<oneshot::Sender<i64>>,
    ) {
        loop {
            tokio::select! {
                msg = restart_rx.recv() => {
                    let Some(range) = msg else { break };
                    self.restart_shard_trackers(range);
                }
                msg = get_metrics_rx.recv() => {
                    let Some(req) = msg else { break };
                    let _ = req.reply.send(self.aggregated_metrics(&req.range));
                }
                msg = get_top_k_rx.recv() => {
                    let Some(req) = msg else { break };
                    self.handle_top_k(req);
                }
                msg = get_metrics_list_rx.recv() => {
                    let Some(req) = msg else { break };
                    let _ = req.reply.send(self.metrics_list(&req.range, req.shard_limit));
                }
                msg = get_average_shard_bytes_rx.recv() => {
                    let Some(reply) = msg else { break };
                    let total: i64 = self.aggregated_metrics(&KeyRange::all()).bytes;
                    let _ = reply.send(max_shard_size(total as f64, &self.ctx.cfg.tracker) / 2);
                }
            }
        }
    }

    fn restart_shard_trackers(&self, range: KeyRange) {
        let pieces = self.ctx.registry.lock().unwrap().entry_ranges(&range);
        debug!(%range, pieces = pieces.len(), "restarting shard trackers");
        for piece in pieces {
            install_tracker(&self.ctx, piece, None);
        }
    }

    fn aggregated_metrics(&self, range: &KeyRange) -> StorageMetrics {
        let shards = self.ctx.shards.lock().unwrap();
        let mut total = StorageMetrics::default();
        for (_, data) in shards.intersecting(range) {
            if let Some(data) = data {
                if let Some(sm) = data.stats.borrow().as_ref() {
                    total = total.saturating_add(&sm.metrics);
                }
            }
        }
        total
    }

    fn handle_top_k(&self, req: GetTopKMetricsRequest) {
        let mut considered: Vec<(KeyRange, StorageMetrics)> = Vec::new();
        let mut min_read = f64::MAX;
        let mut max_read = f64::MIN;
        for range in &req.ranges {
            let metrics = self.aggregated_metrics(range);
            min_read = min_read.min(metrics.bytes_read_per_ksec as f64);
            max_read = max_read.max(metrics.bytes_read_per_ksec as f64);
            if metrics.bytes_read_per_ksec > req.max_bytes_read_per_ksec
                || metrics.bytes_read_per_ksec < req.min_bytes_read_per_ksec
            {
                continue;
            }
            considered.push((range.clone(), metrics));
        }
        considered.sort_by(|(_, a), (_, b)| {
            if (req.comparator)(a, b) {
                std::cmp::Ordering::Less
            } else if (req.comparator)(b, a) {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Equal
            }
        });
        considered.truncate(req.top_k.max(1));
        let _ = req.reply.send(GetTopKMetricsReply {
            metrics: considered,
            min_read_load: if min_read == f64::MAX { -1.0 } else { min_read },
            max_read_load: if max_read == f64::MIN { -1.0 } else { max_read },
        });
    }

    fn metrics_list(&self, range: &KeyRange, shard_limit: usize) -> Vec<DdMetrics> {
        let shards = self.ctx.shards.lock().unwrap();
        shards
            .intersecting(range)
            .into_iter()
            .filter_map(|(r, data)| {
                let data = data.as_ref()?;
                let bytes = data.stats.borrow().as_ref()?.metrics.bytes;
                Some(DdMetrics {
                    range: r,
                    shard_bytes: bytes,
                })
            })
            .take(shard_limit)
            .collect()
    }
}

fn install_tracker(ctx: &Arc<TrackerContext>, range: KeyRange, initial: Option<ShardMetrics>) {
    let (stats_tx, stats_rx) = watch::channel(initial);
    let bytes_task = tokio::spawn(track_bytes(ctx.clone(), range.clone(), stats_tx));
    let shard_task = tokio::spawn(track_shard(ctx.clone(), range.clone(), stats_rx.clone()));
    let data = ShardTrackedData {
        stats: stats_rx,
        tasks: Arc::new(ShardTasks {
            track_bytes: bytes_task,
            track_shard: shard_task,
        }),
    };
    ctx.shards.lock().unwrap().insert(&range, Some(data));
}

fn is_low_bandwidth(metrics: &StorageMetrics, cfg: &crate::ShardTrackerConfig) -> bool {
    metrics.bytes_written_per_ksec < cfg.min_shard_bytes_per_ksec
}

/// Folds fresh readings from the metrics collaborator into the shard's
/// watch variable and the physical shard collection.
async fn track_bytes(
    ctx: Arc<TrackerContext>,
    range: KeyRange,
    stats_tx: watch::Sender<Option<ShardMetrics>>,
) {
    let mut current: Option<ShardMetrics> = None;
    loop {
        let (min, max) = match &current {
            // any reading at all is news on a fresh shard
            None => (StorageMetrics::default(), StorageMetrics::default()),
            Some(sm) => {
                let bounds = shard_size_bounds(sm, &ctx.cfg.tracker);
                (bounds.min, bounds.max)
            }
        };
        match ctx.provider.wait_metrics(&range, &min, &max).await {
            Ok(metrics) => {
                let now = ctx.now_secs();
                let low = is_low_bandwidth(&metrics, &ctx.cfg.tracker);
                let last_low_start = match &current {
                    Some(prev)
                        if low && is_low_bandwidth(&prev.metrics, &ctx.cfg.tracker) =>
                    {
                        prev.last_low_bandwidth_start_time
                    }
                    _ => now,
                };
                let sm = ShardMetrics {
                    metrics,
                    last_low_bandwidth_start_time: last_low_start,
                    shard_count: current.as_ref().map(|c| c.shard_count).unwrap_or(1),
                };

                let old = current
                    .as_ref()
                    .map(|c| c.metrics)
                    .unwrap_or_default();
                let touched = ctx
                    .physical
                    .lock()
                    .unwrap()
                    .update_physical_shard_metrics_by_key_range(
                        &range,
                        &sm.metrics,
                        &old,
                        current.is_none(),
                    );
                apply_physical_size_policy(&ctx, &touched);

                current = Some(sm.clone());
                if stats_tx.send(Some(sm)).is_err() {
                    return;
                }
            }
            Err(Error::Canceled) => return,
            Err(e) => {
                warn!(%range, error = %e, "shard metrics fetch failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Split/merge events for physical shards that crossed a size
/// threshold. Splits fire immediately; merges are buffered until the
/// next flush, where partner selection is still an open decision.
fn apply_physical_size_policy(ctx: &Arc<TrackerContext>, touched: &[u64]) {
    let priorities = &ctx.cfg.priorities;
    for id in touched {
        let (oversized, undersized) = {
            let physical = ctx.physical.lock().unwrap();
            (physical.is_oversized(*id), physical.is_undersized_and_cold(*id))
        };
        let mut reported = ctx.reported_oversized.lock().unwrap();
        if oversized {
            if reported.insert(*id) {
                ctx.monitor.trigger_dd_event(
                    DdEvent::for_physical_shard(priorities.split_physical_shard, *id),
                    true,
                );
            }
        } else {
            reported.remove(id);
            if undersized {
                ctx.monitor.trigger_dd_event(
                    DdEvent::for_physical_shard(priorities.merge_physical_shard, *id),
                    false,
                );
            }
        }
    }
}

/// Watches one shard's metrics for boundary crossings.
async fn track_shard(
    ctx: Arc<TrackerContext>,
    range: KeyRange,
    mut stats_rx: watch::Receiver<Option<ShardMetrics>>,
) {
    loop {
        let sm = loop {
            if let Some(sm) = stats_rx.borrow_and_update().clone() {
                break sm;
            }
            if stats_rx.changed().await.is_err() {
                return;
            }
        };
        let tracker_cfg = &ctx.cfg.tracker;
        if sm.metrics.bytes > tracker_cfg.max_shard_bytes {
            if let Err(e) = split_shard(&ctx, &range, &sm).await {
                warn!(%range, error = %e, "shard split failed");
            }
            if stats_rx.changed().await.is_err() {
                return;
            }
        } else if sm.metrics.bytes < tracker_cfg.min_shard_bytes
            && is_low_bandwidth(&sm.metrics, tracker_cfg)
            && ctx.now_secs() - sm.last_low_bandwidth_start_time
                >= tracker_cfg.low_bandwidth_dwell_secs
        {
            if try_merge(&ctx, &range, &sm) {
                // the merged watcher replaced this task
                return;
            }
            // neighbor not mergeable yet; recheck on change or shortly
            tokio::select! {
                changed = stats_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        } else if stats_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Rewrites the interval map through the registry before any relocation
/// is enqueued, so a failure response cannot revert the split.
async fn split_shard(ctx: &Arc<TrackerContext>, range: &KeyRange, sm: &ShardMetrics) -> Result<()> {
    let chunk = (sm.metrics.bytes / 2).max(1);
    let points = ctx.provider.split_points(range, chunk).await?;
    let points: Vec<Key> = points
        .into_iter()
        .filter(|p| range.begin < *p && *p < range.end)
        .collect();
    if points.is_empty() {
        return Ok(());
    }

    let mut begins = Vec::with_capacity(points.len() + 2);
    begins.push(range.begin.clone());
    begins.extend(points);
    begins.push(range.end.clone());
    let pieces: Vec<KeyRange> = begins
        .windows(2)
        .map(|w| KeyRange::new(w[0].clone(), w[1].clone()))
        .collect();

    info!(%range, pieces = pieces.len(), bytes = sm.metrics.bytes, "splitting shard");
    {
        let mut registry = ctx.registry.lock().unwrap();
        for piece in &pieces {
            registry.define_shard(piece);
        }
    }
    for piece in pieces.iter().skip(1) {
        let _ = ctx.relocate_tx.send(RelocateShard::new(
            piece.clone(),
            ctx.cfg.priorities.split_shard,
            RelocateReason::Other,
        ));
    }
    crate::metrics::SHARD_SPLITS_TOTAL.inc();
    Ok(())
}

/// Merges this shard with its right neighbor when both are small and
/// cold. The combined watcher is installed immediately; the registry
/// boundary disappears when the merge relocation finishes.
fn try_merge(ctx: &Arc<TrackerContext>, range: &KeyRange, sm: &ShardMetrics) -> bool {
    let tracker_cfg = &ctx.cfg.tracker;
    let merged = {
        let shards = ctx.shards.lock().unwrap();
        if range.end >= crate::keyspace::max_key() {
            return false;
        }
        let (next_range, next_data) = shards.range_containing(&range.end);
        let Some(next_data) = next_data else {
            return false;
        };
        let Some(next_sm) = next_data.stats.borrow().clone() else {
            return false;
        };
        if !is_low_bandwidth(&next_sm.metrics, tracker_cfg) {
            return false;
        }
        let combined_bytes = sm.metrics.bytes.saturating_add(next_sm.metrics.bytes);
        if combined_bytes > tracker_cfg.max_shard_bytes {
            return false;
        }
        let merged_range = KeyRange::new(range.begin.clone(), next_range.end.clone());
        let combined = ShardMetrics {
            metrics: sm.metrics.saturating_add(&next_sm.metrics),
            last_low_bandwidth_start_time: sm
                .last_low_bandwidth_start_time
                .max(next_sm.last_low_bandwidth_start_time),
            shard_count: sm.shard_count + next_sm.shard_count,
        };
        (merged_range, combined)
    };

    info!(range = %merged.0, bytes = merged.1.metrics.bytes, "proposing shard merge");
    let _ = ctx.relocate_tx.send(RelocateShard::new(
        merged.0.clone(),
        ctx.cfg.priorities.merge_shard,
        RelocateReason::Other,
    ));
    crate::metrics::SHARD_MERGES_TOTAL.inc();
    // replaces both watchers, including the calling task
    install_tracker(ctx, merged.0, Some(merged.1));
    true
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::{monitor::RuntimeMonitor, Priorities};

    fn key(s: &str) -> Key {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn range(b: &str, e: &str) -> KeyRange {
        KeyRange::new(key(b), key(e))
    }

    #[test]
    fn max_shard_size_scales_with_sqrt() {
        let cfg = crate::ShardTrackerConfig::default();
        let small = max_shard_size(0.0, &cfg);
        assert_eq!(small, cfg.min_shard_bytes);
        let large = max_shard_size(1e18, &cfg);
        assert_eq!(large, cfg.max_shard_bytes);
        let mid = max_shard_size(1e12, &cfg);
        assert!(mid > small && mid < large);
    }

    #[test]
    fn size_bounds_bracket_the_estimate() {
        let cfg = crate::ShardTrackerConfig::default();
        let sm = ShardMetrics {
            metrics: StorageMetrics::with_bytes(100_000_000),
            last_low_bandwidth_start_time: 0.0,
            shard_count: 1,
        };
        let bounds = shard_size_bounds(&sm, &cfg);
        assert!(bounds.min.bytes < sm.metrics.bytes);
        assert!(bounds.max.bytes > sm.metrics.bytes);
        assert!(bounds.permitted_error.bytes > 0);
    }

    /// Provider that serves a scripted sequence of readings and fixed
    /// split points.
    struct ScriptedProvider {
        readings: Mutex<Vec<StorageMetrics>>,
        splits: Vec<Key>,
    }

    #[async_trait]
    impl ShardMetricsProvider for ScriptedProvider {
        async fn wait_metrics(
            &self,
            _range: &KeyRange,
            _min: &StorageMetrics,
            _max: &StorageMetrics,
        ) -> Result<StorageMetrics> {
            let next = self.readings.lock().unwrap().pop();
            match next {
                Some(m) => Ok(m),
                None => {
                    // no further scripted change; park forever
                    futures::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }

        async fn split_points(&self, _range: &KeyRange, _chunk: i64) -> Result<Vec<Key>> {
            Ok(self.splits.clone())
        }
    }

    fn tracker_with(
        provider: ScriptedProvider,
        cfg: DistributorConfig,
    ) -> (
        DataDistributionTracker,
        mpsc::UnboundedReceiver<RelocateShard>,
        Arc<Mutex<ShardTeamRegistry>>,
    ) {
        let (registry, _restart_rx) = ShardTeamRegistry::new();
        let registry = Arc::new(Mutex::new(registry));
        let physical = Arc::new(Mutex::new(PhysicalShardCollection::new(
            cfg.physical_shard.clone(),
        )));
        let (relocate_tx, relocate_rx) = mpsc::unbounded_channel();
        let (metrics_tx, _metrics_rx) = mpsc::unbounded_channel();
        let monitor = Arc::new(RuntimeMonitor::new(
            Priorities::default(),
            relocate_tx.clone(),
            Vec::new(),
            physical.clone(),
            metrics_tx,
        ));
        let tracker = DataDistributionTracker::new(
            cfg,
            Arc::new(provider),
            registry.clone(),
            physical,
            monitor,
            relocate_tx,
        );
        (tracker, relocate_rx, registry)
    }

    #[tokio::test]
    async fn oversized_shard_splits_and_relocates_tail_pieces() {
        let mut cfg = DistributorConfig::default();
        cfg.tracker.max_shard_bytes = 1000;
        let provider = ScriptedProvider {
            readings: Mutex::new(vec![StorageMetrics::with_bytes(5000)]),
            splits: vec![key("g"), key("p")],
        };
        let (tracker, mut relocate_rx, registry) = tracker_with(provider, cfg.clone());

        tracker.track_shard(range("b", "z"));

        let first = tokio::time::timeout(Duration::from_secs(5), relocate_rx.recv())
            .await
            .expect("split relocation")
            .unwrap();
        assert_eq!(first.range, range("g", "p"));
        assert_eq!(first.priority, cfg.priorities.split_shard);
        let second = relocate_rx.recv().await.unwrap();
        assert_eq!(second.range, range("p", "z"));

        // the registry map was cut before the relocations were queued
        let entries = registry.lock().unwrap().entry_ranges(&range("b", "z"));
        assert_eq!(entries, vec![range("b", "g"), range("g", "p"), range("p", "z")]);
    }

    #[tokio::test]
    async fn small_cold_neighbors_propose_a_merge() {
        let mut cfg = DistributorConfig::default();
        cfg.tracker.min_shard_bytes = 100;
        cfg.tracker.max_shard_bytes = 10_000;
        cfg.tracker.low_bandwidth_dwell_secs = 0.0;
        let provider = ScriptedProvider {
            readings: Mutex::new(vec![
                StorageMetrics::with_bytes(10),
                StorageMetrics::with_bytes(10),
            ]),
            splits: Vec::new(),
        };
        let (tracker, mut relocate_rx, _registry) = tracker_with(provider, cfg.clone());

        tracker.track_shard(range("b", "g"));
        tracker.track_shard(range("g", "m"));

        let merge = tokio::time::timeout(Duration::from_secs(5), relocate_rx.recv())
            .await
            .expect("merge relocation")
            .unwrap();
        assert_eq!(merge.range, range("b", "m"));
        assert_eq!(merge.priority, cfg.priorities.merge_shard);
    }
}
