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

//! The perpetual storage wiggle: cycles storage servers out for rebuild
//! in creation-time order, one per step, and persists round statistics.

use std::{cmp::Ordering, collections::BinaryHeap, collections::HashMap};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::{
    meta::MetaStore,
    ratekeeper::Smoother,
    types::ServerId,
    Error, Result, WiggleConfig,
};

pub const WIGGLE_STATS_PREFIX: &str = "perpetual_storage_wiggle_stats/";

const WIGGLE_STATS_VERSION: u32 = 1;

/// What the wiggler orders servers by.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StorageMetadata {
    /// Epoch seconds when the process's current storage was created.
    pub created_time: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WiggleState {
    Invalid,
    Run,
    Pause,
}

impl WiggleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WiggleState::Run => "running",
            WiggleState::Pause => "paused",
            WiggleState::Invalid => "unknown",
        }
    }
}

/// Round and step statistics, persisted across distributor
/// incarnations.
///
/// One round is complete when every storage server that existed at
/// round start has been wiggled; one step is one server.
pub struct StorageWiggleMetrics {
    pub last_round_start: f64,
    pub last_round_finish: f64,
    pub smoothed_round_duration: Smoother,
    pub finished_round: u32,

    pub last_wiggle_start: f64,
    pub last_wiggle_finish: f64,
    pub smoothed_wiggle_duration: Smoother,
    pub finished_wiggle: u32,
}

/// On-wire form: the smoothers travel as their totals and are rebuilt
/// with `reset` on restore.
#[derive(Serialize, Deserialize)]
struct WiggleStatsRecord {
    version: u32,
    last_wiggle_start: f64,
    last_wiggle_finish: f64,
    wiggle_smoothed_total: f64,
    finished_wiggle: u32,
    last_round_start: f64,
    last_round_finish: f64,
    round_smoothed_total: f64,
    finished_round: u32,
}

impl StorageWiggleMetrics {
    pub fn new(cfg: &WiggleConfig) -> Self {
        StorageWiggleMetrics {
            last_round_start: 0.0,
            last_round_finish: 0.0,
            smoothed_round_duration: Smoother::new(cfg.round_smoothing_secs),
            finished_round: 0,
            last_wiggle_start: 0.0,
            last_wiggle_finish: 0.0,
            smoothed_wiggle_duration: Smoother::new(cfg.step_smoothing_secs),
            finished_wiggle: 0,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let record = WiggleStatsRecord {
            version: WIGGLE_STATS_VERSION,
            last_wiggle_start: self.last_wiggle_start,
            last_wiggle_finish: self.last_wiggle_finish,
            wiggle_smoothed_total: self.smoothed_wiggle_duration.total(),
            finished_wiggle: self.finished_wiggle,
            last_round_start: self.last_round_start,
            last_round_finish: self.last_round_finish,
            round_smoothed_total: self.smoothed_round_duration.total(),
            finished_round: self.finished_round,
        };
        Ok(Bytes::from(postcard::to_allocvec(&record)?))
    }

    pub fn decode(cfg: &WiggleConfig, bytes: &[u8]) -> Result<Self> {
        let record: WiggleStatsRecord = postcard::from_bytes(bytes)?;
        if record.version != WIGGLE_STATS_VERSION {
            return Err(Error::InvalidData(format!(
                "wiggle stats version {}",
                record.version
            )));
        }
        let mut metrics = StorageWiggleMetrics::new(cfg);
        metrics.last_wiggle_start = record.last_wiggle_start;
        metrics.last_wiggle_finish = record.last_wiggle_finish;
        metrics.smoothed_wiggle_duration.reset(record.wiggle_smoothed_total);
        metrics.finished_wiggle = record.finished_wiggle;
        metrics.last_round_start = record.last_round_start;
        metrics.last_round_finish = record.last_round_finish;
        metrics.smoothed_round_duration.reset(record.round_smoothed_total);
        metrics.finished_round = record.finished_round;
        Ok(metrics)
    }

    /// Operator-facing view.
    pub fn to_status(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("last_round_start_timestamp", self.last_round_start),
            ("last_round_finish_timestamp", self.last_round_finish),
            (
                "smoothed_round_seconds",
                self.smoothed_round_duration.total(),
            ),
            ("finished_round", self.finished_round as f64),
            ("last_wiggle_start_timestamp", self.last_wiggle_start),
            ("last_wiggle_finish_timestamp", self.last_wiggle_finish),
            (
                "smoothed_wiggle_seconds",
                self.smoothed_wiggle_duration.total(),
            ),
            ("finished_wiggle", self.finished_wiggle as f64),
        ]
    }
}

/// Min-heap entry: oldest storage first, server id as tiebreak.
struct HeapEntry {
    created_time: f64,
    server: ServerId,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: BinaryHeap is a max-heap, we want the oldest on top
        other
            .created_time
            .total_cmp(&self.created_time)
            .then_with(|| other.server.cmp(&self.server))
    }
}

pub struct StorageWiggler {
    primary: bool,
    cfg: WiggleConfig,
    /// Lazy-deletion heap; `metadata` is authoritative and stale heap
    /// entries are skipped on pop.
    heap: BinaryHeap<HeapEntry>,
    metadata: HashMap<ServerId, StorageMetadata>,
    pub metrics: StorageWiggleMetrics,
    state: WiggleState,
    last_state_change_ts: f64,
    non_empty_tx: watch::Sender<bool>,
    pub non_empty: watch::Receiver<bool>,
}

impl StorageWiggler {
    pub fn new(primary: bool, cfg: WiggleConfig) -> Self {
        let (non_empty_tx, non_empty) = watch::channel(false);
        let metrics = StorageWiggleMetrics::new(&cfg);
        StorageWiggler {
            primary,
            cfg,
            heap: BinaryHeap::new(),
            metadata: HashMap::new(),
            metrics,
            state: WiggleState::Invalid,
            last_state_change_ts: 0.0,
            non_empty_tx,
            non_empty,
        }
    }

    fn stats_key(&self) -> Vec<u8> {
        let suffix = if self.primary { "primary" } else { "remote" };
        format!("{WIGGLE_STATS_PREFIX}{suffix}").into_bytes()
    }

    pub fn state(&self) -> WiggleState {
        self.state
    }

    pub fn last_state_change_ts(&self) -> f64 {
        self.last_state_change_ts
    }

    pub fn set_state(&mut self, state: WiggleState, now: f64) {
        if self.state != state {
            info!(
                from = self.state.as_str(),
                to = state.as_str(),
                primary = self.primary,
                "wiggle state changed"
            );
            self.state = state;
            self.last_state_change_ts = now;
        }
    }

    pub fn add_server(&mut self, server: ServerId, metadata: StorageMetadata) {
        debug!(%server, created = metadata.created_time, "wiggle queue add");
        self.metadata.insert(server, metadata);
        self.heap.push(HeapEntry {
            created_time: metadata.created_time,
            server,
        });
        let _ = self.non_empty_tx.send(true);
    }

    pub fn remove_server(&mut self, server: &ServerId) {
        self.metadata.remove(server);
        if self.metadata.is_empty() {
            self.heap.clear();
            let _ = self.non_empty_tx.send(false);
        }
    }

    pub fn update_metadata(&mut self, server: ServerId, metadata: StorageMetadata) {
        if !self.metadata.contains_key(&server) {
            return;
        }
        self.metadata.insert(server, metadata);
        self.heap.push(HeapEntry {
            created_time: metadata.created_time,
            server,
        });
    }

    pub fn contains(&self, server: &ServerId) -> bool {
        self.metadata.contains_key(server)
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    fn peek(&mut self) -> Option<(f64, ServerId)> {
        while let Some(top) = self.heap.peek() {
            match self.metadata.get(&top.server) {
                Some(meta) if meta.created_time == top.created_time => {
                    return Some((top.created_time, top.server));
                }
                // stale heap entry, superseded or removed
                _ => {
                    self.heap.pop();
                }
            }
        }
        None
    }

    /// Takes the server with the oldest storage off the queue. The
    /// caller relocates its shards, waits for the rebuild and re-adds
    /// it with fresh metadata.
    pub fn get_next_server_id(&mut self) -> Option<ServerId> {
        let (_, server) = self.peek()?;
        self.heap.pop();
        self.metadata.remove(&server);
        if self.metadata.is_empty() {
            let _ = self.non_empty_tx.send(false);
        }
        Some(server)
    }

    pub fn should_start_new_round(&self) -> bool {
        self.metrics.last_round_finish >= self.metrics.last_round_start
    }

    /// A round is ready to finish when every server present at round
    /// start has been wiggled: the queue is empty, or its oldest entry
    /// post-dates the round start.
    pub fn should_finish_round(&mut self) -> bool {
        match self.peek() {
            None => true,
            Some((created_time, _)) => created_time >= self.metrics.last_round_start,
        }
    }

    pub async fn start_wiggle(&mut self, store: &dyn MetaStore, now: f64) -> Result<()> {
        self.metrics.last_wiggle_start = now;
        if self.should_start_new_round() {
            self.metrics.last_round_start = now;
        }
        self.persist(store).await
    }

    pub async fn finish_wiggle(&mut self, store: &dyn MetaStore, now: f64) -> Result<()> {
        self.metrics.last_wiggle_finish = now;
        self.metrics.finished_wiggle += 1;
        let elapsed = (now - self.metrics.last_wiggle_start).max(0.0);
        self.metrics.smoothed_wiggle_duration.set_total(elapsed, now);

        if self.should_finish_round() {
            self.metrics.last_round_finish = now;
            self.metrics.finished_round += 1;
            let round = (now - self.metrics.last_round_start).max(0.0);
            self.metrics.smoothed_round_duration.set_total(round, now);
            info!(primary = self.primary, seconds = round, "wiggle round finished");
            crate::metrics::WIGGLE_ROUNDS_FINISHED_TOTAL.inc();
        }
        self.persist(store).await
    }

    /// Reads persisted statistics back, keeping defaults when nothing
    /// was stored yet.
    pub async fn restore_stats(&mut self, store: &dyn MetaStore) -> Result<()> {
        if let Some(bytes) = store.get(&self.stats_key()).await? {
            self.metrics = StorageWiggleMetrics::decode(&self.cfg, &bytes)?;
        }
        Ok(())
    }

    /// Clears statistics, e.g. when the perpetual wiggle is switched
    /// off by the operator.
    pub async fn reset_stats(&mut self, store: &dyn MetaStore) -> Result<()> {
        self.metrics = StorageWiggleMetrics::new(&self.cfg);
        self.persist(store).await
    }

    async fn persist(&self, store: &dyn MetaStore) -> Result<()> {
        store.set(&self.stats_key(), self.metrics.encode()?).await
    }
}
