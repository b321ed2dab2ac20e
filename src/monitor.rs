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

//! The DD event buffer and the runtime monitor that drains it into the
//! relocation stream, plus the physical-shard-aware team scorer.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    keyspace::KeyRange,
    physical::{PhysicalShard, PhysicalShardCollection},
    team::{
        GetStorageServerStatusRequest, GetTeamStatusRequest, StorageServerMetric,
        TeamCollectionInterface, TeamMetrics, TeamRef,
    },
    tracker::GetMetricsRequest,
    types::{DataMoveType, RelocateReason, RelocateShard, ServerId, StorageMetrics, Team},
    Error, Priorities, Result,
};

/// One size-policy or relocation event. `event_type` doubles as the
/// relocation priority of whatever work the event produces.
#[derive(Clone, Debug)]
pub struct DdEvent {
    pub event_type: i32,
    pub data_move_type: Option<DataMoveType>,
    pub range: Option<KeyRange>,
    pub physical_shard: Option<u64>,
    pub server: Option<ServerId>,
    pub team: Option<Team>,
    pub relocate: Option<RelocateShard>,
}

impl DdEvent {
    pub fn new(event_type: i32) -> Self {
        DdEvent {
            event_type,
            data_move_type: None,
            range: None,
            physical_shard: None,
            server: None,
            team: None,
            relocate: None,
        }
    }

    pub fn for_physical_shard(event_type: i32, id: u64) -> Self {
        DdEvent {
            physical_shard: Some(id),
            ..DdEvent::new(event_type)
        }
    }

    pub fn for_range(event_type: i32, range: KeyRange) -> Self {
        DdEvent {
            range: Some(range),
            ..DdEvent::new(event_type)
        }
    }

    pub fn for_relocation(relocate: RelocateShard) -> Self {
        DdEvent {
            event_type: relocate.priority,
            relocate: Some(relocate),
            ..DdEvent::new(0)
        }
    }
}

/// Single-producer buffer between the tracker's size watchers and the
/// relocation queue.
#[derive(Default)]
pub struct DdEventBuffer {
    buffer: Vec<DdEvent>,
}

impl DdEventBuffer {
    pub fn append(&mut self, event: DdEvent) {
        self.buffer.push(event);
    }

    pub fn take_all(&mut self) -> Vec<DdEvent> {
        std::mem::take(&mut self.buffer)
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// The best destination found by the physical-shard-aware scorer: the
/// chosen shard id plus one `(team, primary)` pair per region.
pub struct PhysicalShardAwareBestTeams {
    pub physical_shard_id: u64,
    pub best_teams: Vec<(TeamRef, bool)>,
}

/// Candidate statistics fed to the scorer: per candidate physical
/// shard, its current metrics and one team-with-metrics per region.
pub type PhysicalShardAwareTeamStats =
    BTreeMap<u64, (PhysicalShard, Vec<(TeamRef, bool, TeamMetrics)>)>;

/// Runtime metrics access and data-move issuance for the distribution
/// algorithms: takes events in through the buffer, puts relocations out
/// on the relocation stream.
pub struct RuntimeMonitor {
    priorities: Priorities,
    event_buffer: Mutex<DdEventBuffer>,
    relocate_tx: mpsc::UnboundedSender<RelocateShard>,
    team_collections: Vec<TeamCollectionInterface>,
    physical_shards: Arc<Mutex<PhysicalShardCollection>>,
    get_shard_metrics: mpsc::UnboundedSender<GetMetricsRequest>,
}

impl RuntimeMonitor {
    pub fn new(
        priorities: Priorities,
        relocate_tx: mpsc::UnboundedSender<RelocateShard>,
        team_collections: Vec<TeamCollectionInterface>,
        physical_shards: Arc<Mutex<PhysicalShardCollection>>,
        get_shard_metrics: mpsc::UnboundedSender<GetMetricsRequest>,
    ) -> Self {
        RuntimeMonitor {
            priorities,
            event_buffer: Mutex::new(DdEventBuffer::default()),
            relocate_tx,
            team_collections,
            physical_shards,
            get_shard_metrics,
        }
    }

    /// Appends `event`; with `immediate` set, drains the whole buffer
    /// into the relocation stream.
    pub fn trigger_dd_event(&self, event: DdEvent, immediate: bool) {
        let events = {
            let mut buffer = self.event_buffer.lock().unwrap();
            buffer.append(event);
            if !immediate {
                return;
            }
            buffer.take_all()
        };
        debug!(count = events.len(), "draining data distribution events");
        for event in events {
            self.dispatch(event);
        }
    }

    fn dispatch(&self, event: DdEvent) {
        if let Some(rs) = event.relocate {
            let _ = self.relocate_tx.send(rs);
            return;
        }
        if event.event_type == self.priorities.split_physical_shard {
            let Some(id) = event.physical_shard else {
                warn!("split event without a physical shard id");
                return;
            };
            self.split_physical_shard(id, event.event_type);
        } else if event.event_type == self.priorities.merge_physical_shard {
            // The merge partner for an undersized physical shard is not
            // chosen here yet; the event only records that the shard
            // crossed the threshold.
            debug!(id = ?event.physical_shard, "merge event dropped");
        } else {
            warn!(event_type = event.event_type, "unhandled event type");
        }
    }

    /// Relocates the first ceil(n/2) key ranges of the shard, halving
    /// it deterministically.
    fn split_physical_shard(&self, id: u64, priority: i32) {
        let ranges = self.physical_shards.lock().unwrap().ranges_of(id);
        let take = (ranges.len() + 1) / 2;
        debug!(id, moving = take, total = ranges.len(), "splitting physical shard");
        for range in ranges.into_iter().take(take) {
            let _ = self.relocate_tx.send(RelocateShard::new(
                range,
                priority,
                RelocateReason::RebalancePhysShard,
            ));
        }
    }

    pub fn issue_physical_shard_move(&self, id: u64, key_ranges: Option<Vec<KeyRange>>) {
        match key_ranges {
            Some(ranges) => {
                for range in ranges {
                    let mut event =
                        DdEvent::for_range(self.priorities.split_physical_shard, range.clone());
                    event.physical_shard = Some(id);
                    event.data_move_type = Some(DataMoveType::PhysicalShardMove);
                    event.relocate = Some(RelocateShard::new(
                        range,
                        self.priorities.split_physical_shard,
                        RelocateReason::RebalancePhysShard,
                    ));
                    self.trigger_dd_event(event, true);
                }
            }
            None => {
                let mut event =
                    DdEvent::for_physical_shard(self.priorities.split_physical_shard, id);
                event.data_move_type = Some(DataMoveType::PhysicalShardMove);
                self.trigger_dd_event(event, true);
            }
        }
    }

    pub fn issue_read_range_move(&self, range: KeyRange) {
        let mut event = DdEvent::for_relocation(RelocateShard::new(
            range,
            self.priorities.rebalance_read_overutil_team,
            RelocateReason::RebalanceRead,
        ));
        event.data_move_type = Some(DataMoveType::ReadRangeMove);
        self.trigger_dd_event(event, true);
    }

    pub async fn get_team_metrics(&self, team: &Team) -> Result<TeamMetrics> {
        let index = if team.primary { 0 } else { 1 };
        let interface = self
            .team_collections
            .get(index)
            .ok_or(Error::MetricsUnavailable("no team collection for region"))?;
        let (tx, rx) = oneshot::channel();
        interface
            .get_team_status
            .send(GetTeamStatusRequest {
                servers: team.servers().to_vec(),
                reply: tx,
            })
            .map_err(|_| Error::Canceled)?;
        rx.await.map_err(|_| Error::Canceled)
    }

    pub async fn get_storage_server_metrics(
        &self,
        server: ServerId,
    ) -> Result<Option<StorageServerMetric>> {
        let interface = self
            .team_collections
            .first()
            .ok_or(Error::MetricsUnavailable("no team collection"))?;
        let (tx, rx) = oneshot::channel();
        interface
            .get_storage_server_status
            .send(GetStorageServerStatusRequest {
                server,
                reply: tx,
            })
            .map_err(|_| Error::Canceled)?;
        rx.await.map_err(|_| Error::Canceled)
    }

    pub fn get_physical_shard_metrics(&self, id: u64) -> StorageMetrics {
        self.physical_shards.lock().unwrap().metrics_of(id)
    }

    pub async fn get_key_range_metrics(&self, range: KeyRange) -> Result<StorageMetrics> {
        let (tx, rx) = oneshot::channel();
        self.get_shard_metrics
            .send(GetMetricsRequest { range, reply: tx })
            .map_err(|_| Error::Canceled)?;
        rx.await.map_err(|_| Error::Canceled)
    }

    /// Scores candidate `(physical shard, teams)` tuples by normalized
    /// shard bytes and normalized worst version lag, and returns the
    /// best. `None` means the caller falls back to standard selection:
    /// degenerate inputs (all metrics equal, or every candidate missing
    /// a replica's lag) cannot be ranked.
    pub fn select_teams_and_physical_shard(
        &self,
        team_stats: &PhysicalShardAwareTeamStats,
        num_dc: usize,
        debug_id: Uuid,
    ) -> Option<PhysicalShardAwareBestTeams> {
        debug_assert!(!team_stats.is_empty());
        debug_assert!(num_dc == 1 || num_dc == 2);

        let mut max_bytes = 0i64;
        let mut min_bytes = StorageMetrics::INFINITY;
        let mut max_max_lag = 0i64;
        let mut min_max_lag = StorageMetrics::INFINITY;
        for (shard, teams) in team_stats.values() {
            debug_assert_eq!(teams.len(), num_dc);
            for (_, _, metrics) in teams {
                let lag = metrics.max_version_lag();
                if lag == -1 {
                    continue;
                }
                max_max_lag = max_max_lag.max(lag);
                min_max_lag = min_max_lag.min(lag);
            }
            max_bytes = max_bytes.max(shard.metrics.bytes);
            min_bytes = min_bytes.min(shard.metrics.bytes);
        }
        if max_bytes == 0
            || min_bytes == StorageMetrics::INFINITY
            || max_max_lag == 0
            || min_max_lag == StorageMetrics::INFINITY
        {
            return None;
        }

        let mut best_score = 0.0;
        let mut best_id = None;
        for (id, (shard, teams)) in team_stats {
            let mut score = (max_bytes - shard.metrics.bytes + 1) as f64
                / (max_bytes - min_bytes + 1) as f64;
            let mut max_lag = 0i64;
            let mut missing = false;
            for (_, _, metrics) in teams {
                let lag = metrics.max_version_lag();
                if lag == -1 {
                    missing = true;
                    break;
                }
                max_lag = max_lag.max(lag);
            }
            if missing {
                continue;
            }
            score += (max_max_lag - max_lag + 1) as f64 / (max_max_lag - min_max_lag + 1) as f64;
            if score > best_score {
                best_score = score;
                best_id = Some(*id);
            }
        }

        let best_id = best_id?;
        let (_, teams) = &team_stats[&best_id];
        debug!(
            %debug_id,
            physical_shard = best_id,
            score = best_score,
            "physical-shard-aware selection"
        );
        Some(PhysicalShardAwareBestTeams {
            physical_shard_id: best_id,
            best_teams: teams
                .iter()
                .map(|(team, primary, _)| (team.clone(), *primary))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{team::StorageTeam, PhysicalShardConfig};

    fn monitor_with_relocations() -> (RuntimeMonitor, mpsc::UnboundedReceiver<RelocateShard>) {
        let (relocate_tx, relocate_rx) = mpsc::unbounded_channel();
        let (metrics_tx, _metrics_rx) = mpsc::unbounded_channel();
        let physical = Arc::new(Mutex::new(PhysicalShardCollection::new(
            PhysicalShardConfig::default(),
        )));
        let monitor = RuntimeMonitor::new(
            Priorities::default(),
            relocate_tx,
            Vec::new(),
            physical,
            metrics_tx,
        );
        (monitor, relocate_rx)
    }

    fn range(b: &str, e: &str) -> KeyRange {
        KeyRange::new(
            bytes::Bytes::copy_from_slice(b.as_bytes()),
            bytes::Bytes::copy_from_slice(e.as_bytes()),
        )
    }

    #[test]
    fn deferred_events_drain_on_next_immediate_flush() {
        let (monitor, mut rx) = monitor_with_relocations();
        let priorities = Priorities::default();

        let first = DdEvent::for_relocation(RelocateShard::new(
            range("a", "b"),
            priorities.split_shard,
            RelocateReason::Other,
        ));
        monitor.trigger_dd_event(first, false);
        assert!(rx.try_recv().is_err());

        let second = DdEvent::for_relocation(RelocateShard::new(
            range("b", "c"),
            priorities.merge_shard,
            RelocateReason::Other,
        ));
        monitor.trigger_dd_event(second, true);
        assert_eq!(rx.try_recv().unwrap().range, range("a", "b"));
        assert_eq!(rx.try_recv().unwrap().range, range("b", "c"));
    }

    #[test]
    fn split_event_moves_first_half_of_ranges() {
        let (monitor, mut rx) = monitor_with_relocations();
        let priorities = Priorities::default();
        {
            let mut physical = monitor.physical_shards.lock().unwrap();
            physical.update_key_range_to_physical_shard(&range("a", "b"), 42);
            physical.update_key_range_to_physical_shard(&range("c", "d"), 42);
            physical.update_key_range_to_physical_shard(&range("e", "f"), 42);
        }

        monitor.trigger_dd_event(
            DdEvent::for_physical_shard(priorities.split_physical_shard, 42),
            true,
        );
        // ceil(3/2) = 2 ranges relocate
        assert_eq!(rx.try_recv().unwrap().range, range("a", "b"));
        assert_eq!(rx.try_recv().unwrap().range, range("c", "d"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn merge_events_are_consumed_without_relocations() {
        let (monitor, mut rx) = monitor_with_relocations();
        let priorities = Priorities::default();
        monitor.trigger_dd_event(
            DdEvent::for_physical_shard(priorities.merge_physical_shard, 7),
            true,
        );
        assert!(rx.try_recv().is_err());
    }

    fn stats_entry(
        bytes: i64,
        lag: i64,
    ) -> (PhysicalShard, Vec<(TeamRef, bool, TeamMetrics)>) {
        let team = StorageTeam::new(Team::new(vec![ServerId::random()], true));
        let metrics = TeamMetrics {
            ss_metrics: vec![(
                ServerId::random(),
                (lag >= 0).then(|| StorageServerMetric {
                    version_lag: lag,
                    ..Default::default()
                }),
            )],
        };
        let shard = PhysicalShard {
            id: 0,
            metrics: StorageMetrics::with_bytes(bytes),
        };
        (shard, vec![(team as TeamRef, true, metrics)])
    }

    #[test]
    fn scorer_prefers_small_shard_with_low_lag() {
        let (monitor, _rx) = monitor_with_relocations();
        let mut stats: PhysicalShardAwareTeamStats = BTreeMap::new();
        stats.insert(1, stats_entry(100, 5));
        stats.insert(2, stats_entry(900, 500));

        let best = monitor
            .select_teams_and_physical_shard(&stats, 1, Uuid::new_v4())
            .unwrap();
        assert_eq!(best.physical_shard_id, 1);
    }

    #[test]
    fn scorer_skips_candidates_missing_lag() {
        let (monitor, _rx) = monitor_with_relocations();
        let mut stats: PhysicalShardAwareTeamStats = BTreeMap::new();
        stats.insert(1, stats_entry(100, -1));
        stats.insert(2, stats_entry(900, 500));

        let best = monitor
            .select_teams_and_physical_shard(&stats, 1, Uuid::new_v4())
            .unwrap();
        assert_eq!(best.physical_shard_id, 2);
    }

    #[test]
    fn scorer_degenerates_to_none() {
        let (monitor, _rx) = monitor_with_relocations();
        let mut stats: PhysicalShardAwareTeamStats = BTreeMap::new();
        stats.insert(1, stats_entry(0, -1));
        assert!(monitor
            .select_teams_and_physical_shard(&stats, 1, Uuid::new_v4())
            .is_none());
    }
}
