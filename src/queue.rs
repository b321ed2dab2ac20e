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

//! Executes queued relocations: priority ordering, per-band parallelism
//! caps, destination selection, and the atomic handoff to the move-keys
//! collaborator.
//!
//! Per relocation the state machine is
//! `Queued -> TeamSelect -> MoveStart -> MoveCommit -> Tracked -> Done`,
//! with transient failures retried under backoff and cooperative
//! preemption at the safe point between team selection and the move
//! transaction.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    keyspace::KeyRange,
    meta::{run_meta_transaction, Backoff},
    monitor::{PhysicalShardAwareTeamStats, RuntimeMonitor},
    movekeys::{DataMove, DataMovePhase, MoveId, MoveKeys},
    physical::PhysicalShardCollection,
    registry::ShardTeamRegistry,
    team::{GetTeamRequest, GetTeamsAndMetricsRequest, TeamCollectionInterface, TeamRef},
    types::{RelocateReason, RelocateShard, ServerId, StorageMetrics, Team},
    DistributorConfig, Error, Priorities, Result,
};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
enum Band {
    Healing,
    Unhealthy,
    Rebalance,
    Wiggle,
}

fn band_of(priority: i32, p: &Priorities) -> Band {
    if priority == p.perpetual_storage_wiggle {
        Band::Wiggle
    } else if priority >= p.team_unhealthy {
        Band::Healing
    } else if priority >= p.team_healthy {
        Band::Unhealthy
    } else {
        Band::Rebalance
    }
}

/// A vanished team means the shard needs healing, not another attempt
/// at the same band.
fn parent_priority(priority: i32, p: &Priorities) -> i32 {
    priority.max(p.team_unhealthy)
}

#[derive(Clone, Debug)]
struct RelocateData {
    id: Uuid,
    range: KeyRange,
    priority: i32,
    reason: RelocateReason,
    data_move: Option<Arc<DataMove>>,
}

impl RelocateData {
    fn from_request(rs: RelocateShard) -> Self {
        RelocateData {
            id: Uuid::new_v4(),
            range: rs.range,
            priority: rs.priority,
            reason: rs.reason,
            data_move: rs.data_move,
        }
    }
}

enum Outcome {
    Done,
    Cancelled,
    Requeue { priority: i32, front: bool },
    Failed(Error),
}

struct Completion {
    id: Uuid,
    outcome: Outcome,
}

struct InFlight {
    id: Uuid,
    range: KeyRange,
    band: Band,
    task: JoinHandle<()>,
}

struct QueueShared {
    cfg: DistributorConfig,
    registry: Arc<Mutex<ShardTeamRegistry>>,
    physical: Arc<Mutex<PhysicalShardCollection>>,
    monitor: Arc<RuntimeMonitor>,
    team_collections: Vec<TeamCollectionInterface>,
    move_keys: Arc<dyn MoveKeys>,
    team_size: usize,
    /// Relocation id to its persisted move, for shutdown rollback.
    active_moves: Mutex<HashMap<Uuid, MoveId>>,
}

/// Receivers for the queue's observable state.
pub struct QueueObservables {
    pub processing_unhealthy: watch::Receiver<bool>,
    pub processing_wiggle: watch::Receiver<bool>,
}

pub struct RelocationQueue {
    shared: Arc<QueueShared>,
    queued: BTreeMap<i32, VecDeque<RelocateData>>,
    in_flight: Vec<InFlight>,
    band_busy: HashMap<Band, usize>,
    max_waiting_tx: watch::Sender<i32>,
    max_waiting_rx: watch::Receiver<i32>,
    processing_unhealthy: watch::Sender<bool>,
    processing_wiggle: watch::Sender<bool>,
}

impl RelocationQueue {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: DistributorConfig,
        registry: Arc<Mutex<ShardTeamRegistry>>,
        physical: Arc<Mutex<PhysicalShardCollection>>,
        monitor: Arc<RuntimeMonitor>,
        team_collections: Vec<TeamCollectionInterface>,
        move_keys: Arc<dyn MoveKeys>,
        team_size: usize,
    ) -> (Self, QueueObservables) {
        let (max_waiting_tx, max_waiting_rx) = watch::channel(0);
        let (unhealthy_tx, unhealthy_rx) = watch::channel(false);
        let (wiggle_tx, wiggle_rx) = watch::channel(false);
        let queue = RelocationQueue {
            shared: Arc::new(QueueShared {
                cfg,
                registry,
                physical,
                monitor,
                team_collections,
                move_keys,
                team_size,
                active_moves: Mutex::new(HashMap::new()),
            }),
            queued: BTreeMap::new(),
            in_flight: Vec::new(),
            band_busy: HashMap::new(),
            max_waiting_tx,
            max_waiting_rx,
            processing_unhealthy: unhealthy_tx,
            processing_wiggle: wiggle_tx,
        };
        let observables = QueueObservables {
            processing_unhealthy: unhealthy_rx,
            processing_wiggle: wiggle_rx,
        };
        (queue, observables)
    }

    /// Drains the relocation stream until it closes or shutdown flips.
    pub async fn run(
        mut self,
        mut input: mpsc::UnboundedReceiver<RelocateShard>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        loop {
            tokio::select! {
                msg = input.recv() => {
                    match msg {
                        Some(rs) => self.enqueue(rs),
                        None => break,
                    }
                }
                Some(done) = done_rx.recv() => self.on_complete(done),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            self.launch_ready(&done_tx);
        }
        self.roll_back_in_flight().await;
    }

    fn cap(&self, band: Band) -> usize {
        let p = &self.shared.cfg.parallelism;
        match band {
            Band::Healing => p.healing,
            Band::Unhealthy => p.unhealthy,
            Band::Rebalance => p.rebalance,
            Band::Wiggle => p.wiggle,
        }
    }

    fn enqueue(&mut self, rs: RelocateShard) {
        if rs.cancelled {
            for queue in self.queued.values_mut() {
                queue.retain(|item| !item.range.intersects(&rs.range));
            }
            self.publish_waiting();
            return;
        }
        let item = RelocateData::from_request(rs);
        // a newer request supersedes queued work it intersects at the
        // same or lower priority
        for (priority, queue) in self.queued.iter_mut() {
            if *priority <= item.priority {
                queue.retain(|queued| !queued.range.intersects(&item.range));
            }
        }
        debug!(range = %item.range, priority = item.priority, "relocation queued");
        self.queued.entry(item.priority).or_default().push_back(item);
        crate::metrics::RELOCATIONS_QUEUED.inc();
        self.publish_waiting();
    }

    fn publish_waiting(&mut self) {
        self.queued.retain(|_, queue| !queue.is_empty());
        let highest = self.queued.keys().next_back().copied().unwrap_or(0);
        let _ = self.max_waiting_tx.send(highest);
    }

    fn launch_ready(&mut self, done_tx: &mpsc::UnboundedSender<Completion>) {
        let priorities: Vec<i32> = self.queued.keys().rev().copied().collect();
        let mut launched_ranges: Vec<KeyRange> = Vec::new();
        for priority in priorities {
            let band = band_of(priority, &self.shared.cfg.priorities);
            let mut queue = self.queued.remove(&priority).unwrap_or_default();
            let mut remaining = VecDeque::new();
            while let Some(item) = queue.pop_front() {
                let busy = self.band_busy.get(&band).copied().unwrap_or(0);
                let blocked = busy >= self.cap(band)
                    || self
                        .in_flight
                        .iter()
                        .any(|f| f.range.intersects(&item.range))
                    || launched_ranges.iter().any(|r| r.intersects(&item.range));
                if blocked {
                    remaining.push_back(item);
                    continue;
                }
                launched_ranges.push(item.range.clone());
                self.launch(band, item, done_tx);
            }
            if !remaining.is_empty() {
                self.queued.insert(priority, remaining);
            }
        }
        self.publish_waiting();
    }

    fn launch(&mut self, band: Band, item: RelocateData, done_tx: &mpsc::UnboundedSender<Completion>) {
        info!(
            range = %item.range,
            priority = item.priority,
            reason = ?item.reason,
            "relocation started"
        );
        *self.band_busy.entry(band).or_default() += 1;
        let task = tokio::spawn(run_relocation(
            self.shared.clone(),
            item.clone(),
            self.max_waiting_rx.clone(),
            done_tx.clone(),
        ));
        self.in_flight.push(InFlight {
            id: item.id,
            range: item.range,
            band,
            task,
        });
        crate::metrics::RELOCATIONS_IN_FLIGHT.inc();
        self.update_processing_flags();
    }

    fn update_processing_flags(&self) {
        let unhealthy = self
            .in_flight
            .iter()
            .any(|f| matches!(f.band, Band::Healing | Band::Unhealthy));
        let wiggle = self.in_flight.iter().any(|f| f.band == Band::Wiggle);
        let _ = self.processing_unhealthy.send(unhealthy);
        let _ = self.processing_wiggle.send(wiggle);
    }

    fn on_complete(&mut self, done: Completion) {
        let Some(pos) = self.in_flight.iter().position(|f| f.id == done.id) else {
            return;
        };
        let flight = self.in_flight.swap_remove(pos);
        if let Some(busy) = self.band_busy.get_mut(&flight.band) {
            *busy = busy.saturating_sub(1);
        }
        crate::metrics::RELOCATIONS_IN_FLIGHT.dec();
        self.shared.active_moves.lock().unwrap().remove(&done.id);

        match done.outcome {
            Outcome::Done => {
                crate::metrics::RELOCATIONS_FINISHED_TOTAL.inc();
                debug!(range = %flight.range, "relocation finished");
            }
            Outcome::Cancelled => {
                debug!(range = %flight.range, "relocation cancelled");
            }
            Outcome::Requeue { priority, front } => {
                let item = RelocateData {
                    id: Uuid::new_v4(),
                    range: flight.range,
                    priority,
                    reason: RelocateReason::Other,
                    data_move: None,
                };
                let queue = self.queued.entry(priority).or_default();
                if front {
                    queue.push_front(item);
                } else {
                    queue.push_back(item);
                }
            }
            Outcome::Failed(e) => {
                crate::metrics::RELOCATIONS_ERRORS_TOTAL.inc();
                error!(range = %flight.range, error = %e, "relocation failed permanently");
            }
        }
        self.update_processing_flags();
    }

    /// Marks every in-flight move cancelled; the next distributor
    /// incarnation observes the Deleting phase and resumes cleanup.
    async fn roll_back_in_flight(&mut self) {
        for flight in self.in_flight.drain(..) {
            flight.task.abort();
        }
        let moves: Vec<MoveId> = self
            .shared
            .active_moves
            .lock()
            .unwrap()
            .drain()
            .map(|(_, id)| id)
            .collect();
        for id in moves {
            if let Err(e) = self.shared.move_keys.cancel_move(id).await {
                warn!(%id, error = %e, "failed to cancel move during shutdown");
            }
        }
        self.update_processing_flags();
    }
}

async fn run_relocation(
    shared: Arc<QueueShared>,
    item: RelocateData,
    preempt: watch::Receiver<i32>,
    done: mpsc::UnboundedSender<Completion>,
) {
    let mut backoff = Backoff::new(&shared.cfg);
    let outcome = loop {
        match attempt(&shared, &item, &preempt).await {
            Ok(()) => break Outcome::Done,
            Err(Error::Canceled) => break Outcome::Cancelled,
            Err(Error::ServiceIsBusy(_)) => {
                break Outcome::Requeue {
                    priority: item.priority,
                    front: true,
                }
            }
            Err(Error::TeamVanished(team)) => {
                warn!(range = %item.range, %team, "team vanished, requeueing relocation");
                break Outcome::Requeue {
                    priority: parent_priority(item.priority, &shared.cfg.priorities),
                    front: false,
                };
            }
            Err(e) if e.is_retryable() && !backoff.exhausted() => {
                debug!(range = %item.range, error = %e, "relocation retrying");
                backoff.delay().await;
            }
            Err(e) => break Outcome::Failed(e),
        }
    };
    let _ = done.send(Completion {
        id: item.id,
        outcome,
    });
}

/// One pass through the relocation state machine.
async fn attempt(
    shared: &QueueShared,
    item: &RelocateData,
    preempt: &watch::Receiver<i32>,
) -> Result<()> {
    let deadline = Duration::from_millis(shared.cfg.team_request_deadline_ms);

    let metrics = tokio::time::timeout(
        deadline,
        shared.monitor.get_key_range_metrics(item.range.clone()),
    )
    .await
    .map_err(|_| Error::DeadlineExceeded("shard metrics"))??;

    let (src_teams, prev_teams) = shared.registry.lock().unwrap().get_teams_for(&item.range);
    let complete_sources = complete_sources(&src_teams);

    // TeamSelect
    let selection = select_destination(shared, item, &metrics, &complete_sources).await?;

    // Safe point: yield to strictly higher-priority work before the
    // move transaction.
    if *preempt.borrow() > item.priority {
        return Err(Error::ServiceIsBusy("preempted by higher priority relocation"));
    }

    // MoveStart
    let move_id = item
        .data_move
        .as_ref()
        .map(|m| m.id)
        .unwrap_or_else(MoveId::random);
    let mut mv = DataMove::new(move_id, item.range.clone(), DataMovePhase::Prepare);
    for team in src_teams.iter().chain(prev_teams.iter()) {
        let servers = team.servers().to_vec();
        if team.primary {
            mv.primary_src.extend(servers);
        } else {
            mv.remote_src.extend(servers);
        }
    }
    for team in &selection.dest_teams {
        let servers = team.servers().to_vec();
        if team.primary {
            mv.primary_dest.extend(servers);
        } else {
            mv.remote_dest.extend(servers);
        }
    }
    run_meta_transaction(&shared.cfg, || shared.move_keys.start_move(&mv)).await?;
    shared
        .active_moves
        .lock()
        .unwrap()
        .insert(item.id, move_id);
    {
        let mut registry = shared.registry.lock().unwrap();
        registry.define_shard(&item.range);
        registry.move_shard(&item.range, selection.dest_teams.clone());
    }
    for team in &selection.dest_refs {
        team.add_data_in_flight(metrics.bytes);
    }

    // MoveCommit
    let committed = run_meta_transaction(&shared.cfg, || shared.move_keys.commit_move(move_id)).await;
    for team in &selection.dest_refs {
        team.add_data_in_flight(-metrics.bytes);
    }
    if let Err(e) = committed {
        let _ = shared.move_keys.cancel_move(move_id).await;
        return Err(e);
    }
    shared.registry.lock().unwrap().finish_move(&item.range);
    shared.active_moves.lock().unwrap().remove(&item.id);

    // Tracked: the new owners' physical shard takes over the range.
    if shared.cfg.physical_shard.physical_shard_aware_get_team {
        let mut physical = shared.physical.lock().unwrap();
        let pid = selection.physical_shard.unwrap_or_else(|| {
            physical
                .try_select_physical_shard_for(
                    &selection.dest_teams[0],
                    &metrics,
                    Uuid::new_v4(),
                )
                .unwrap_or_else(|| physical.generate_new_physical_shard_id(Uuid::new_v4()))
        });
        physical.update_physical_shard_to_teams(
            pid,
            &selection.dest_teams,
            shared.team_size,
            Uuid::new_v4(),
        );
        physical.update_key_range_to_physical_shard(&item.range, pid);
        physical.increase_metrics_for_move_in(pid, &metrics);
    }
    Ok(())
}

struct DestinationSelection {
    dest_refs: Vec<TeamRef>,
    dest_teams: Vec<Team>,
    physical_shard: Option<u64>,
}

/// Servers that appear in every current source team; a destination with
/// none of them gives the request its new-servers preference.
fn complete_sources(src_teams: &[Team]) -> Vec<ServerId> {
    let Some(first) = src_teams.first() else {
        return Vec::new();
    };
    first
        .servers()
        .iter()
        .filter(|id| src_teams.iter().all(|t| t.contains(id)))
        .copied()
        .collect()
}

async fn select_destination(
    shared: &QueueShared,
    item: &RelocateData,
    metrics: &StorageMetrics,
    complete_sources: &[ServerId],
) -> Result<DestinationSelection> {
    if shared.cfg.physical_shard.physical_shard_aware_get_team {
        if let Some(selection) = select_physical_shard_aware(shared, metrics).await? {
            return Ok(selection);
        }
    }

    let priorities = &shared.cfg.priorities;
    let healing = item.priority >= priorities.team_unhealthy;
    let inflight_penalty = if healing {
        shared.cfg.team_selection.inflight_penalty_unhealthy
    } else {
        shared.cfg.team_selection.inflight_penalty_healthy
    };

    let mut dest_refs = Vec::new();
    let mut dest_teams = Vec::new();
    for (index, collection) in shared.team_collections.iter().enumerate() {
        let (tx, rx) = oneshot::channel();
        let request = GetTeamRequest {
            wants_new_servers: item.priority == priorities.team_redundant,
            wants_true_best: healing,
            prefer_lower_disk_util: true,
            team_must_have_shards: false,
            for_read_balance: item.reason == RelocateReason::RebalanceRead,
            prefer_lower_read_util: item.reason == RelocateReason::RebalanceRead,
            inflight_penalty,
            find_team_by_servers: false,
            complete_sources: complete_sources.to_vec(),
            src: Vec::new(),
            reply: tx,
        };
        collection
            .get_team
            .send(request)
            .map_err(|_| Error::Canceled)?;
        let reply = tokio::time::timeout(
            Duration::from_millis(shared.cfg.team_request_deadline_ms),
            rx,
        )
        .await
        .map_err(|_| Error::DeadlineExceeded("team selection"))?
        .map_err(|_| Error::Canceled)?;
        let Some(team_ref) = reply.team else {
            return Err(Error::NoAvailableTeam);
        };
        dest_teams.push(Team::new(team_ref.server_ids(), index == 0));
        dest_refs.push(team_ref);
    }
    if dest_refs.is_empty() {
        return Err(Error::NoAvailableTeam);
    }
    Ok(DestinationSelection {
        dest_refs,
        dest_teams,
        physical_shard: None,
    })
}

/// Collects candidate `(team, physical shard)` pairs per region and
/// delegates to the runtime monitor's scorer. `None` falls back to the
/// standard selection.
async fn select_physical_shard_aware(
    shared: &QueueShared,
    metrics: &StorageMetrics,
) -> Result<Option<DestinationSelection>> {
    let num_dc = shared.team_collections.len();
    if num_dc == 0 {
        return Ok(None);
    }

    let mut regions = Vec::with_capacity(num_dc);
    for collection in &shared.team_collections {
        let (tx, rx) = oneshot::channel();
        collection
            .get_teams_and_metrics
            .send(GetTeamsAndMetricsRequest {
                team_count: shared.cfg.team_selection.team_count_taken_by_get_teams,
                teams: Vec::new(),
                find_teams_by_servers: false,
                reply: tx,
            })
            .map_err(|_| Error::Canceled)?;
        let reply = tokio::time::timeout(
            Duration::from_millis(shared.cfg.team_request_deadline_ms),
            rx,
        )
        .await
        .map_err(|_| Error::DeadlineExceeded("teams and metrics"))?
        .map_err(|_| Error::Canceled)?;
        regions.push(reply);
    }

    let mut stats: PhysicalShardAwareTeamStats = BTreeMap::new();
    {
        let physical = shared.physical.lock().unwrap();
        for (team_ref, primary, team_metrics) in &regions[0].teams {
            let team = Team::new(team_ref.server_ids(), *primary);
            for shard in physical.get_valid_physical_shards_of(&team, metrics, Uuid::new_v4()) {
                let mut entry = vec![(team_ref.clone(), *primary, team_metrics.clone())];
                if num_dc == 2 {
                    let Some(remote_team) = physical.try_get_valid_remote_team_with(
                        shard.id,
                        metrics,
                        shared.team_size,
                        Uuid::new_v4(),
                    ) else {
                        continue;
                    };
                    let Some(remote) = regions[1].teams.iter().find(|(r, _, _)| {
                        Team::new(r.server_ids(), false) == remote_team
                    }) else {
                        continue;
                    };
                    entry.push((remote.0.clone(), remote.1, remote.2.clone()));
                }
                stats.entry(shard.id).or_insert((shard, entry));
            }
        }
    }
    if stats.is_empty() {
        return Ok(None);
    }

    let Some(best) = shared
        .monitor
        .select_teams_and_physical_shard(&stats, num_dc, Uuid::new_v4())
    else {
        return Ok(None);
    };
    let dest_teams = best
        .best_teams
        .iter()
        .map(|(team_ref, primary)| Team::new(team_ref.server_ids(), *primary))
        .collect();
    Ok(Some(DestinationSelection {
        dest_refs: best.best_teams.into_iter().map(|(t, _)| t).collect(),
        dest_teams,
        physical_shard: Some(best.physical_shard_id),
    }))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::{
        movekeys::testing::MemMoveKeys,
        team::{StorageTeam, TeamCollection},
        tracker::GetMetricsRequest,
    };

    fn range(b: &str, e: &str) -> KeyRange {
        KeyRange::new(
            Bytes::copy_from_slice(b.as_bytes()),
            Bytes::copy_from_slice(e.as_bytes()),
        )
    }

    struct Fixture {
        relocate_tx: mpsc::UnboundedSender<RelocateShard>,
        shutdown_tx: watch::Sender<bool>,
        move_keys: Arc<MemMoveKeys>,
        registry: Arc<Mutex<ShardTeamRegistry>>,
        dest_team: Team,
        observables: QueueObservables,
    }

    /// Queue wired to a one-team collection, an in-memory move-keys and
    /// a stub metrics responder.
    fn start_queue(move_keys: Arc<MemMoveKeys>) -> Fixture {
        let cfg = DistributorConfig {
            retry_base_delay_ms: 10,
            retry_max_delay_ms: 50,
            ..Default::default()
        };
        let (registry, _restart_rx) = ShardTeamRegistry::new();
        let registry = Arc::new(Mutex::new(registry));
        let physical = Arc::new(Mutex::new(PhysicalShardCollection::new(
            cfg.physical_shard.clone(),
        )));

        let (collection, interface, runner) =
            TeamCollection::new(true, cfg.team_selection.clone(), registry.clone());
        let dest = StorageTeam::new(Team::new(
            (0..3).map(|_| ServerId::random()).collect(),
            true,
        ));
        let dest_team = dest.team().clone();
        collection.lock().unwrap().insert_team(dest);
        tokio::spawn(runner.run());

        let (relocate_tx, relocate_rx) = mpsc::unbounded_channel();
        let (metrics_tx, mut metrics_rx) = mpsc::unbounded_channel::<GetMetricsRequest>();
        tokio::spawn(async move {
            while let Some(req) = metrics_rx.recv().await {
                let _ = req.reply.send(StorageMetrics::with_bytes(1024));
            }
        });
        let monitor = Arc::new(RuntimeMonitor::new(
            cfg.priorities.clone(),
            relocate_tx.clone(),
            vec![interface.clone()],
            physical.clone(),
            metrics_tx,
        ));

        let (queue, observables) = RelocationQueue::new(
            cfg,
            registry.clone(),
            physical,
            monitor,
            vec![interface],
            move_keys.clone(),
            3,
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(queue.run(relocate_rx, shutdown_rx));

        Fixture {
            relocate_tx,
            shutdown_tx,
            move_keys,
            registry,
            dest_team,
            observables,
        }
    }

    async fn wait_for_done(move_keys: &MemMoveKeys, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let done = move_keys
                    .moves()
                    .iter()
                    .filter(|m| m.phase == DataMovePhase::Done)
                    .count();
                if done >= count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("moves did not complete");
    }

    #[tokio::test]
    async fn relocation_runs_to_completion() {
        let fixture = start_queue(Arc::new(MemMoveKeys::default()));
        let priorities = Priorities::default();

        fixture
            .relocate_tx
            .send(RelocateShard::new(
                range("b", "m"),
                priorities.team_unhealthy,
                RelocateReason::Other,
            ))
            .unwrap();
        wait_for_done(&fixture.move_keys, 1).await;

        let (dests, prev) = fixture
            .registry
            .lock()
            .unwrap()
            .get_teams_for(&range("b", "m"));
        assert_eq!(dests, vec![fixture.dest_team.clone()]);
        assert!(prev.is_empty());
        drop(fixture.shutdown_tx);
    }

    #[tokio::test]
    async fn conflicts_are_retried_with_fresh_selection() {
        let move_keys = Arc::new(MemMoveKeys::default());
        move_keys
            .conflicts_to_inject
            .store(1, std::sync::atomic::Ordering::SeqCst);
        let fixture = start_queue(move_keys);
        let priorities = Priorities::default();

        fixture
            .relocate_tx
            .send(RelocateShard::new(
                range("c", "f"),
                priorities.team_unhealthy,
                RelocateReason::Other,
            ))
            .unwrap();
        wait_for_done(&fixture.move_keys, 1).await;
        drop(fixture.shutdown_tx);
    }

    #[tokio::test]
    async fn intersecting_queued_work_is_superseded() {
        let fixture = start_queue(Arc::new(MemMoveKeys::default()));
        let priorities = Priorities::default();

        // same range twice, back to back; the second supersedes the
        // first unless the first already launched
        for _ in 0..2 {
            fixture
                .relocate_tx
                .send(RelocateShard::new(
                    range("g", "k"),
                    priorities.team_unhealthy,
                    RelocateReason::Other,
                ))
                .unwrap();
        }
        wait_for_done(&fixture.move_keys, 1).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(fixture.move_keys.moves().len() <= 2);
        drop(fixture.shutdown_tx);
    }

    #[tokio::test]
    async fn processing_unhealthy_clears_after_completion() {
        let fixture = start_queue(Arc::new(MemMoveKeys::default()));
        let priorities = Priorities::default();

        fixture
            .relocate_tx
            .send(RelocateShard::new(
                range("m", "q"),
                priorities.team_1_left,
                RelocateReason::Other,
            ))
            .unwrap();
        wait_for_done(&fixture.move_keys, 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!*fixture.observables.processing_unhealthy.borrow());
        drop(fixture.shutdown_tx);
    }

    #[test]
    fn bands_follow_priority_layout() {
        let p = Priorities::default();
        assert_eq!(band_of(p.split_shard, &p), Band::Healing);
        assert_eq!(band_of(p.team_0_left, &p), Band::Healing);
        assert_eq!(band_of(p.team_redundant, &p), Band::Unhealthy);
        assert_eq!(band_of(p.merge_shard, &p), Band::Unhealthy);
        assert_eq!(band_of(p.rebalance_underutilized_team, &p), Band::Rebalance);
        assert_eq!(band_of(p.perpetual_storage_wiggle, &p), Band::Wiggle);
    }

    #[test]
    fn vanished_teams_requeue_for_healing() {
        let p = Priorities::default();
        assert_eq!(parent_priority(p.rebalance_underutilized_team, &p), p.team_unhealthy);
        assert_eq!(parent_priority(p.team_failed, &p), p.team_failed);
    }
}
