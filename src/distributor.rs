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

//! Wires the control plane together: loads the startup snapshot, seeds
//! the registry and tracker, and runs the team collections, relocation
//! queue and storage wigglers as children of one root task tree.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    keyspace::{max_key, KeyRange},
    meta::{run_meta_transaction, InitialDataDistribution, MetaStore},
    monitor::RuntimeMonitor,
    movekeys::{DataMovePhase, MoveKeys},
    physical::PhysicalShardCollection,
    queue::{QueueObservables, RelocationQueue},
    registry::ShardTeamRegistry,
    team::{StorageTeam, TeamCollection, TeamCollectionInterface},
    tracker::{
        DataDistributionTracker, GetMetricsListRequest, GetMetricsRequest, GetTopKMetricsRequest,
        ShardMetricsProvider,
    },
    types::{RelocateReason, RelocateShard, ServerId, Team},
    wiggler::{StorageMetadata, StorageWiggler, WiggleState},
    Config, Result,
};

fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Control messages for a region's wiggler task.
pub enum WiggleUpdate {
    AddServer(ServerId, StorageMetadata),
    RemoveServer(ServerId),
    SetState(WiggleState),
}

/// The in-process request surface of a running distributor.
#[derive(Clone)]
pub struct DistributorInterface {
    pub relocations: mpsc::UnboundedSender<RelocateShard>,
    pub get_shard_metrics: mpsc::UnboundedSender<GetMetricsRequest>,
    pub get_top_k_metrics: mpsc::UnboundedSender<GetTopKMetricsRequest>,
    pub get_metrics_list: mpsc::UnboundedSender<GetMetricsListRequest>,
    pub get_average_shard_bytes: mpsc::UnboundedSender<oneshot::Sender<i64>>,
    pub team_collections: Vec<TeamCollectionInterface>,
    pub wiggle_updates: Vec<mpsc::UnboundedSender<WiggleUpdate>>,
}

pub struct DataDistributor {
    registry: Arc<Mutex<ShardTeamRegistry>>,
    monitor: Arc<RuntimeMonitor>,
    interface: DistributorInterface,
    observables: QueueObservables,
    shutdown_tx: watch::Sender<bool>,
    queue_task: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl DataDistributor {
    /// Reads the startup snapshot and brings the whole task tree up.
    pub async fn launch(
        cfg: Config,
        meta: Arc<dyn MetaStore>,
        move_keys: Arc<dyn MoveKeys>,
        provider: Arc<dyn ShardMetricsProvider>,
    ) -> Result<Self> {
        let initial =
            run_meta_transaction(&cfg.distributor, || meta.initial_distribution()).await?;
        info!(
            servers = initial.all_servers.len(),
            shards = initial.shards.len(),
            data_moves = initial.data_moves.len(),
            "data distributor starting"
        );

        let (registry, restart_rx) = ShardTeamRegistry::new();
        let registry = Arc::new(Mutex::new(registry));
        let physical = Arc::new(Mutex::new(PhysicalShardCollection::new(
            cfg.distributor.physical_shard.clone(),
        )));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        // team collections, one per region
        let has_remote = !initial.remote_teams.is_empty();
        let mut interfaces: Vec<TeamCollectionInterface> = Vec::new();
        let mut team_size = 0;
        for primary in [true, false] {
            if !primary && !has_remote {
                continue;
            }
            let (shared, interface, runner) = TeamCollection::new(
                primary,
                cfg.distributor.team_selection.clone(),
                registry.clone(),
            );
            let teams = if primary {
                &initial.primary_teams
            } else {
                &initial.remote_teams
            };
            {
                let mut collection = shared.lock().unwrap();
                for servers in teams {
                    team_size = team_size.max(servers.len());
                    collection.insert_team(StorageTeam::new(Team::new(servers.clone(), primary)));
                }
            }
            interfaces.push(interface);
            tasks.push(tokio::spawn(runner.run()));
        }

        let (relocate_tx, relocate_rx) = mpsc::unbounded_channel();
        let (get_metrics_tx, get_metrics_rx) = mpsc::unbounded_channel();
        let (get_top_k_tx, get_top_k_rx) = mpsc::unbounded_channel();
        let (get_metrics_list_tx, get_metrics_list_rx) = mpsc::unbounded_channel();
        let (get_avg_bytes_tx, get_avg_bytes_rx) = mpsc::unbounded_channel();

        let monitor = Arc::new(RuntimeMonitor::new(
            cfg.distributor.priorities.clone(),
            relocate_tx.clone(),
            interfaces.clone(),
            physical.clone(),
            get_metrics_tx.clone(),
        ));

        let tracker = DataDistributionTracker::new(
            cfg.distributor.clone(),
            provider,
            registry.clone(),
            physical.clone(),
            monitor.clone(),
            relocate_tx.clone(),
        );
        Self::seed_from_snapshot(&cfg, &registry, &tracker, &relocate_tx, &initial);
        tasks.push(tokio::spawn(tracker.run(
            restart_rx,
            get_metrics_rx,
            get_top_k_rx,
            get_metrics_list_rx,
            get_avg_bytes_rx,
        )));

        let (queue, observables) = RelocationQueue::new(
            cfg.distributor.clone(),
            registry.clone(),
            physical.clone(),
            monitor.clone(),
            interfaces.clone(),
            move_keys,
            team_size.max(1),
        );
        let queue_task = tokio::spawn(queue.run(relocate_rx, shutdown_rx.clone()));

        // one perpetual wiggler per region
        let mut wiggle_updates = Vec::new();
        for primary in [true, false] {
            if !primary && !has_remote {
                continue;
            }
            let (update_tx, update_rx) = mpsc::unbounded_channel();
            let mut wiggler = StorageWiggler::new(primary, cfg.wiggle.clone());
            if let Err(e) = wiggler.restore_stats(meta.as_ref()).await {
                warn!(primary, error = %e, "wiggle stats restore failed");
            }
            tasks.push(tokio::spawn(perpetual_wiggle(
                wiggler,
                update_rx,
                registry.clone(),
                relocate_tx.clone(),
                meta.clone(),
                cfg.clone(),
                shutdown_rx.clone(),
            )));
            wiggle_updates.push(update_tx);
        }

        let interface = DistributorInterface {
            relocations: relocate_tx,
            get_shard_metrics: get_metrics_tx,
            get_top_k_metrics: get_top_k_tx,
            get_metrics_list: get_metrics_list_tx,
            get_average_shard_bytes: get_avg_bytes_tx,
            team_collections: interfaces,
            wiggle_updates,
        };

        Ok(DataDistributor {
            registry,
            monitor,
            interface,
            observables,
            shutdown_tx,
            queue_task,
            tasks,
        })
    }

    /// Replays the persisted shard map into the registry and tracker,
    /// and resumes unfinished moves.
    fn seed_from_snapshot(
        cfg: &Config,
        registry: &Arc<Mutex<ShardTeamRegistry>>,
        tracker: &DataDistributionTracker,
        relocate_tx: &mpsc::UnboundedSender<RelocateShard>,
        initial: &InitialDataDistribution,
    ) {
        let priorities = &cfg.distributor.priorities;
        for pair in initial.shards.windows(2) {
            let range = KeyRange::new(pair[0].key.clone(), pair[1].key.clone());
            Self::seed_shard(registry, &range, &pair[0].primary_src, &pair[0].remote_src);
            tracker.track_shard(range);
        }
        if let Some(last) = initial.shards.last() {
            if last.key < max_key() {
                let range = KeyRange::new(last.key.clone(), max_key());
                Self::seed_shard(registry, &range, &last.primary_src, &last.remote_src);
                tracker.track_shard(range);
            }
        }

        for mv in &initial.data_moves {
            if mv.phase == DataMovePhase::Deleting || mv.cancelled {
                debug!(id = %mv.id, range = %mv.range, "resuming data move cleanup");
            }
            let _ = relocate_tx.send(RelocateShard::restore(
                mv.range.clone(),
                priorities.recover_move,
                Arc::new(mv.clone()),
            ));
        }
    }

    fn seed_shard(
        registry: &Arc<Mutex<ShardTeamRegistry>>,
        range: &KeyRange,
        primary_src: &[ServerId],
        remote_src: &[ServerId],
    ) {
        let mut teams = Vec::new();
        if !primary_src.is_empty() {
            teams.push(Team::new(primary_src.to_vec(), true));
        }
        if !remote_src.is_empty() {
            teams.push(Team::new(remote_src.to_vec(), false));
        }
        if teams.is_empty() {
            return;
        }
        let mut registry = registry.lock().unwrap();
        registry.define_shard(range);
        registry.move_shard(range, teams);
        registry.finish_move(range);
    }

    pub fn interface(&self) -> DistributorInterface {
        self.interface.clone()
    }

    pub fn observables(&self) -> &QueueObservables {
        &self.observables
    }

    pub fn registry(&self) -> Arc<Mutex<ShardTeamRegistry>> {
        self.registry.clone()
    }

    pub fn monitor(&self) -> Arc<RuntimeMonitor> {
        self.monitor.clone()
    }

    /// Stops the task tree. The queue rolls its in-flight moves back to
    /// the cancelled state before exiting.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if tokio::time::timeout(Duration::from_secs(10), self.queue_task)
            .await
            .is_err()
        {
            warn!("relocation queue did not stop in time");
        }
        for task in self.tasks {
            task.abort();
        }
        info!("data distributor stopped");
    }
}

/// Cycles the region's storage servers out for rebuild, oldest storage
/// first. Each step relocates the victim's shards at wiggle priority
/// and records the round statistics.
async fn perpetual_wiggle(
    mut wiggler: StorageWiggler,
    mut updates: mpsc::UnboundedReceiver<WiggleUpdate>,
    registry: Arc<Mutex<ShardTeamRegistry>>,
    relocate_tx: mpsc::UnboundedSender<RelocateShard>,
    meta: Arc<dyn MetaStore>,
    cfg: Config,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval =
        tokio::time::interval(Duration::from_secs_f64(cfg.wiggle.interval_secs.max(0.01)));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            update = updates.recv() => {
                match update {
                    Some(WiggleUpdate::AddServer(id, metadata)) => {
                        if wiggler.contains(&id) {
                            wiggler.update_metadata(id, metadata);
                        } else {
                            wiggler.add_server(id, metadata);
                        }
                    }
                    Some(WiggleUpdate::RemoveServer(id)) => wiggler.remove_server(&id),
                    Some(WiggleUpdate::SetState(state)) => {
                        wiggler.set_state(state, epoch_now());
                    }
                    None => return,
                }
                continue;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }

        if wiggler.state() != WiggleState::Run {
            continue;
        }
        let Some(server) = wiggler.get_next_server_id() else {
            continue;
        };
        let now = epoch_now();
        if let Err(e) = wiggler.start_wiggle(meta.as_ref(), now).await {
            warn!(%server, error = %e, "wiggle start bookkeeping failed");
        }

        let ranges: Vec<KeyRange> = {
            let registry = registry.lock().unwrap();
            registry
                .get_teams_for_server(&server)
                .iter()
                .flat_map(|team| registry.get_shards_for(team))
                .collect()
        };
        info!(%server, shards = ranges.len(), "wiggling storage server");
        for range in ranges {
            let _ = relocate_tx.send(RelocateShard::new(
                range,
                cfg.distributor.priorities.perpetual_storage_wiggle,
                RelocateReason::Other,
            ));
        }

        if let Err(e) = wiggler.finish_wiggle(meta.as_ref(), epoch_now()).await {
            warn!(%server, error = %e, "wiggle finish bookkeeping failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::{
        keyspace::Key,
        meta::{testing::MemMetaStore, DdShardInfo},
        movekeys::testing::MemMoveKeys,
        types::StorageMetrics,
        Error,
    };

    struct IdleProvider;

    #[async_trait]
    impl ShardMetricsProvider for IdleProvider {
        async fn wait_metrics(
            &self,
            _range: &KeyRange,
            _min: &StorageMetrics,
            _max: &StorageMetrics,
        ) -> crate::Result<StorageMetrics> {
            futures::future::pending::<()>().await;
            Err(Error::Canceled)
        }

        async fn split_points(&self, _range: &KeyRange, _chunk: i64) -> crate::Result<Vec<Key>> {
            Ok(Vec::new())
        }
    }

    fn key(s: &str) -> Key {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn snapshot(team_a: &[ServerId], team_b: &[ServerId]) -> InitialDataDistribution {
        let mut initial = InitialDataDistribution::default();
        initial
            .primary_teams
            .insert(team_a.to_vec());
        initial
            .primary_teams
            .insert(team_b.to_vec());
        let mut first = DdShardInfo::new(Key::new());
        first.primary_src = team_a.to_vec();
        let mut second = DdShardInfo::new(key("m"));
        second.primary_src = team_b.to_vec();
        initial.shards = vec![first, second];
        initial
    }

    #[tokio::test]
    async fn startup_seeds_registry_from_snapshot() {
        let team_a: Vec<ServerId> = (0..3).map(|_| ServerId::random()).collect();
        let team_b: Vec<ServerId> = (0..3).map(|_| ServerId::random()).collect();
        let meta = Arc::new(MemMetaStore::default());
        meta.set_initial(snapshot(&team_a, &team_b));

        let dd = DataDistributor::launch(
            Config::default(),
            meta,
            Arc::new(MemMoveKeys::default()),
            Arc::new(IdleProvider),
        )
        .await
        .unwrap();

        let registry = dd.registry();
        let (dests, prev) = registry
            .lock()
            .unwrap()
            .get_teams_for(&KeyRange::new(key("a"), key("b")));
        assert_eq!(dests, vec![Team::new(team_a.clone(), true)]);
        assert!(prev.is_empty());
        let (dests, _) = registry
            .lock()
            .unwrap()
            .get_teams_for(&KeyRange::new(key("x"), key("y")));
        assert_eq!(dests, vec![Team::new(team_b.clone(), true)]);

        dd.shutdown().await;
    }

    #[tokio::test]
    async fn injected_relocation_lands_on_a_live_team() {
        let team_a: Vec<ServerId> = (0..3).map(|_| ServerId::random()).collect();
        let team_b: Vec<ServerId> = (0..3).map(|_| ServerId::random()).collect();
        let meta = Arc::new(MemMetaStore::default());
        meta.set_initial(snapshot(&team_a, &team_b));
        let move_keys = Arc::new(MemMoveKeys::default());

        let dd = DataDistributor::launch(
            Config::default(),
            meta,
            move_keys.clone(),
            Arc::new(IdleProvider),
        )
        .await
        .unwrap();

        let priorities = crate::Priorities::default();
        dd.interface()
            .relocations
            .send(RelocateShard::new(
                KeyRange::new(key("m"), key("q")),
                priorities.team_unhealthy,
                RelocateReason::Other,
            ))
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let done = move_keys
                    .moves()
                    .iter()
                    .filter(|m| m.phase == DataMovePhase::Done)
                    .count();
                if done >= 1 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("relocation did not finish");

        let registry = dd.registry();
        let (dests, prev) = registry
            .lock()
            .unwrap()
            .get_teams_for(&KeyRange::new(key("m"), key("q")));
        assert_eq!(dests.len(), 1);
        assert!(prev.is_empty());
        assert!(dests[0] == Team::new(team_a.clone(), true)
            || dests[0] == Team::new(team_b.clone(), true));

        dd.shutdown().await;
    }
}
