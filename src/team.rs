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

//! Team state, scoring and the per-region team collection that answers
//! destination-selection requests from the relocation queue.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::{
    registry::ShardTeamRegistry,
    types::{ServerId, StorageMetrics, Team},
    TeamSelectionConfig,
};

/// The behavior the relocation queue needs from a replica team.
pub trait DataDistributionTeam: Send + Sync {
    fn server_ids(&self) -> Vec<ServerId>;
    fn size(&self) -> usize;
    fn team_id(&self) -> String;

    fn add_data_in_flight(&self, delta: i64);
    fn data_in_flight(&self) -> i64;
    fn add_read_in_flight(&self, delta: f64);
    fn read_in_flight(&self) -> f64;

    /// `tracked bytes + in-flight bytes × penalty`.
    fn load_bytes(&self, include_in_flight: bool, inflight_penalty: f64) -> i64;
    fn read_load(&self, include_in_flight: bool, inflight_penalty: f64) -> f64;

    fn min_available_space(&self, include_in_flight: bool) -> i64;
    fn min_available_space_ratio(&self, include_in_flight: bool) -> f64;
    fn has_healthy_available_space(&self, min_ratio: f64) -> bool;

    fn is_healthy(&self) -> bool;
    fn set_healthy(&self, healthy: bool);
    fn priority(&self) -> i32;
    fn set_priority(&self, priority: i32);
    fn is_wrong_configuration(&self) -> bool;
    fn set_wrong_configuration(&self, wrong: bool);
}

pub type TeamRef = Arc<dyn DataDistributionTeam>;

#[derive(Debug, Default, Clone)]
struct ServerSpace {
    available: i64,
    total: i64,
}

#[derive(Debug, Default)]
struct TeamState {
    tracked_bytes: i64,
    read_bandwidth: f64,
    data_in_flight: i64,
    read_in_flight: f64,
    healthy: bool,
    priority: i32,
    wrong_configuration: bool,
    server_space: HashMap<ServerId, ServerSpace>,
}

/// Concrete team kept by the collection.
pub struct StorageTeam {
    team: Team,
    state: Mutex<TeamState>,
}

impl StorageTeam {
    pub fn new(team: Team) -> Arc<Self> {
        Arc::new(StorageTeam {
            team,
            state: Mutex::new(TeamState {
                healthy: true,
                ..Default::default()
            }),
        })
    }

    pub fn team(&self) -> &Team {
        &self.team
    }

    pub fn set_tracked_bytes(&self, bytes: i64) {
        self.state.lock().unwrap().tracked_bytes = bytes;
    }

    pub fn set_read_bandwidth(&self, bandwidth: f64) {
        self.state.lock().unwrap().read_bandwidth = bandwidth;
    }

    pub fn set_server_space(&self, id: ServerId, available: i64, total: i64) {
        self.state
            .lock()
            .unwrap()
            .server_space
            .insert(id, ServerSpace { available, total });
    }
}

impl DataDistributionTeam for StorageTeam {
    fn server_ids(&self) -> Vec<ServerId> {
        self.team.servers().to_vec()
    }

    fn size(&self) -> usize {
        self.team.len()
    }

    fn team_id(&self) -> String {
        format!("{:?}", self.team)
    }

    fn add_data_in_flight(&self, delta: i64) {
        self.state.lock().unwrap().data_in_flight += delta;
    }

    fn data_in_flight(&self) -> i64 {
        self.state.lock().unwrap().data_in_flight
    }

    fn add_read_in_flight(&self, delta: f64) {
        self.state.lock().unwrap().read_in_flight += delta;
    }

    fn read_in_flight(&self) -> f64 {
        self.state.lock().unwrap().read_in_flight
    }

    fn load_bytes(&self, include_in_flight: bool, inflight_penalty: f64) -> i64 {
        let state = self.state.lock().unwrap();
        let mut load = state.tracked_bytes;
        if include_in_flight {
            load += (state.data_in_flight as f64 * inflight_penalty) as i64;
        }
        load
    }

    fn read_load(&self, include_in_flight: bool, inflight_penalty: f64) -> f64 {
        let state = self.state.lock().unwrap();
        let mut load = state.read_bandwidth;
        if include_in_flight {
            load += state.read_in_flight * inflight_penalty;
        }
        load
    }

    fn min_available_space(&self, include_in_flight: bool) -> i64 {
        let state = self.state.lock().unwrap();
        let in_flight = if include_in_flight {
            state.data_in_flight / state.server_space.len().max(1) as i64
        } else {
            0
        };
        state
            .server_space
            .values()
            .map(|s| s.available - in_flight)
            .min()
            .unwrap_or(i64::MAX)
    }

    fn min_available_space_ratio(&self, include_in_flight: bool) -> f64 {
        let state = self.state.lock().unwrap();
        let in_flight = if include_in_flight {
            state.data_in_flight / state.server_space.len().max(1) as i64
        } else {
            0
        };
        state
            .server_space
            .values()
            .filter(|s| s.total > 0)
            .map(|s| (s.available - in_flight) as f64 / s.total as f64)
            .fold(f64::MAX, f64::min)
    }

    fn has_healthy_available_space(&self, min_ratio: f64) -> bool {
        self.min_available_space_ratio(true) >= min_ratio
    }

    fn is_healthy(&self) -> bool {
        self.state.lock().unwrap().healthy
    }

    fn set_healthy(&self, healthy: bool) {
        self.state.lock().unwrap().healthy = healthy;
    }

    fn priority(&self) -> i32 {
        self.state.lock().unwrap().priority
    }

    fn set_priority(&self, priority: i32) {
        self.state.lock().unwrap().priority = priority;
    }

    fn is_wrong_configuration(&self) -> bool {
        self.state.lock().unwrap().wrong_configuration
    }

    fn set_wrong_configuration(&self, wrong: bool) {
        self.state.lock().unwrap().wrong_configuration = wrong;
    }
}

pub struct GetTeamReply {
    pub team: Option<TeamRef>,
    pub found_src: bool,
}

/// Destination-selection request. The flags shape the score tuple; see
/// `TeamCollection::select_team`.
pub struct GetTeamRequest {
    /// In addition to servers in `complete_sources`, try to find teams
    /// with new servers.
    pub wants_new_servers: bool,
    pub wants_true_best: bool,
    /// If true, a lower-utilized team has the higher score.
    pub prefer_lower_disk_util: bool,
    pub team_must_have_shards: bool,
    pub for_read_balance: bool,
    /// Only meaningful when `for_read_balance` is set.
    pub prefer_lower_read_util: bool,
    pub inflight_penalty: f64,
    pub find_team_by_servers: bool,
    pub complete_sources: Vec<ServerId>,
    pub src: Vec<ServerId>,
    pub reply: oneshot::Sender<GetTeamReply>,
}

impl GetTeamRequest {
    /// Returns true when `a` scores below `b`.
    pub fn less_compare(&self, a: &TeamRef, b: &TeamRef, a_load: i64, b_load: i64) -> bool {
        let mut res = 0;
        if self.for_read_balance {
            res = if self.prefer_lower_read_util {
                Self::greater_read_load(a, b)
            } else {
                Self::less_read_load(a, b)
            };
        }
        if res == 0 {
            self.less_compare_by_load(a_load, b_load)
        } else {
            res < 0
        }
    }

    fn less_compare_by_load(&self, a_load: i64, b_load: i64) -> bool {
        let less_load = a_load <= b_load;
        if self.prefer_lower_disk_util {
            !less_load
        } else {
            less_load
        }
    }

    fn greater_read_load(a: &TeamRef, b: &TeamRef) -> i32 {
        let (r1, r2) = (a.read_load(true, 1.0), b.read_load(true, 1.0));
        if r1 == r2 {
            0
        } else if r1 > r2 {
            -1
        } else {
            1
        }
    }

    fn less_read_load(a: &TeamRef, b: &TeamRef) -> i32 {
        let (r1, r2) = (a.read_load(false, 1.0), b.read_load(false, 1.0));
        if r1 == r2 {
            0
        } else if r1 < r2 {
            -1
        } else {
            1
        }
    }
}

/// Per-server runtime figures served to the runtime monitor.
#[derive(Clone, Debug, Default)]
pub struct StorageServerMetric {
    pub metrics: StorageMetrics,
    pub bytes_lag: i64,
    pub version_lag: i64,
    pub cpu_usage: f64,
    pub disk_usage: f64,
    pub local_rate_limit: f64,
}

/// Per-server stats carried by a team status reply; servers without a
/// recent report carry `None`.
#[derive(Clone, Debug, Default)]
pub struct TeamMetrics {
    pub ss_metrics: Vec<(ServerId, Option<StorageServerMetric>)>,
}

impl TeamMetrics {
    /// Largest version lag among reporting servers, -1 when none have
    /// reported.
    pub fn max_version_lag(&self) -> i64 {
        self.ss_metrics
            .iter()
            .filter_map(|(_, m)| m.as_ref().map(|m| m.version_lag))
            .max()
            .unwrap_or(-1)
    }
}

pub struct GetStorageServerStatusRequest {
    pub server: ServerId,
    pub reply: oneshot::Sender<Option<StorageServerMetric>>,
}

pub struct GetTeamStatusRequest {
    pub servers: Vec<ServerId>,
    pub reply: oneshot::Sender<TeamMetrics>,
}

pub struct TeamsAndMetrics {
    pub teams: Vec<(TeamRef, bool, TeamMetrics)>,
}

pub struct GetTeamsAndMetricsRequest {
    pub team_count: usize,
    pub teams: Vec<Vec<ServerId>>,
    pub find_teams_by_servers: bool,
    pub reply: oneshot::Sender<TeamsAndMetrics>,
}

/// The request senders a region's team collection answers on.
#[derive(Clone)]
pub struct TeamCollectionInterface {
    pub get_team: mpsc::UnboundedSender<GetTeamRequest>,
    pub get_storage_server_status: mpsc::UnboundedSender<GetStorageServerStatusRequest>,
    pub get_team_status: mpsc::UnboundedSender<GetTeamStatusRequest>,
    pub get_teams_and_metrics: mpsc::UnboundedSender<GetTeamsAndMetricsRequest>,
}

struct TeamCollectionRequests {
    get_team: mpsc::UnboundedReceiver<GetTeamRequest>,
    get_storage_server_status: mpsc::UnboundedReceiver<GetStorageServerStatusRequest>,
    get_team_status: mpsc::UnboundedReceiver<GetTeamStatusRequest>,
    get_teams_and_metrics: mpsc::UnboundedReceiver<GetTeamsAndMetricsRequest>,
}

/// Teams and server health for one region.
pub struct TeamCollection {
    primary: bool,
    cfg: TeamSelectionConfig,
    teams: Vec<Arc<StorageTeam>>,
    server_metrics: HashMap<ServerId, StorageServerMetric>,
    registry: Arc<Mutex<ShardTeamRegistry>>,
}

impl TeamCollection {
    pub fn new(
        primary: bool,
        cfg: TeamSelectionConfig,
        registry: Arc<Mutex<ShardTeamRegistry>>,
    ) -> (
        Arc<Mutex<TeamCollection>>,
        TeamCollectionInterface,
        TeamCollectionRunner,
    ) {
        let (get_team_tx, get_team_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let (team_status_tx, team_status_rx) = mpsc::unbounded_channel();
        let (teams_metrics_tx, teams_metrics_rx) = mpsc::unbounded_channel();

        let collection = Arc::new(Mutex::new(TeamCollection {
            primary,
            cfg,
            teams: Vec::new(),
            server_metrics: HashMap::new(),
            registry,
        }));
        let interface = TeamCollectionInterface {
            get_team: get_team_tx,
            get_storage_server_status: status_tx,
            get_team_status: team_status_tx,
            get_teams_and_metrics: teams_metrics_tx,
        };
        let runner = TeamCollectionRunner {
            shared: collection.clone(),
            requests: TeamCollectionRequests {
                get_team: get_team_rx,
                get_storage_server_status: status_rx,
                get_team_status: team_status_rx,
                get_teams_and_metrics: teams_metrics_rx,
            },
        };
        (collection, interface, runner)
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn insert_team(&mut self, team: Arc<StorageTeam>) {
        debug_assert_eq!(team.team().primary, self.primary);
        if !self
            .teams
            .iter()
            .any(|existing| existing.team() == team.team())
        {
            debug!(team = ?team.team(), "team added to collection");
            self.teams.push(team);
        }
    }

    pub fn remove_team(&mut self, team: &Team) {
        self.teams.retain(|existing| existing.team() != team);
    }

    pub fn team_count(&self) -> usize {
        self.teams.len()
    }

    pub fn update_server_metric(&mut self, id: ServerId, metric: StorageServerMetric) {
        self.server_metrics.insert(id, metric);
    }

    fn team_metrics_for(&self, servers: &[ServerId]) -> TeamMetrics {
        TeamMetrics {
            ss_metrics: servers
                .iter()
                .map(|id| (*id, self.server_metrics.get(id).cloned()))
                .collect(),
        }
    }

    /// The scoring walk of §team-selection: health is a hard gate, read
    /// balance orders first when requested, then load bytes, with a
    /// preference for teams disjoint from the complete sources.
    pub fn select_team(&self, req: &GetTeamRequest) -> (Option<TeamRef>, bool) {
        if req.find_team_by_servers {
            let wanted = Team::new(req.src.clone(), self.primary);
            let found = self
                .teams
                .iter()
                .find(|t| *t.team() == wanted)
                .map(|t| t.clone() as TeamRef);
            return (found, true);
        }

        let candidates: Vec<&Arc<StorageTeam>> = self
            .teams
            .iter()
            .filter(|t| t.is_healthy())
            .filter(|t| {
                !req.team_must_have_shards
                    || self.registry.lock().unwrap().has_shards(t.team())
            })
            .collect();
        if candidates.is_empty() {
            return (None, false);
        }

        let considered: Vec<&Arc<StorageTeam>> = if req.wants_true_best {
            candidates
        } else {
            let mut rng = rand::thread_rng();
            candidates
                .choose_multiple(&mut rng, self.cfg.best_team_option_count.max(1))
                .copied()
                .collect()
        };

        let prefers_new = |t: &Arc<StorageTeam>| {
            req.complete_sources
                .iter()
                .all(|src| !t.team().contains(src))
        };
        let pool: Vec<&Arc<StorageTeam>> = if req.wants_new_servers {
            let fresh: Vec<&Arc<StorageTeam>> = considered
                .iter()
                .copied()
                .filter(|&t| prefers_new(t))
                .collect();
            if fresh.is_empty() {
                considered
            } else {
                fresh
            }
        } else {
            considered
        };

        let mut best: Option<(TeamRef, i64)> = None;
        for candidate in pool {
            let team_ref: TeamRef = candidate.clone();
            let load = team_ref.load_bytes(true, req.inflight_penalty);
            best = match best {
                None => Some((team_ref, load)),
                Some((best_ref, best_load)) => {
                    if req.less_compare(&best_ref, &team_ref, best_load, load) {
                        Some((team_ref, load))
                    } else {
                        Some((best_ref, best_load))
                    }
                }
            };
        }
        trace!(
            primary = self.primary,
            picked = ?best.as_ref().map(|(t, _)| t.team_id()),
            true_best = req.wants_true_best,
            "team selected"
        );
        (best.map(|(t, _)| t), false)
    }

    fn handle_get_teams_and_metrics(&self, req: &GetTeamsAndMetricsRequest) -> TeamsAndMetrics {
        let picked: Vec<Arc<StorageTeam>> = if req.find_teams_by_servers {
            req.teams
                .iter()
                .filter_map(|servers| {
                    let wanted = Team::new(servers.clone(), self.primary);
                    self.teams.iter().find(|t| *t.team() == wanted).cloned()
                })
                .collect()
        } else {
            let mut rng = rand::thread_rng();
            self.teams
                .iter()
                .filter(|t| t.is_healthy())
                .cloned()
                .collect::<Vec<_>>()
                .choose_multiple(&mut rng, req.team_count.max(1))
                .cloned()
                .collect()
        };
        TeamsAndMetrics {
            teams: picked
                .into_iter()
                .map(|t| {
                    let metrics = self.team_metrics_for(t.team().servers());
                    (t as TeamRef, self.primary, metrics)
                })
                .collect(),
        }
    }
}

/// Drives one region's request loop.
pub struct TeamCollectionRunner {
    shared: Arc<Mutex<TeamCollection>>,
    requests: TeamCollectionRequests,
}

impl TeamCollectionRunner {
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                req = self.requests.get_team.recv() => {
                    let Some(req) = req else { break };
                    let (team, found_src) = self.shared.lock().unwrap().select_team(&req);
                    let _ = req.reply.send(GetTeamReply { team, found_src });
                }
                req = self.requests.get_storage_server_status.recv() => {
                    let Some(req) = req else { break };
                    let metric = self
                        .shared
                        .lock()
                        .unwrap()
                        .server_metrics
                        .get(&req.server)
                        .cloned();
                    let _ = req.reply.send(metric);
                }
                req = self.requests.get_team_status.recv() => {
                    let Some(req) = req else { break };
                    let metrics = self.shared.lock().unwrap().team_metrics_for(&req.servers);
                    let _ = req.reply.send(metrics);
                }
                req = self.requests.get_teams_and_metrics.recv() => {
                    let Some(req) = req else { break };
                    let reply = self.shared.lock().unwrap().handle_get_teams_and_metrics(&req);
                    let _ = req.reply.send(reply);
                }
            }
        }
    }
}
