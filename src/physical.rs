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

//! Physical shards: groups of key ranges co-located on one team so they
//! can be migrated as a unit.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use rand::Rng;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::{
    keyspace::{KeyRange, RangeMap},
    types::{StorageMetrics, Team},
    PhysicalShardConfig,
};

/// Reserved id for ranges that predate physical-shard tracking; never a
/// real physical shard, like id 0.
pub const ANONYMOUS_SHARD_ID: u64 = u64::MAX;

/// Range-map value for keys not yet assigned to any physical shard.
const UNASSIGNED: u64 = 0;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhysicalShard {
    pub id: u64,
    pub metrics: StorageMetrics,
}

impl PhysicalShard {
    fn new(id: u64) -> Self {
        debug_assert!(id != UNASSIGNED && id != ANONYMOUS_SHARD_ID);
        PhysicalShard {
            id,
            metrics: StorageMetrics::default(),
        }
    }
}

pub struct PhysicalShardCollection {
    cfg: PhysicalShardConfig,
    shards: HashMap<u64, PhysicalShard>,
    key_range_shard_ids: RangeMap<u64>,
    team_shard_ids: BTreeMap<Team, BTreeSet<u64>>,
}

impl PhysicalShardCollection {
    pub fn new(cfg: PhysicalShardConfig) -> Self {
        PhysicalShardCollection {
            cfg,
            shards: HashMap::new(),
            key_range_shard_ids: RangeMap::new(UNASSIGNED),
            team_shard_ids: BTreeMap::new(),
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        self.shards.contains_key(&id)
    }

    pub fn metrics_of(&self, id: u64) -> StorageMetrics {
        self.shards
            .get(&id)
            .map(|ps| ps.metrics)
            .unwrap_or_default()
    }

    /// Records that `id` now lives on `teams` (typically primary plus
    /// remote), breaking any previous team backlinks.
    pub fn update_physical_shard_to_teams(
        &mut self,
        id: u64,
        teams: &[Team],
        expected_servers_per_team: usize,
        debug_id: Uuid,
    ) {
        debug_assert!(id != UNASSIGNED && id != ANONYMOUS_SHARD_ID);
        for members in self.team_shard_ids.values_mut() {
            members.remove(&id);
        }
        self.team_shard_ids.retain(|_, members| !members.is_empty());
        for team in teams {
            debug_assert_eq!(team.len(), expected_servers_per_team);
            self.team_shard_ids
                .entry(team.clone())
                .or_default()
                .insert(id);
        }
        self.shards.entry(id).or_insert_with(|| PhysicalShard::new(id));
        debug!(id, teams = ?teams, %debug_id, "physical shard remapped to teams");
    }

    fn fits(&self, shard: &PhysicalShard, move_in: &StorageMetrics) -> bool {
        shard.metrics.bytes.saturating_add(move_in.bytes) <= self.cfg.max_physical_shard_bytes
    }

    /// An existing physical shard on `team` whose post-add bytes stay
    /// under the soft ceiling; the least loaded qualifying one wins.
    pub fn try_select_physical_shard_for(
        &self,
        team: &Team,
        move_in: &StorageMetrics,
        debug_id: Uuid,
    ) -> Option<u64> {
        let candidates = self.team_shard_ids.get(team)?;
        let selected = candidates
            .iter()
            .filter_map(|id| self.shards.get(id))
            .filter(|ps| self.fits(ps, move_in))
            .min_by_key(|ps| ps.metrics.bytes)
            .map(|ps| ps.id);
        trace!(team = ?team, ?selected, %debug_id, "physical shard selection");
        selected
    }

    pub fn check_physical_shard_valid(&self, id: u64, move_in: &StorageMetrics) -> bool {
        self.shards
            .get(&id)
            .map(|ps| self.fits(ps, move_in))
            .unwrap_or(false)
    }

    /// Among the teams already hosting `id`, a remote team of the
    /// expected size that can absorb the move.
    pub fn try_get_valid_remote_team_with(
        &self,
        id: u64,
        move_in: &StorageMetrics,
        expected_team_size: usize,
        debug_id: Uuid,
    ) -> Option<Team> {
        if !self.check_physical_shard_valid(id, move_in) {
            return None;
        }
        let team = self
            .team_shard_ids
            .iter()
            .find(|(team, members)| {
                members.contains(&id) && !team.primary && team.len() == expected_team_size
            })
            .map(|(team, _)| team.clone());
        trace!(id, team = ?team, %debug_id, "remote team pairing");
        team
    }

    pub fn get_valid_physical_shards_of(
        &self,
        team: &Team,
        move_in: &StorageMetrics,
        _debug_id: Uuid,
    ) -> Vec<PhysicalShard> {
        self.team_shard_ids
            .get(team)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|id| self.shards.get(id))
                    .filter(|ps| self.fits(ps, move_in))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_valid_paired_remote_teams_of(
        &self,
        team: &Team,
        move_in: &StorageMetrics,
        expected_team_size: usize,
        debug_id: Uuid,
    ) -> Vec<Team> {
        let mut out = Vec::new();
        for ps in self.get_valid_physical_shards_of(team, move_in, debug_id) {
            if let Some(remote) =
                self.try_get_valid_remote_team_with(ps.id, move_in, expected_team_size, debug_id)
            {
                if !out.contains(&remote) {
                    out.push(remote);
                }
            }
        }
        out
    }

    /// Assigns `range` to `id` in the key-range map (after a completed
    /// move onto that physical shard).
    pub fn update_key_range_to_physical_shard(&mut self, range: &KeyRange, id: u64) {
        debug_assert!(id != UNASSIGNED && id != ANONYMOUS_SHARD_ID);
        self.key_range_shard_ids.insert(range, id);
        self.key_range_shard_ids.coalesce(&KeyRange::all());
        self.shards.entry(id).or_insert_with(|| PhysicalShard::new(id));
    }

    pub fn physical_shard_of(&self, range: &KeyRange) -> Option<u64> {
        let id = *self.key_range_shard_ids.get(&range.begin);
        (id != UNASSIGNED).then_some(id)
    }

    /// Key ranges currently mapped to `id`, in key order.
    pub fn ranges_of(&self, id: u64) -> Vec<KeyRange> {
        self.key_range_shard_ids
            .iter()
            .filter(|(_, v)| **v == id)
            .map(|(r, _)| r)
            .collect()
    }

    /// Folds a new metrics observation for `range` into every physical
    /// shard it overlaps; `init_with_new_metrics` skips the subtraction
    /// of the previous observation (first sighting). Returns the ids
    /// touched so the caller can apply the size policy.
    pub fn update_physical_shard_metrics_by_key_range(
        &mut self,
        range: &KeyRange,
        new_metrics: &StorageMetrics,
        old_metrics: &StorageMetrics,
        init_with_new_metrics: bool,
    ) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .key_range_shard_ids
            .intersecting(range)
            .into_iter()
            .map(|(_, id)| *id)
            .filter(|id| *id != UNASSIGNED)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        for id in &ids {
            if let Some(ps) = self.shards.get_mut(id) {
                if !init_with_new_metrics {
                    ps.metrics = ps.metrics.saturating_sub(old_metrics);
                }
                ps.metrics = ps.metrics.saturating_add(new_metrics);
            }
        }
        ids
    }

    pub fn reduce_metrics_for_move_out(&mut self, id: u64, metrics: &StorageMetrics) {
        if let Some(ps) = self.shards.get_mut(&id) {
            ps.metrics = ps.metrics.saturating_sub(metrics);
        }
    }

    pub fn increase_metrics_for_move_in(&mut self, id: u64, metrics: &StorageMetrics) {
        if let Some(ps) = self.shards.get_mut(&id) {
            ps.metrics = ps.metrics.saturating_add(metrics);
        }
    }

    /// Whether `id` crossed the oversize threshold.
    pub fn is_oversized(&self, id: u64) -> bool {
        self.metrics_of(id).bytes > self.cfg.split_threshold_bytes
    }

    /// Whether `id` is small enough and cold enough to merge.
    pub fn is_undersized_and_cold(&self, id: u64) -> bool {
        let metrics = self.metrics_of(id);
        metrics.bytes < self.cfg.merge_threshold_bytes
            && metrics.bytes_read_per_ksec < self.cfg.cold_read_bytes_per_ksec
    }

    /// A uniform random 64-bit id, rejecting 0, the anonymous id and
    /// anything already in use.
    pub fn generate_new_physical_shard_id(&self, debug_id: Uuid) -> u64 {
        let mut rng = rand::thread_rng();
        loop {
            let id: u64 = rng.gen();
            if id != UNASSIGNED && id != ANONYMOUS_SHARD_ID && !self.shards.contains_key(&id) {
                debug!(id, %debug_id, "generated physical shard id");
                return id;
            }
        }
    }
}
