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

use serde::{Deserialize, Serialize};

#[derive(Default, Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub distributor: DistributorConfig,

    #[serde(default)]
    pub ratekeeper: RatekeeperConfig,

    #[serde(default)]
    pub wiggle: WiggleConfig,
}

/// Relocation priorities. Higher runs first; the values form bands that
/// map onto per-band parallelism caps.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Priorities {
    pub recover_move: i32,
    pub rebalance_underutilized_team: i32,
    pub rebalance_overutilized_team: i32,
    pub rebalance_read_underutil_team: i32,
    pub rebalance_read_overutil_team: i32,
    pub perpetual_storage_wiggle: i32,
    pub team_healthy: i32,
    pub team_contains_undesired_server: i32,
    pub team_redundant: i32,
    pub merge_shard: i32,
    pub team_unhealthy: i32,
    pub team_2_left: i32,
    pub team_1_left: i32,
    pub team_failed: i32,
    pub team_0_left: i32,
    pub split_shard: i32,
    pub merge_physical_shard: i32,
    pub split_physical_shard: i32,
}

impl Default for Priorities {
    fn default() -> Self {
        Priorities {
            recover_move: 110,
            rebalance_underutilized_team: 120,
            rebalance_overutilized_team: 121,
            rebalance_read_underutil_team: 122,
            rebalance_read_overutil_team: 123,
            perpetual_storage_wiggle: 139,
            team_healthy: 140,
            team_contains_undesired_server: 150,
            team_redundant: 200,
            merge_shard: 240,
            team_unhealthy: 700,
            team_2_left: 709,
            team_1_left: 800,
            team_failed: 805,
            team_0_left: 809,
            split_shard: 950,
            merge_physical_shard: 955,
            split_physical_shard: 960,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelocationParallelism {
    pub healing: usize,
    pub unhealthy: usize,
    pub rebalance: usize,
    pub wiggle: usize,
}

impl Default for RelocationParallelism {
    fn default() -> Self {
        RelocationParallelism {
            healing: 10,
            unhealthy: 4,
            rebalance: 2,
            wiggle: 1,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PhysicalShardConfig {
    /// Hard ceiling used when deciding whether a physical shard can
    /// absorb additional data.
    pub max_physical_shard_bytes: i64,
    /// Smoothed bytes above which a physical shard is split.
    pub split_threshold_bytes: i64,
    /// Smoothed bytes below which a physical shard is a merge candidate.
    pub merge_threshold_bytes: i64,
    /// Read bandwidth (bytes per ksec) below which a small physical
    /// shard counts as cold.
    pub cold_read_bytes_per_ksec: i64,
    pub physical_shard_aware_get_team: bool,
}

impl Default for PhysicalShardConfig {
    fn default() -> Self {
        PhysicalShardConfig {
            max_physical_shard_bytes: 500_000_000,
            split_threshold_bytes: 450_000_000,
            merge_threshold_bytes: 75_000_000,
            cold_read_bytes_per_ksec: 100_000,
            physical_shard_aware_get_team: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShardTrackerConfig {
    pub min_shard_bytes: i64,
    pub max_shard_bytes: i64,
    /// Scales sqrt(database size) into the per-shard byte target.
    pub shard_bytes_per_sqrt_bytes: i64,
    /// max/min shard size ratio used to derive the merge floor.
    pub shard_bytes_ratio: i64,
    pub max_shard_bytes_per_ksec: i64,
    pub min_shard_bytes_per_ksec: i64,
    /// A merge is proposed only after bandwidth has stayed low this long.
    pub low_bandwidth_dwell_secs: f64,
}

impl Default for ShardTrackerConfig {
    fn default() -> Self {
        ShardTrackerConfig {
            min_shard_bytes: 50_000_000,
            max_shard_bytes: 500_000_000,
            shard_bytes_per_sqrt_bytes: 45,
            shard_bytes_ratio: 4,
            max_shard_bytes_per_ksec: 1_000_000_000,
            min_shard_bytes_per_ksec: 100_000,
            low_bandwidth_dwell_secs: 300.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TeamSelectionConfig {
    /// Number of random teams sampled when the request does not insist
    /// on the global optimum.
    pub best_team_option_count: usize,
    /// Teams returned by a teams-and-metrics sweep.
    pub team_count_taken_by_get_teams: usize,
    pub inflight_penalty_healthy: f64,
    pub inflight_penalty_unhealthy: f64,
    pub min_available_space_ratio: f64,
}

impl Default for TeamSelectionConfig {
    fn default() -> Self {
        TeamSelectionConfig {
            best_team_option_count: 4,
            team_count_taken_by_get_teams: 3,
            inflight_penalty_healthy: 1.0,
            inflight_penalty_unhealthy: 1.5,
            min_available_space_ratio: 0.05,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DistributorConfig {
    #[serde(default)]
    pub priorities: Priorities,

    #[serde(default)]
    pub parallelism: RelocationParallelism,

    #[serde(default)]
    pub physical_shard: PhysicalShardConfig,

    #[serde(default)]
    pub tracker: ShardTrackerConfig,

    #[serde(default)]
    pub team_selection: TeamSelectionConfig,

    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_multiplier: f64,
    pub retry_limit: usize,

    /// Soft deadline for a single metadata-store transaction.
    pub meta_transaction_deadline_ms: u64,
    /// Deadline for a team-selection round trip before the relocation
    /// requeues.
    pub team_request_deadline_ms: u64,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        DistributorConfig {
            priorities: Priorities::default(),
            parallelism: RelocationParallelism::default(),
            physical_shard: PhysicalShardConfig::default(),
            tracker: ShardTrackerConfig::default(),
            team_selection: TeamSelectionConfig::default(),
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            retry_multiplier: 2.0,
            retry_limit: 10,
            meta_transaction_deadline_ms: 5_000,
            team_request_deadline_ms: 30_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RatekeeperConfig {
    /// e-folding time of the fast input-rate smoothers, in seconds.
    pub smoothing_amount: f64,
    /// e-folding time of the very smooth durable-rate smoother.
    pub slow_smoothing_amount: f64,
    pub default_limit_tps: f64,
    pub min_available_space: i64,
    pub min_available_space_ratio: f64,
    /// Zones excused from the global limit computation.
    pub max_machines_falling_behind: usize,
    pub max_transactions_per_byte: f64,
    pub versions_per_second: f64,
    pub max_read_transaction_life_versions: f64,
    pub needed_tps_history_samples: usize,
    pub initial_durability_lag_multiplier: f64,
    pub durability_lag_reduction_rate: f64,
    pub durability_lag_increase_rate: f64,
    pub durability_lag_unlimited_threshold: f64,
}

impl Default for RatekeeperConfig {
    fn default() -> Self {
        RatekeeperConfig {
            smoothing_amount: 1.0,
            slow_smoothing_amount: 10.0,
            default_limit_tps: 1_000_000.0,
            min_available_space: 100_000_000,
            min_available_space_ratio: 0.05,
            max_machines_falling_behind: 1,
            max_transactions_per_byte: 1000.0,
            versions_per_second: 1e6,
            max_read_transaction_life_versions: 5e6,
            needed_tps_history_samples: 200,
            initial_durability_lag_multiplier: 1.02,
            durability_lag_reduction_rate: 0.9999,
            durability_lag_increase_rate: 1.001,
            durability_lag_unlimited_threshold: 50e6,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WiggleConfig {
    /// e-folding time of the smoothed round duration, in seconds.
    pub round_smoothing_secs: f64,
    /// e-folding time of the smoothed per-step duration.
    pub step_smoothing_secs: f64,
    pub interval_secs: f64,
}

impl Default for WiggleConfig {
    fn default() -> Self {
        WiggleConfig {
            round_smoothing_secs: 20.0 * 60.0,
            step_smoothing_secs: 10.0 * 60.0,
            interval_secs: 60.0,
        }
    }
}
