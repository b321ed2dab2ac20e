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

//! The rate keeper's rate updater: fuses per-process saturation signals
//! into one transactions-per-second ceiling and the reason that binds
//! it.

mod smoother;

use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    fmt,
};

pub use smoother::Smoother;
use tracing::{debug, warn};

use crate::{types::ServerId, RatekeeperConfig};

/// Which resource binds the global TPS limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitReason {
    Unlimited,
    StorageServerWriteQueueSize,
    StorageServerWriteBandwidthMvcc,
    StorageServerMinFreeSpace,
    StorageServerMinFreeSpaceRatio,
    StorageServerDurabilityLag,
    StorageServerReadableBehind,
    StorageServerListFetchFailed,
    LogServerWriteQueue,
    LogServerMvccWriteBandwidth,
    LogServerMinFreeSpace,
    LogServerMinFreeSpaceRatio,
}

impl fmt::Display for LimitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LimitReason::Unlimited => "unlimited",
            LimitReason::StorageServerWriteQueueSize => "storage_server_write_queue_size",
            LimitReason::StorageServerWriteBandwidthMvcc => "storage_server_write_bandwidth_mvcc",
            LimitReason::StorageServerMinFreeSpace => "storage_server_min_free_space",
            LimitReason::StorageServerMinFreeSpaceRatio => "storage_server_min_free_space_ratio",
            LimitReason::StorageServerDurabilityLag => "storage_server_durability_lag",
            LimitReason::StorageServerReadableBehind => "storage_server_readable_behind",
            LimitReason::StorageServerListFetchFailed => "storage_server_list_fetch_failed",
            LimitReason::LogServerWriteQueue => "log_server_write_queue",
            LimitReason::LogServerMvccWriteBandwidth => "log_server_mvcc_write_bandwidth",
            LimitReason::LogServerMinFreeSpace => "log_server_min_free_space",
            LimitReason::LogServerMinFreeSpaceRatio => "log_server_min_free_space_ratio",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StorageBytes {
    pub total: i64,
    pub available: i64,
    pub free: i64,
    pub used: i64,
}

#[derive(Clone, Debug, Default)]
pub struct StorageQueuingMetricsReply {
    pub instance_id: u64,
    pub bytes_input: i64,
    pub bytes_durable: i64,
    pub storage_bytes: StorageBytes,
    pub version: i64,
    pub durable_version: i64,
    pub cpu_usage: f64,
    pub disk_usage: f64,
}

/// Smoothed view of one storage server's queueing metrics.
pub struct StorageQueueInfo {
    pub id: ServerId,
    pub zone: Option<String>,
    pub valid: bool,
    pub accepting_requests: bool,
    pub last_reply: StorageQueuingMetricsReply,
    smooth_durable_bytes: Smoother,
    very_smooth_durable_bytes: Smoother,
    smooth_input_bytes: Smoother,
    smooth_free_space: Smoother,
    smooth_total_space: Smoother,
    smooth_durable_version: Smoother,
    smooth_latest_version: Smoother,
}

impl StorageQueueInfo {
    pub fn new(id: ServerId, zone: Option<String>, cfg: &RatekeeperConfig) -> Self {
        StorageQueueInfo {
            id,
            zone,
            valid: false,
            accepting_requests: true,
            last_reply: StorageQueuingMetricsReply::default(),
            smooth_durable_bytes: Smoother::new(cfg.smoothing_amount),
            very_smooth_durable_bytes: Smoother::new(cfg.slow_smoothing_amount),
            smooth_input_bytes: Smoother::new(cfg.smoothing_amount),
            smooth_free_space: Smoother::new(cfg.smoothing_amount),
            smooth_total_space: Smoother::new(cfg.smoothing_amount),
            smooth_durable_version: Smoother::new(cfg.smoothing_amount),
            smooth_latest_version: Smoother::new(cfg.smoothing_amount),
        }
    }

    /// Folds one metrics report in; an instance-id change means the
    /// process restarted, so every smoother resumes from the report.
    pub fn update(
        &mut self,
        reply: StorageQueuingMetricsReply,
        smooth_total_durable_bytes: &mut Smoother,
        now: f64,
    ) {
        let prev = std::mem::replace(&mut self.last_reply, reply);
        let reply = &self.last_reply;
        if !self.valid || prev.instance_id != reply.instance_id {
            self.smooth_durable_bytes.reset(reply.bytes_durable as f64);
            self.very_smooth_durable_bytes.reset(reply.bytes_durable as f64);
            self.smooth_input_bytes.reset(reply.bytes_input as f64);
            self.smooth_free_space.reset(reply.storage_bytes.available as f64);
            self.smooth_total_space.reset(reply.storage_bytes.total as f64);
            self.smooth_durable_version.reset(reply.durable_version as f64);
            self.smooth_latest_version.reset(reply.version as f64);
        } else {
            smooth_total_durable_bytes
                .add_delta((reply.bytes_durable - prev.bytes_durable) as f64, now);
            self.smooth_durable_bytes.set_total(reply.bytes_durable as f64, now);
            self.very_smooth_durable_bytes.set_total(reply.bytes_durable as f64, now);
            self.smooth_input_bytes.set_total(reply.bytes_input as f64, now);
            self.smooth_free_space.set_total(reply.storage_bytes.available as f64, now);
            self.smooth_total_space.set_total(reply.storage_bytes.total as f64, now);
            self.smooth_durable_version.set_total(reply.durable_version as f64, now);
            self.smooth_latest_version.set_total(reply.version as f64, now);
        }
        self.valid = true;
    }

    pub fn storage_queue_bytes(&mut self, now: f64) -> f64 {
        self.last_reply.bytes_input as f64 - self.smooth_durable_bytes.smooth_total(now)
    }

    pub fn durability_lag(&mut self, now: f64) -> f64 {
        self.smooth_latest_version.smooth_total(now) - self.smooth_durable_version.smooth_total(now)
    }

    pub fn smooth_input_bytes_rate(&mut self, now: f64) -> f64 {
        self.smooth_input_bytes.smooth_rate(now)
    }

    pub fn very_smooth_durable_bytes_rate(&mut self, now: f64) -> f64 {
        self.very_smooth_durable_bytes.smooth_rate(now)
    }

    pub fn smooth_free_space(&mut self, now: f64) -> f64 {
        self.smooth_free_space.smooth_total(now)
    }

    pub fn smooth_total_space(&mut self, now: f64) -> f64 {
        self.smooth_total_space.smooth_total(now)
    }
}

#[derive(Clone, Debug, Default)]
pub struct TLogQueuingMetricsReply {
    pub instance_id: u64,
    pub bytes_input: i64,
    pub bytes_durable: i64,
    pub storage_bytes: StorageBytes,
    pub version: i64,
}

/// Smoothed view of one transaction log server.
pub struct TLogQueueInfo {
    pub id: ServerId,
    pub valid: bool,
    pub last_reply: TLogQueuingMetricsReply,
    smooth_durable_bytes: Smoother,
    very_smooth_durable_bytes: Smoother,
    smooth_input_bytes: Smoother,
    smooth_free_space: Smoother,
    smooth_total_space: Smoother,
}

impl TLogQueueInfo {
    pub fn new(id: ServerId, cfg: &RatekeeperConfig) -> Self {
        TLogQueueInfo {
            id,
            valid: false,
            last_reply: TLogQueuingMetricsReply::default(),
            smooth_durable_bytes: Smoother::new(cfg.smoothing_amount),
            very_smooth_durable_bytes: Smoother::new(cfg.slow_smoothing_amount),
            smooth_input_bytes: Smoother::new(cfg.smoothing_amount),
            smooth_free_space: Smoother::new(cfg.smoothing_amount),
            smooth_total_space: Smoother::new(cfg.smoothing_amount),
        }
    }

    pub fn update(
        &mut self,
        reply: TLogQueuingMetricsReply,
        smooth_total_durable_bytes: &mut Smoother,
        now: f64,
    ) {
        let prev = std::mem::replace(&mut self.last_reply, reply);
        let reply = &self.last_reply;
        if !self.valid || prev.instance_id != reply.instance_id {
            self.smooth_durable_bytes.reset(reply.bytes_durable as f64);
            self.very_smooth_durable_bytes.reset(reply.bytes_durable as f64);
            self.smooth_input_bytes.reset(reply.bytes_input as f64);
            self.smooth_free_space.reset(reply.storage_bytes.available as f64);
            self.smooth_total_space.reset(reply.storage_bytes.total as f64);
        } else {
            smooth_total_durable_bytes
                .add_delta((reply.bytes_durable - prev.bytes_durable) as f64, now);
            self.smooth_durable_bytes.set_total(reply.bytes_durable as f64, now);
            self.very_smooth_durable_bytes.set_total(reply.bytes_durable as f64, now);
            self.smooth_input_bytes.set_total(reply.bytes_input as f64, now);
            self.smooth_free_space.set_total(reply.storage_bytes.available as f64, now);
            self.smooth_total_space.set_total(reply.storage_bytes.total as f64, now);
        }
        self.valid = true;
    }

    pub fn queue_bytes(&mut self, now: f64) -> f64 {
        self.last_reply.bytes_input as f64 - self.smooth_durable_bytes.smooth_total(now)
    }

    pub fn smooth_input_bytes_rate(&mut self, now: f64) -> f64 {
        self.smooth_input_bytes.smooth_rate(now)
    }

    pub fn very_smooth_durable_bytes_rate(&mut self, now: f64) -> f64 {
        self.very_smooth_durable_bytes.smooth_rate(now)
    }

    pub fn smooth_free_space(&mut self, now: f64) -> f64 {
        self.smooth_free_space.smooth_total(now)
    }

    pub fn smooth_total_space(&mut self, now: f64) -> f64 {
        self.smooth_total_space.smooth_total(now)
    }
}

/// Holds the per-process queue infos the updater reads.
pub struct MetricsTracker {
    pub storage_queues: BTreeMap<ServerId, StorageQueueInfo>,
    pub tlog_queues: BTreeMap<ServerId, TLogQueueInfo>,
    pub smooth_total_durable_bytes: Smoother,
    ss_list_fetch_failed: bool,
}

impl MetricsTracker {
    pub fn new(cfg: &RatekeeperConfig) -> Self {
        MetricsTracker {
            storage_queues: BTreeMap::new(),
            tlog_queues: BTreeMap::new(),
            smooth_total_durable_bytes: Smoother::new(cfg.slow_smoothing_amount),
            ss_list_fetch_failed: false,
        }
    }

    pub fn update_storage_queue_info(&mut self, info: StorageQueueInfo) {
        self.storage_queues.insert(info.id, info);
    }

    pub fn update_tlog_queue_info(&mut self, info: TLogQueueInfo) {
        self.tlog_queues.insert(info.id, info);
    }

    pub fn fail_ss_list_fetch(&mut self) {
        self.ss_list_fetch_failed = true;
    }

    pub fn ss_list_fetch_failed(&self) -> bool {
        self.ss_list_fetch_failed
    }
}

/// Per-priority targets and the durability-lag limiter state.
#[derive(Clone, Debug)]
pub struct RatekeeperLimits {
    pub storage_target_bytes: i64,
    pub storage_spring_bytes: i64,
    pub log_target_bytes: i64,
    pub log_spring_bytes: i64,
    pub durability_lag_target_versions: f64,
    pub max_version_difference: f64,
    pub durability_lag_limit: f64,
    pub last_durability_lag: f64,
}

impl RatekeeperLimits {
    pub fn new(
        storage_target_bytes: i64,
        storage_spring_bytes: i64,
        log_target_bytes: i64,
        log_spring_bytes: i64,
        durability_lag_target_versions: f64,
        max_version_difference: f64,
    ) -> Self {
        RatekeeperLimits {
            storage_target_bytes,
            storage_spring_bytes,
            log_target_bytes,
            log_spring_bytes,
            durability_lag_target_versions,
            max_version_difference,
            durability_lag_limit: f64::INFINITY,
            last_durability_lag: 0.0,
        }
    }
}

struct ProcessLimit {
    limit: f64,
    id: ServerId,
    zone: String,
    reason: LimitReason,
    durability_lag: f64,
}

pub struct RateUpdater {
    cfg: RatekeeperConfig,
    limits: RatekeeperLimits,
    storage_team_size: usize,
    actual_tps_history: VecDeque<f64>,
    tps_limit: f64,
    limit_reason: LimitReason,
    reason_id: Option<ServerId>,
}

impl RateUpdater {
    pub fn new(cfg: RatekeeperConfig, limits: RatekeeperLimits, storage_team_size: usize) -> Self {
        let default_limit = cfg.default_limit_tps;
        RateUpdater {
            cfg,
            limits,
            storage_team_size,
            actual_tps_history: VecDeque::new(),
            tps_limit: default_limit,
            limit_reason: LimitReason::Unlimited,
            reason_id: None,
        }
    }

    pub fn tps_limit(&self) -> f64 {
        self.tps_limit
    }

    pub fn limit_reason(&self) -> LimitReason {
        self.limit_reason
    }

    pub fn reason_id(&self) -> Option<ServerId> {
        self.reason_id
    }

    pub fn add_actual_tps(&mut self, tps: f64) {
        self.actual_tps_history.push_back(tps);
        while self.actual_tps_history.len() > 2 * self.cfg.needed_tps_history_samples {
            self.actual_tps_history.pop_front();
        }
    }

    /// Zones the limiter may excuse; bounded by what replication can
    /// tolerate.
    fn max_ignored_zones(&self) -> usize {
        self.cfg
            .max_machines_falling_behind
            .min(self.storage_team_size.saturating_sub(1))
    }

    /// Recomputes the TPS ceiling from every process's smoothed view.
    pub fn update(&mut self, tracker: &mut MetricsTracker, actual_tps: f64, now: f64) {
        if tracker.ss_list_fetch_failed() {
            warn!("storage server list fetch failed, throttling to zero");
            self.tps_limit = 0.0;
            self.limit_reason = LimitReason::StorageServerListFetchFailed;
            self.reason_id = None;
            crate::metrics::TPS_LIMIT_GAUGE.set(0.0);
            return;
        }

        let actual_tps = actual_tps.max(1.0);
        self.add_actual_tps(actual_tps);

        let mut limit = f64::INFINITY;
        let mut limit_reason = LimitReason::Unlimited;
        let mut reason_id = None;

        let mvcc_window_secs =
            self.cfg.max_read_transaction_life_versions / self.cfg.versions_per_second + 2.0;

        // ---- storage servers
        let mut ss_limits: Vec<ProcessLimit> = Vec::new();
        for (id, ss) in tracker.storage_queues.iter_mut() {
            if !ss.valid || !ss.accepting_requests {
                continue;
            }
            let total_space = ss.smooth_total_space(now);
            let free_space = ss.smooth_free_space(now);
            let min_free_space = (self.cfg.min_available_space as f64)
                .max(self.cfg.min_available_space_ratio * total_space);

            let mut ss_reason = LimitReason::Unlimited;
            let spring_bytes = (self.limits.storage_spring_bytes as f64)
                .min((free_space - min_free_space) * 0.2)
                .max(1.0);
            let target_bytes = (self.limits.storage_target_bytes as f64)
                .min(free_space - min_free_space)
                .max(1.0);
            if target_bytes != self.limits.storage_target_bytes as f64 {
                ss_reason = if min_free_space == self.cfg.min_available_space as f64 {
                    LimitReason::StorageServerMinFreeSpace
                } else {
                    LimitReason::StorageServerMinFreeSpaceRatio
                };
            }

            let queue_bytes = ss.storage_queue_bytes(now);
            let durability_lag = ss.durability_lag(now);
            let input_rate = ss.smooth_input_bytes_rate(now);
            let target_rate_ratio = ((queue_bytes - target_bytes + spring_bytes) / spring_bytes).min(2.0);

            // Never let a server eat its target bytes faster than one
            // MVCC window of writes.
            let max_bytes_per_second = (target_bytes - spring_bytes) / mvcc_window_secs;
            let mut limit_tps = (actual_tps * max_bytes_per_second / input_rate.max(1e-8))
                .min(max_bytes_per_second * self.cfg.max_transactions_per_byte);
            if ss_reason == LimitReason::Unlimited {
                ss_reason = LimitReason::StorageServerWriteBandwidthMvcc;
            }

            if target_rate_ratio > 0.0 && input_rate > 0.0 {
                let smoothed_rate = ss
                    .very_smooth_durable_bytes_rate(now)
                    .max(actual_tps / self.cfg.max_transactions_per_byte);
                let x = smoothed_rate / (input_rate * target_rate_ratio);
                let lim = actual_tps * x;
                if lim < limit_tps {
                    limit_tps = lim;
                    if matches!(
                        ss_reason,
                        LimitReason::Unlimited | LimitReason::StorageServerWriteBandwidthMvcc
                    ) {
                        ss_reason = LimitReason::StorageServerWriteQueueSize;
                    }
                }
            }

            ss_limits.push(ProcessLimit {
                limit: limit_tps,
                id: *id,
                zone: ss.zone.clone().unwrap_or_else(|| id.to_string()),
                reason: ss_reason,
                durability_lag,
            });
        }

        ss_limits.sort_by(|a, b| a.limit.total_cmp(&b.limit));
        let mut ignored_zones: HashSet<String> = HashSet::new();
        for entry in &ss_limits {
            if entry.limit >= limit {
                break;
            }
            if ignored_zones.len() < self.max_ignored_zones()
                && !ignored_zones.contains(&entry.zone)
            {
                ignored_zones.insert(entry.zone.clone());
                continue;
            }
            if ignored_zones.contains(&entry.zone) {
                continue;
            }
            limit = entry.limit;
            // The limit skips the excused zones, but the reported
            // reason still names the worst process overall.
            let worst = &ss_limits[0];
            limit_reason = worst.reason;
            reason_id = Some(worst.id);
            break;
        }

        // ---- storage durability lag
        let mut by_lag: Vec<&ProcessLimit> = ss_limits.iter().collect();
        by_lag.sort_by(|a, b| b.durability_lag.total_cmp(&a.durability_lag));
        let mut ignored_lag_zones: HashSet<&str> = HashSet::new();
        for entry in by_lag {
            if ignored_lag_zones.len() < self.max_ignored_zones()
                && !ignored_lag_zones.contains(entry.zone.as_str())
            {
                ignored_lag_zones.insert(entry.zone.as_str());
                continue;
            }
            if ignored_lag_zones.contains(entry.zone.as_str()) {
                continue;
            }
            let limiting_lag = entry.durability_lag;
            if limiting_lag > self.limits.durability_lag_target_versions
                && self.actual_tps_history.len() > self.cfg.needed_tps_history_samples
            {
                if self.limits.durability_lag_limit == f64::INFINITY {
                    let max_tps = self
                        .actual_tps_history
                        .iter()
                        .fold(0.0f64, |acc, tps| acc.max(*tps));
                    self.limits.durability_lag_limit =
                        self.cfg.initial_durability_lag_multiplier * max_tps;
                }
                if limiting_lag > self.limits.last_durability_lag {
                    self.limits.durability_lag_limit *=
                        self.cfg.durability_lag_reduction_rate;
                }
                if self.limits.durability_lag_limit < limit {
                    limit = self.limits.durability_lag_limit;
                    limit_reason = LimitReason::StorageServerDurabilityLag;
                    reason_id = Some(entry.id);
                }
            } else if self.limits.durability_lag_limit != f64::INFINITY
                && limiting_lag
                    > self.limits.durability_lag_target_versions
                        - self.cfg.durability_lag_unlimited_threshold
            {
                self.limits.durability_lag_limit *= self.cfg.durability_lag_increase_rate;
            } else {
                self.limits.durability_lag_limit = f64::INFINITY;
            }
            self.limits.last_durability_lag = limiting_lag;
            break;
        }

        // ---- version difference between the log pipeline and the
        // readable storage frontier
        let mut min_ss_version = i64::MAX;
        let mut min_limiting_ss_version = i64::MAX;
        for ss in tracker.storage_queues.values() {
            if !ss.valid {
                continue;
            }
            min_ss_version = min_ss_version.min(ss.last_reply.version);
            let zone = ss
                .zone
                .clone()
                .unwrap_or_else(|| ss.id.to_string());
            // excused zones may fall arbitrarily far behind
            if !ignored_zones.contains(&zone) {
                min_limiting_ss_version = min_limiting_ss_version.min(ss.last_reply.version);
            }
        }
        let mut max_tlog_version = i64::MIN;
        for tl in tracker.tlog_queues.values() {
            if tl.valid {
                max_tlog_version = max_tlog_version.max(tl.last_reply.version);
            }
        }
        let mut write_to_read_latency_limit = 0.0;
        if min_ss_version != i64::MAX && max_tlog_version != i64::MIN {
            let frontier = if min_limiting_ss_version != i64::MAX {
                min_limiting_ss_version
            } else {
                min_ss_version
            };
            write_to_read_latency_limit = ((max_tlog_version - frontier) as f64
                - self.limits.max_version_difference / 2.0)
                / (self.limits.max_version_difference / 4.0);
        }

        // ---- transaction log servers
        for (id, tl) in tracker.tlog_queues.iter_mut() {
            if !tl.valid {
                continue;
            }
            let total_space = tl.smooth_total_space(now);
            let free_space = tl.smooth_free_space(now);
            let min_free_space = (self.cfg.min_available_space as f64)
                .max(self.cfg.min_available_space_ratio * total_space);

            let mut tl_reason = LimitReason::LogServerWriteQueue;
            let spring_bytes = (self.limits.log_spring_bytes as f64)
                .min((free_space - min_free_space) * 0.2)
                .max(1.0);
            let target_bytes = (self.limits.log_target_bytes as f64)
                .min(free_space - min_free_space)
                .max(1.0);
            if target_bytes != self.limits.log_target_bytes as f64 {
                tl_reason = if min_free_space == self.cfg.min_available_space as f64 {
                    LimitReason::LogServerMinFreeSpace
                } else {
                    LimitReason::LogServerMinFreeSpaceRatio
                };
            }

            let queue_bytes = tl.queue_bytes(now);
            let input_rate = tl.smooth_input_bytes_rate(now);

            // Queue that cannot drain to disk at all throttles to zero.
            let non_durable = (tl.last_reply.bytes_input - tl.last_reply.bytes_durable) as f64;
            if non_durable > free_space - min_free_space / 2.0 {
                limit = 0.0;
                limit_reason = LimitReason::LogServerMinFreeSpace;
                reason_id = Some(*id);
            }

            let mut target_rate_ratio =
                ((queue_bytes - target_bytes + spring_bytes) / spring_bytes).min(2.0);
            if write_to_read_latency_limit > target_rate_ratio {
                target_rate_ratio = write_to_read_latency_limit;
                tl_reason = LimitReason::StorageServerReadableBehind;
            }

            if target_rate_ratio > 0.0 && input_rate > 0.0 {
                let smoothed_rate = tl
                    .very_smooth_durable_bytes_rate(now)
                    .max(actual_tps / self.cfg.max_transactions_per_byte);
                let mut x = smoothed_rate / (input_rate * target_rate_ratio);
                if target_rate_ratio < 0.75 {
                    x = x.max(0.95);
                }
                let lim = actual_tps * x;
                if lim < limit {
                    limit = lim;
                    limit_reason = tl_reason;
                    reason_id = Some(*id);
                }
            }

            let input_rate_floor = input_rate.max(actual_tps / self.cfg.max_transactions_per_byte);
            let max_bytes_per_second = (target_bytes - spring_bytes) / mvcc_window_secs;
            let lim = (actual_tps * max_bytes_per_second / input_rate_floor.max(1e-8))
                .min(max_bytes_per_second * self.cfg.max_transactions_per_byte);
            if lim < limit {
                limit = lim;
                limit_reason = LimitReason::LogServerMvccWriteBandwidth;
                reason_id = Some(*id);
            }
        }

        if limit == f64::INFINITY {
            limit = self.cfg.default_limit_tps;
            limit_reason = LimitReason::Unlimited;
            reason_id = None;
        }

        debug!(tps_limit = limit, reason = %limit_reason, "rate updated");
        crate::metrics::TPS_LIMIT_GAUGE.set(limit);
        self.tps_limit = limit;
        self.limit_reason = limit_reason;
        self.reason_id = reason_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACTUAL_TPS: f64 = 1000.0;
    const TARGET_QUEUE_BYTES: i64 = 1_000_000_000;
    const SPRING_BYTES: i64 = 100_000_000;
    const TARGET_VERSION_DIFFERENCE: i64 = 2_000_000_000;
    const TOTAL_SPACE: i64 = 100_000_000_000;
    const INPUT_BYTES_PER_SECOND: f64 = 1e6;
    const MOCK_ITERATIONS: usize = 20_000;
    const MOCK_END: f64 = MOCK_ITERATIONS as f64 * 0.01;

    fn test_limits() -> RatekeeperLimits {
        RatekeeperLimits::new(
            TARGET_QUEUE_BYTES,
            SPRING_BYTES,
            TARGET_QUEUE_BYTES,
            SPRING_BYTES,
            TARGET_VERSION_DIFFERENCE as f64,
            TARGET_VERSION_DIFFERENCE as f64,
        )
    }

    struct TestEnv {
        tracker: MetricsTracker,
        updater: RateUpdater,
    }

    impl TestEnv {
        fn new(storage_team_size: usize) -> Self {
            let cfg = RatekeeperConfig::default();
            let tracker = MetricsTracker::new(&cfg);
            let mut updater = RateUpdater::new(cfg.clone(), test_limits(), storage_team_size);
            for _ in 0..=cfg.needed_tps_history_samples {
                updater.add_actual_tps(ACTUAL_TPS);
            }
            TestEnv { tracker, updater }
        }

        fn update(&mut self) {
            self.updater.update(&mut self.tracker, ACTUAL_TPS, MOCK_END);
        }
    }

    fn check_approximately_equal(a: f64, b: f64) {
        let error_bound = 0.2;
        assert!(
            !((a > b + 0.01 && a > b * (1.0 + error_bound))
                || (b > a + 0.01 && b > a * (1.0 + error_bound))),
            "{a} !~ {b}"
        );
    }

    /// Steps a mocked storage server's report stream the way a live
    /// cluster would: constant queue, constant input rate, versions
    /// advancing with durability keeping up.
    fn mock_storage_queue_info(
        zone: Option<&str>,
        storage_queue_bytes: i64,
        target_non_durable_versions_lag: i64,
        available_space: i64,
        total_space: i64,
    ) -> StorageQueueInfo {
        let cfg = RatekeeperConfig::default();
        let mut ss = StorageQueueInfo::new(ServerId::random(), zone.map(str::to_string), &cfg);
        let mut unused = Smoother::new(cfg.slow_smoothing_amount);
        let mut reply = StorageQueuingMetricsReply {
            instance_id: 0,
            bytes_input: storage_queue_bytes,
            bytes_durable: 0,
            storage_bytes: StorageBytes {
                total: total_space,
                available: available_space,
                free: available_space,
                used: total_space - available_space,
            },
            version: target_non_durable_versions_lag.max(
                (cfg.versions_per_second * (storage_queue_bytes as f64 / INPUT_BYTES_PER_SECOND))
                    as i64,
            ),
            durable_version: 0,
            cpu_usage: 0.0,
            disk_usage: 0.0,
        };
        let mut now = 0.0;
        ss.update(reply.clone(), &mut unused, now);
        let step = (INPUT_BYTES_PER_SECOND / 100.0) as i64;
        for _ in 0..MOCK_ITERATIONS {
            now += 0.01;
            reply.bytes_input += step;
            reply.bytes_durable += step;
            reply.version += 10_000;
            reply.durable_version += 10_000;
            ss.update(reply.clone(), &mut unused, now);
        }

        check_approximately_equal(ss.smooth_input_bytes_rate(now), INPUT_BYTES_PER_SECOND);
        check_approximately_equal(ss.very_smooth_durable_bytes_rate(now), INPUT_BYTES_PER_SECOND);
        check_approximately_equal(ss.storage_queue_bytes(now), storage_queue_bytes as f64);
        ss
    }

    fn mock_ss(zone: Option<&str>, storage_queue_bytes: i64) -> StorageQueueInfo {
        mock_storage_queue_info(zone, storage_queue_bytes, 5_000_000, TOTAL_SPACE, TOTAL_SPACE)
    }

    fn mock_tlog_queue_info(
        queue_bytes: i64,
        available_space: i64,
        total_space: i64,
        start_version: i64,
    ) -> TLogQueueInfo {
        let cfg = RatekeeperConfig::default();
        let mut tl = TLogQueueInfo::new(ServerId::random(), &cfg);
        let mut unused = Smoother::new(cfg.slow_smoothing_amount);
        let mut reply = TLogQueuingMetricsReply {
            instance_id: 0,
            bytes_input: queue_bytes,
            bytes_durable: 0,
            storage_bytes: StorageBytes {
                total: total_space,
                available: available_space,
                free: available_space,
                used: total_space - available_space,
            },
            version: start_version,
        };
        let mut now = 0.0;
        tl.update(reply.clone(), &mut unused, now);
        let step = (INPUT_BYTES_PER_SECOND / 100.0) as i64;
        for _ in 0..MOCK_ITERATIONS {
            now += 0.01;
            reply.bytes_input += step;
            reply.bytes_durable += step;
            reply.version += 1_000;
            tl.update(reply.clone(), &mut unused, now);
        }
        check_approximately_equal(tl.smooth_input_bytes_rate(now), INPUT_BYTES_PER_SECOND);
        tl
    }

    fn mock_tlog(queue_bytes: i64) -> TLogQueueInfo {
        mock_tlog_queue_info(queue_bytes, TOTAL_SPACE, TOTAL_SPACE, 0)
    }

    // No processes report metrics; the default limit applies.
    #[test]
    fn no_metrics_gives_default_limit() {
        let mut env = TestEnv::new(1);
        env.update();
        check_approximately_equal(
            env.updater.tps_limit(),
            RatekeeperConfig::default().default_limit_tps,
        );
        assert_eq!(env.updater.limit_reason(), LimitReason::Unlimited);
    }

    // 950MB of storage queue against a 1GB target with 100MB of
    // spring: the cluster can absorb double the current rate.
    #[test]
    fn high_storage_queue_doubles_the_rate() {
        let mut env = TestEnv::new(1);
        env.tracker
            .update_storage_queue_info(mock_ss(None, TARGET_QUEUE_BYTES - SPRING_BYTES / 2));
        env.update();
        assert_eq!(
            env.updater.limit_reason(),
            LimitReason::StorageServerWriteQueueSize
        );
        check_approximately_equal(env.updater.tps_limit(), 2.0 * ACTUAL_TPS);
    }

    // 1050MB of storage queue: 2/3 of the current rate.
    #[test]
    fn overfull_storage_queue_throttles_to_two_thirds() {
        let mut env = TestEnv::new(1);
        env.tracker
            .update_storage_queue_info(mock_ss(None, TARGET_QUEUE_BYTES + SPRING_BYTES / 2));
        env.update();
        assert_eq!(
            env.updater.limit_reason(),
            LimitReason::StorageServerWriteQueueSize
        );
        check_approximately_equal(env.updater.tps_limit(), ACTUAL_TPS * 2.0 / 3.0);
    }

    // Queue beyond target + spring: maximum storage-queue throttling,
    // half the current rate.
    #[test]
    fn saturated_storage_queue_halves_the_rate() {
        let mut env = TestEnv::new(1);
        env.tracker
            .update_storage_queue_info(mock_ss(None, TARGET_QUEUE_BYTES + 5 * SPRING_BYTES));
        env.update();
        assert_eq!(
            env.updater.limit_reason(),
            LimitReason::StorageServerWriteQueueSize
        );
        check_approximately_equal(env.updater.tps_limit(), ACTUAL_TPS / 2.0);
    }

    // Queue well below target: only the MVCC-window write bandwidth
    // bound applies, above the current rate.
    #[test]
    fn low_storage_queue_limits_on_mvcc_write_bandwidth() {
        let mut env = TestEnv::new(1);
        env.tracker
            .update_storage_queue_info(mock_ss(None, TARGET_QUEUE_BYTES - 5 * SPRING_BYTES));
        env.update();
        assert_eq!(
            env.updater.limit_reason(),
            LimitReason::StorageServerWriteBandwidthMvcc
        );
        assert!(env.updater.tps_limit() > ACTUAL_TPS);
    }

    // With two zones and tolerance for one machine falling behind, the
    // saturated zone is excused from the limit but still reported as
    // the reason.
    #[test]
    fn worst_zone_is_excused_but_reported() {
        let mut env = TestEnv::new(2);
        env.tracker.update_storage_queue_info(mock_ss(
            Some("zone1"),
            TARGET_QUEUE_BYTES - 5 * SPRING_BYTES,
        ));
        env.tracker.update_storage_queue_info(mock_ss(
            Some("zone2"),
            TARGET_QUEUE_BYTES + 5 * SPRING_BYTES,
        ));
        env.update();
        assert!(env.updater.tps_limit() > ACTUAL_TPS);
        assert_eq!(
            env.updater.limit_reason(),
            LimitReason::StorageServerWriteQueueSize
        );
    }

    // Durability lag beyond the configured target throttles on lag.
    #[test]
    fn high_durability_lag_throttles() {
        let mut env = TestEnv::new(1);
        env.tracker.update_storage_queue_info(mock_storage_queue_info(
            None,
            TARGET_QUEUE_BYTES - 5 * SPRING_BYTES,
            2 * TARGET_VERSION_DIFFERENCE,
            TOTAL_SPACE,
            TOTAL_SPACE,
        ));
        env.update();
        assert_eq!(
            env.updater.limit_reason(),
            LimitReason::StorageServerDurabilityLag
        );
    }

    // The server list could not be fetched at all.
    #[test]
    fn server_list_fetch_failure_throttles_to_zero() {
        let mut env = TestEnv::new(1);
        env.tracker.fail_ss_list_fetch();
        env.update();
        assert_eq!(
            env.updater.limit_reason(),
            LimitReason::StorageServerListFetchFailed
        );
        check_approximately_equal(env.updater.tps_limit(), 0.0);
    }

    #[test]
    fn storage_free_space_clamps_the_target() {
        let cfg = RatekeeperConfig::default();
        let total_space: i64 = 1_000_000_000;
        let queue = 3 * SPRING_BYTES;
        let available = cfg.min_available_space + queue;
        let mut env = TestEnv::new(1);
        env.tracker.update_storage_queue_info(mock_storage_queue_info(
            None,
            queue,
            5_000_000,
            available,
            total_space,
        ));
        env.update();
        assert_eq!(
            env.updater.limit_reason(),
            LimitReason::StorageServerMinFreeSpace
        );
        check_approximately_equal(env.updater.tps_limit(), ACTUAL_TPS);
    }

    #[test]
    fn storage_free_space_exhaustion_halves_the_rate() {
        let cfg = RatekeeperConfig::default();
        let total_space: i64 = 1_000_000_000;
        let available = cfg.min_available_space + 3 * SPRING_BYTES;
        let mut env = TestEnv::new(1);
        env.tracker.update_storage_queue_info(mock_storage_queue_info(
            None,
            6 * SPRING_BYTES,
            5_000_000,
            available,
            total_space,
        ));
        env.update();
        assert_eq!(
            env.updater.limit_reason(),
            LimitReason::StorageServerMinFreeSpace
        );
        check_approximately_equal(env.updater.tps_limit(), ACTUAL_TPS / 2.0);
    }

    #[test]
    fn storage_free_space_ratio_clamps_the_target() {
        let cfg = RatekeeperConfig::default();
        let total_space: i64 = 1_000_000_000_000_000;
        let queue = 3 * SPRING_BYTES;
        let available =
            (total_space as f64 * cfg.min_available_space_ratio) as i64 + queue;
        let mut env = TestEnv::new(1);
        env.tracker.update_storage_queue_info(mock_storage_queue_info(
            None,
            queue,
            5_000_000,
            available,
            total_space,
        ));
        env.update();
        assert_eq!(
            env.updater.limit_reason(),
            LimitReason::StorageServerMinFreeSpaceRatio
        );
        check_approximately_equal(env.updater.tps_limit(), ACTUAL_TPS);
    }

    #[test]
    fn storage_free_space_ratio_exhaustion_halves_the_rate() {
        let cfg = RatekeeperConfig::default();
        let total_space: i64 = 1_000_000_000_000_000;
        let available =
            (total_space as f64 * cfg.min_available_space_ratio) as i64 + 3 * SPRING_BYTES;
        let mut env = TestEnv::new(1);
        env.tracker.update_storage_queue_info(mock_storage_queue_info(
            None,
            6 * SPRING_BYTES,
            5_000_000,
            available,
            total_space,
        ));
        env.update();
        assert_eq!(
            env.updater.limit_reason(),
            LimitReason::StorageServerMinFreeSpaceRatio
        );
        check_approximately_equal(env.updater.tps_limit(), ACTUAL_TPS / 2.0);
    }

    #[test]
    fn high_tlog_queue_doubles_the_rate() {
        let mut env = TestEnv::new(1);
        env.tracker
            .update_tlog_queue_info(mock_tlog(TARGET_QUEUE_BYTES - SPRING_BYTES / 2));
        env.update();
        assert_eq!(env.updater.limit_reason(), LimitReason::LogServerWriteQueue);
        check_approximately_equal(env.updater.tps_limit(), 2.0 * ACTUAL_TPS);
    }

    #[test]
    fn overfull_tlog_queue_throttles_to_two_thirds() {
        let mut env = TestEnv::new(1);
        env.tracker
            .update_tlog_queue_info(mock_tlog(TARGET_QUEUE_BYTES + SPRING_BYTES / 2));
        env.update();
        assert_eq!(env.updater.limit_reason(), LimitReason::LogServerWriteQueue);
        check_approximately_equal(env.updater.tps_limit(), ACTUAL_TPS * 2.0 / 3.0);
    }

    #[test]
    fn saturated_tlog_queue_halves_the_rate() {
        let mut env = TestEnv::new(1);
        env.tracker.update_tlog_queue_info(mock_tlog(1_500_000_000));
        env.update();
        assert_eq!(env.updater.limit_reason(), LimitReason::LogServerWriteQueue);
        check_approximately_equal(env.updater.tps_limit(), ACTUAL_TPS / 2.0);
    }

    #[test]
    fn low_tlog_queue_limits_on_mvcc_write_bandwidth() {
        let mut env = TestEnv::new(1);
        env.tracker
            .update_tlog_queue_info(mock_tlog(TARGET_QUEUE_BYTES - 5 * SPRING_BYTES));
        env.update();
        assert_eq!(
            env.updater.limit_reason(),
            LimitReason::LogServerMvccWriteBandwidth
        );
        assert!(env.updater.tps_limit() > ACTUAL_TPS);
    }

    #[test]
    fn tlog_free_space_clamps_the_target() {
        let cfg = RatekeeperConfig::default();
        let total_space: i64 = 1_000_000_000;
        let queue = 3 * SPRING_BYTES;
        let available = cfg.min_available_space + queue;
        let mut env = TestEnv::new(1);
        env.tracker
            .update_tlog_queue_info(mock_tlog_queue_info(queue, available, total_space, 0));
        env.update();
        assert_eq!(
            env.updater.limit_reason(),
            LimitReason::LogServerMinFreeSpace
        );
        check_approximately_equal(env.updater.tps_limit(), ACTUAL_TPS);
    }

    #[test]
    fn tlog_without_drain_headroom_throttles_to_zero() {
        let cfg = RatekeeperConfig::default();
        let total_space: i64 = 1_000_000_000;
        let available = cfg.min_available_space + 3 * SPRING_BYTES;
        let mut env = TestEnv::new(1);
        env.tracker.update_tlog_queue_info(mock_tlog_queue_info(
            6 * SPRING_BYTES,
            available,
            total_space,
            0,
        ));
        env.update();
        assert_eq!(
            env.updater.limit_reason(),
            LimitReason::LogServerMinFreeSpace
        );
        check_approximately_equal(env.updater.tps_limit(), 0.0);
    }

    #[test]
    fn tlog_free_space_ratio_clamps_the_target() {
        let cfg = RatekeeperConfig::default();
        let total_space: i64 = 1_000_000_000_000_000;
        let queue = 3 * SPRING_BYTES;
        let available =
            (total_space as f64 * cfg.min_available_space_ratio) as i64 + queue;
        let mut env = TestEnv::new(1);
        env.tracker
            .update_tlog_queue_info(mock_tlog_queue_info(queue, available, total_space, 0));
        env.update();
        assert_eq!(
            env.updater.limit_reason(),
            LimitReason::LogServerMinFreeSpaceRatio
        );
        check_approximately_equal(env.updater.tps_limit(), ACTUAL_TPS);
    }

    #[test]
    fn tlog_free_space_ratio_exhaustion_halves_the_rate() {
        let cfg = RatekeeperConfig::default();
        let total_space: i64 = 1_000_000_000_000_000;
        let available =
            (total_space as f64 * cfg.min_available_space_ratio) as i64 + 3 * SPRING_BYTES;
        let mut env = TestEnv::new(1);
        env.tracker.update_tlog_queue_info(mock_tlog_queue_info(
            6 * SPRING_BYTES,
            available,
            total_space,
            0,
        ));
        env.update();
        assert_eq!(
            env.updater.limit_reason(),
            LimitReason::LogServerMinFreeSpaceRatio
        );
        check_approximately_equal(env.updater.tps_limit(), ACTUAL_TPS / 2.0);
    }

    // The log pipeline is far ahead of the readable storage frontier.
    #[test]
    fn readable_behind_throttles_below_actual() {
        let mut env = TestEnv::new(1);
        env.tracker
            .update_storage_queue_info(mock_ss(None, TARGET_QUEUE_BYTES - 5 * SPRING_BYTES));
        env.tracker.update_tlog_queue_info(mock_tlog_queue_info(
            TARGET_QUEUE_BYTES - 5 * SPRING_BYTES,
            TOTAL_SPACE,
            TOTAL_SPACE,
            2 * TARGET_VERSION_DIFFERENCE,
        ));
        env.update();
        assert_eq!(
            env.updater.limit_reason(),
            LimitReason::StorageServerReadableBehind
        );
        assert!(env.updater.tps_limit() < ACTUAL_TPS);
    }

    #[test]
    fn limit_reasons_render_snake_case() {
        assert_eq!(LimitReason::Unlimited.to_string(), "unlimited");
        assert_eq!(
            LimitReason::StorageServerWriteQueueSize.to_string(),
            "storage_server_write_queue_size"
        );
        assert_eq!(
            LimitReason::LogServerMvccWriteBandwidth.to_string(),
            "log_server_mvcc_write_bandwidth"
        );
    }
}
