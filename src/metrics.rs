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

use lazy_static::lazy_static;
use prometheus::*;

// relocation queue

lazy_static! {
    pub static ref RELOCATIONS_QUEUED: IntCounter = register_int_counter!(
        "data_distribution_relocations_queued_total",
        "relocations accepted into the queue"
    )
    .unwrap();
    pub static ref RELOCATIONS_IN_FLIGHT: IntGauge = register_int_gauge!(
        "data_distribution_relocations_in_flight",
        "relocations currently executing"
    )
    .unwrap();
    pub static ref RELOCATIONS_FINISHED_TOTAL: IntCounter = register_int_counter!(
        "data_distribution_relocations_finished_total",
        "relocations that committed their move"
    )
    .unwrap();
    pub static ref RELOCATIONS_ERRORS_TOTAL: IntCounter = register_int_counter!(
        "data_distribution_relocations_errors_total",
        "relocations abandoned after exhausting retries"
    )
    .unwrap();
}

// shard tracker

lazy_static! {
    pub static ref SHARD_SPLITS_TOTAL: IntCounter = register_int_counter!(
        "data_distribution_shard_splits_total",
        "shards split after crossing the size ceiling"
    )
    .unwrap();
    pub static ref SHARD_MERGES_TOTAL: IntCounter = register_int_counter!(
        "data_distribution_shard_merges_total",
        "shard merges proposed for small cold neighbors"
    )
    .unwrap();
}

// storage wiggle

lazy_static! {
    pub static ref WIGGLE_ROUNDS_FINISHED_TOTAL: IntCounter = register_int_counter!(
        "storage_wiggle_rounds_finished_total",
        "completed perpetual storage wiggle rounds"
    )
    .unwrap();
}

// rate keeper

lazy_static! {
    pub static ref TPS_LIMIT_GAUGE: Gauge = register_gauge!(
        "ratekeeper_tps_limit",
        "current global transaction rate ceiling"
    )
    .unwrap();
}
