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

//! The data distribution control plane of a distributed, replicated
//! key-value store: shard-to-team bookkeeping, relocation scheduling,
//! storage wiggling and the global transaction-rate ceiling.

mod error;
pub use error::{Error, Result};

mod config;
pub use config::{
    Config, DistributorConfig, PhysicalShardConfig, Priorities, RatekeeperConfig,
    RelocationParallelism, ShardTrackerConfig, TeamSelectionConfig, WiggleConfig,
};

pub mod keyspace;
pub mod types;

pub mod meta;
pub mod movekeys;

pub mod registry;

pub mod physical;

pub mod team;

pub mod monitor;

pub mod tracker;

pub mod queue;

pub mod wiggler;

pub mod ratekeeper;

mod metrics;

mod distributor;
pub use distributor::{DataDistributor, DistributorInterface, WiggleUpdate};
