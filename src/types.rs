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

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{keyspace::KeyRange, movekeys::DataMove};

/// Opaque 128-bit identity of a storage process.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerId(pub Uuid);

impl ServerId {
    pub fn random() -> Self {
        ServerId(Uuid::new_v4())
    }
}

impl fmt::Debug for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // short form, enough to correlate log lines
        let s = self.0.simple().to_string();
        write!(f, "{}", &s[..8.min(s.len())])
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// An ordered, deduplicated replica set plus the region flag.
///
/// Teams compare lexicographically on their members, primary last, so
/// they can key ordered maps and the registry's inverse index.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Team {
    servers: Vec<ServerId>,
    pub primary: bool,
}

impl Team {
    pub fn new(mut servers: Vec<ServerId>, primary: bool) -> Self {
        servers.sort();
        servers.dedup();
        Team { servers, primary }
    }

    pub fn servers(&self) -> &[ServerId] {
        &self.servers
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn contains(&self, id: &ServerId) -> bool {
        self.servers.binary_search(id).is_ok()
    }
}

impl PartialOrd for Team {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Team {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.servers
            .cmp(&other.servers)
            .then(self.primary.cmp(&other.primary))
    }
}

impl fmt::Debug for Team {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}{}", self.servers, if self.primary { "p" } else { "r" })
    }
}

/// Aggregate load figures for a key range or physical shard.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageMetrics {
    pub bytes: i64,
    pub bytes_written_per_ksec: i64,
    pub bytes_read_per_ksec: i64,
}

impl StorageMetrics {
    pub const INFINITY: i64 = i64::MAX;

    pub fn with_bytes(bytes: i64) -> Self {
        StorageMetrics {
            bytes,
            ..Default::default()
        }
    }

    pub fn saturating_add(&self, rhs: &StorageMetrics) -> StorageMetrics {
        StorageMetrics {
            bytes: self.bytes.saturating_add(rhs.bytes),
            bytes_written_per_ksec: self
                .bytes_written_per_ksec
                .saturating_add(rhs.bytes_written_per_ksec),
            bytes_read_per_ksec: self
                .bytes_read_per_ksec
                .saturating_add(rhs.bytes_read_per_ksec),
        }
    }

    pub fn saturating_sub(&self, rhs: &StorageMetrics) -> StorageMetrics {
        StorageMetrics {
            bytes: (self.bytes - rhs.bytes).max(0),
            bytes_written_per_ksec: (self.bytes_written_per_ksec - rhs.bytes_written_per_ksec)
                .max(0),
            bytes_read_per_ksec: (self.bytes_read_per_ksec - rhs.bytes_read_per_ksec).max(0),
        }
    }
}

/// Published by the tracker for every shard it watches.
#[derive(Clone, Debug, PartialEq)]
pub struct ShardMetrics {
    pub metrics: StorageMetrics,
    pub last_low_bandwidth_start_time: f64,
    /// Number of smaller shards whose metrics are aggregated here.
    pub shard_count: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocateReason {
    Other,
    RebalanceDisk,
    RebalanceRead,
    RebalancePhysShard,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataMoveType {
    PhysicalShardMove,
    ReadRangeMove,
}

/// A unit of relocation work. Priority is a global integer; higher runs
/// first.
#[derive(Clone, Debug)]
pub struct RelocateShard {
    pub range: KeyRange,
    pub priority: i32,
    pub reason: RelocateReason,
    pub data_move: Option<Arc<DataMove>>,
    pub cancelled: bool,
}

impl RelocateShard {
    pub fn new(range: KeyRange, priority: i32, reason: RelocateReason) -> Self {
        RelocateShard {
            range,
            priority,
            reason,
            data_move: None,
            cancelled: false,
        }
    }

    pub fn restore(range: KeyRange, priority: i32, data_move: Arc<DataMove>) -> Self {
        RelocateShard {
            range,
            priority,
            reason: RelocateReason::Other,
            data_move: Some(data_move),
            cancelled: false,
        }
    }

    pub fn is_restore(&self) -> bool {
        self.data_move.is_some()
    }
}
