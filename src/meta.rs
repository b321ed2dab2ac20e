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

//! The cluster metadata store collaborator: a linearizable key-value
//! store where the control plane persists its small records and reads
//! the server list and the startup snapshot.

use std::{collections::BTreeSet, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;

use crate::{
    keyspace::Key,
    movekeys::{DataMove, MoveId},
    types::ServerId,
    DistributorConfig, Error, Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessClass {
    Storage,
    Log,
    Stateless,
    Unset,
}

/// One row of the startup shard snapshot: the shard starting at `key`
/// and running to the next row's key.
#[derive(Clone, Debug)]
pub struct DdShardInfo {
    pub key: Key,
    pub primary_src: Vec<ServerId>,
    pub remote_src: Vec<ServerId>,
    pub primary_dest: Vec<ServerId>,
    pub remote_dest: Vec<ServerId>,
    pub has_dest: bool,
    pub src_id: Option<MoveId>,
    pub dest_id: Option<MoveId>,
}

impl DdShardInfo {
    pub fn new(key: Key) -> Self {
        DdShardInfo {
            key,
            primary_src: Vec::new(),
            remote_src: Vec::new(),
            primary_dest: Vec::new(),
            remote_dest: Vec::new(),
            has_dest: false,
            src_id: None,
            dest_id: None,
        }
    }
}

/// Everything the distributor reads before it starts making decisions.
#[derive(Clone, Debug, Default)]
pub struct InitialDataDistribution {
    pub mode: i32,
    pub all_servers: Vec<(ServerId, ProcessClass)>,
    pub primary_teams: BTreeSet<Vec<ServerId>>,
    pub remote_teams: BTreeSet<Vec<ServerId>>,
    pub shards: Vec<DdShardInfo>,
    /// Unfinished moves found in the store; resumed on startup.
    pub data_moves: Vec<DataMove>,
}

impl Default for ProcessClass {
    fn default() -> Self {
        ProcessClass::Unset
    }
}

#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    async fn set(&self, key: &[u8], value: Bytes) -> Result<()>;

    async fn clear(&self, key: &[u8]) -> Result<()>;

    async fn server_list(&self) -> Result<Vec<(ServerId, ProcessClass)>>;

    async fn initial_distribution(&self) -> Result<InitialDataDistribution>;
}

/// Exponential backoff with full jitter, shared by metadata
/// transactions and relocation retries.
pub struct Backoff {
    next_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    attempts_left: usize,
}

impl Backoff {
    pub fn new(cfg: &DistributorConfig) -> Self {
        Backoff {
            next_delay: Duration::from_millis(cfg.retry_base_delay_ms),
            max_delay: Duration::from_millis(cfg.retry_max_delay_ms),
            multiplier: cfg.retry_multiplier,
            attempts_left: cfg.retry_limit,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.attempts_left == 0
    }

    /// Sleeps for the jittered current delay, then grows it.
    pub async fn delay(&mut self) {
        self.attempts_left = self.attempts_left.saturating_sub(1);
        let jittered = self.next_delay.mul_f64(rand::thread_rng().gen_range(0.5..1.0));
        tokio::time::sleep(jittered).await;
        self.next_delay = self
            .next_delay
            .mul_f64(self.multiplier)
            .min(self.max_delay);
    }
}

/// Runs one metadata-store operation under the configured soft deadline,
/// retrying transient failures and timeouts with backoff until the retry
/// budget runs out.
pub async fn run_meta_transaction<T, F, Fut>(cfg: &DistributorConfig, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let deadline = Duration::from_millis(cfg.meta_transaction_deadline_ms);
    let mut backoff = Backoff::new(cfg);
    loop {
        let attempt = tokio::time::timeout(deadline, op()).await;
        let err = match attempt {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if matches!(e, Error::TransientStore(_)) => e,
            Ok(Err(e)) => return Err(e),
            Err(_) => Error::DeadlineExceeded("meta transaction"),
        };
        if backoff.exhausted() {
            return Err(err);
        }
        tracing::debug!(error = %err, "retrying meta transaction");
        backoff.delay().await;
    }
}
