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

//! The move-keys collaborator: executes a single "move this key range
//! from team A to team B" transaction atomically against the cluster
//! metadata store. The protocol and its persisted schema live outside
//! this crate; the control plane drives it through [`MoveKeys`].

use std::fmt;

use async_trait::async_trait;
use uuid::Uuid;

use crate::{keyspace::KeyRange, types::ServerId, Result};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MoveId(pub Uuid);

impl MoveId {
    pub fn random() -> Self {
        MoveId(Uuid::new_v4())
    }
}

impl fmt::Debug for MoveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0.simple().to_string();
        write!(f, "mv-{}", &s[..8.min(s.len())])
    }
}

impl fmt::Display for MoveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataMovePhase {
    Prepare,
    Running,
    Deleting,
    Done,
}

/// The in-flight state of a single relocation, as persisted by the
/// move-keys collaborator.
#[derive(Clone, Debug)]
pub struct DataMove {
    pub id: MoveId,
    pub range: KeyRange,
    pub phase: DataMovePhase,
    pub primary_src: Vec<ServerId>,
    pub remote_src: Vec<ServerId>,
    pub primary_dest: Vec<ServerId>,
    pub remote_dest: Vec<ServerId>,
    pub valid: bool,
    pub cancelled: bool,
}

impl DataMove {
    pub fn new(id: MoveId, range: KeyRange, phase: DataMovePhase) -> Self {
        DataMove {
            id,
            range,
            phase,
            primary_src: Vec::new(),
            remote_src: Vec::new(),
            primary_dest: Vec::new(),
            remote_dest: Vec::new(),
            valid: true,
            cancelled: phase == DataMovePhase::Deleting,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

#[async_trait]
pub trait MoveKeys: Send + Sync {
    /// Persists the move with phase `Prepare`. Fails with
    /// [`crate::Error::MoveKeysConflict`] when an intersecting move is
    /// already recorded.
    async fn start_move(&self, mv: &DataMove) -> Result<()>;

    /// Transitions `Prepare -> Running -> Done`, copying the key range
    /// from sources to destinations.
    async fn commit_move(&self, id: MoveId) -> Result<()>;

    /// Transitions to `Deleting`; a later distributor restart resumes
    /// the cleanup.
    async fn cancel_move(&self, id: MoveId) -> Result<()>;
}

#[cfg(test)]
pub mod testing {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    use super::*;
    use crate::Error;

    /// In-memory move-keys double with injectable failures.
    #[derive(Default)]
    pub struct MemMoveKeys {
        inner: Mutex<HashMap<MoveId, DataMove>>,
        /// Number of leading `start_move` calls to fail with a conflict.
        pub conflicts_to_inject: AtomicUsize,
        /// Number of leading `commit_move` calls to fail transiently.
        pub transients_to_inject: AtomicUsize,
    }

    impl MemMoveKeys {
        pub fn moves(&self) -> Vec<DataMove> {
            self.inner.lock().unwrap().values().cloned().collect()
        }

        pub fn phase_of(&self, id: MoveId) -> Option<DataMovePhase> {
            self.inner.lock().unwrap().get(&id).map(|m| m.phase)
        }

        fn take_injected(counter: &AtomicUsize) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait]
    impl MoveKeys for MemMoveKeys {
        async fn start_move(&self, mv: &DataMove) -> Result<()> {
            if Self::take_injected(&self.conflicts_to_inject) {
                return Err(Error::MoveKeysConflict(mv.range.to_string()));
            }
            let mut inner = self.inner.lock().unwrap();
            let conflict = inner.values().any(|m| {
                m.range.intersects(&mv.range)
                    && m.phase != DataMovePhase::Done
                    && m.phase != DataMovePhase::Deleting
            });
            if conflict {
                return Err(Error::MoveKeysConflict(mv.range.to_string()));
            }
            inner.insert(mv.id, mv.clone());
            Ok(())
        }

        async fn commit_move(&self, id: MoveId) -> Result<()> {
            if Self::take_injected(&self.transients_to_inject) {
                return Err(Error::TransientStore("injected".to_string()));
            }
            let mut inner = self.inner.lock().unwrap();
            let mv = inner
                .get_mut(&id)
                .ok_or_else(|| Error::InvalidArgument(format!("unknown move {id}")))?;
            mv.phase = DataMovePhase::Done;
            Ok(())
        }

        async fn cancel_move(&self, id: MoveId) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            if let Some(mv) = inner.get_mut(&id) {
                mv.phase = DataMovePhase::Deleting;
                mv.cancelled = true;
            }
            Ok(())
        }
    }
}
