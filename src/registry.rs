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

//! The authoritative in-memory mapping between key ranges and the teams
//! that replicate them.
//!
//! Shard boundaries here reflect queued relocations, not the status quo
//! on the storage servers, so that failure responses never revert a
//! split or merge: `define_shard` changes boundaries and never team
//! assignments, `move_shard` changes assignments and never boundaries.

use std::collections::{BTreeSet, HashMap};

use tokio::sync::mpsc;

use crate::{
    keyspace::{KeyRange, RangeMap},
    types::{ServerId, Team},
};

/// Per-entry team assignment: `dest` holds the current owners, or the
/// destination of an in-flight move; `prev_src` holds any prior sources
/// of an in-flight move and is empty when the shard is stable.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TeamSets {
    pub dest: Vec<Team>,
    pub prev_src: Vec<Team>,
}

fn uniquify(teams: &mut Vec<Team>) {
    teams.sort();
    teams.dedup();
}

pub struct ShardTeamRegistry {
    shard_teams: RangeMap<TeamSets>,
    /// Inverse index, ordered by team then range begin. Carries every
    /// team present in an entry's `dest`, plus prior dests while a move
    /// is in flight.
    team_shards: BTreeSet<(Team, KeyRange)>,
    server_shards: HashMap<ServerId, usize>,
    restart_tx: mpsc::UnboundedSender<KeyRange>,
}

impl ShardTeamRegistry {
    /// Returns the registry and the stream of ranges whose shard
    /// trackers must restart after a boundary change.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<KeyRange>) {
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();
        let registry = ShardTeamRegistry {
            shard_teams: RangeMap::new(TeamSets::default()),
            team_shards: BTreeSet::new(),
            server_shards: HashMap::new(),
            restart_tx,
        };
        (registry, restart_rx)
    }

    fn index_insert(&mut self, team: &Team, range: &KeyRange) {
        if self.team_shards.insert((team.clone(), range.clone())) {
            for id in team.servers() {
                *self.server_shards.entry(*id).or_default() += 1;
            }
        }
    }

    fn index_erase(&mut self, team: &Team, range: &KeyRange) {
        if self.team_shards.remove(&(team.clone(), range.clone())) {
            for id in team.servers() {
                if let Some(count) = self.server_shards.get_mut(id) {
                    *count -= 1;
                    if *count == 0 {
                        self.server_shards.remove(id);
                    }
                }
            }
        }
    }

    /// Splits the interval map at `range.begin` and `range.end` so that
    /// `range` becomes a union of whole entries; team sets on the new
    /// sub-entries are copies of what covered each sub-interval, and the
    /// inverse index is rewritten to the new granularity. Idempotent on
    /// an already-aligned range. Signals the shard tracker.
    pub fn define_shard(&mut self, range: &KeyRange) {
        if range.is_empty() {
            return;
        }

        let affected: Vec<(KeyRange, TeamSets)> = self
            .shard_teams
            .intersecting(range)
            .into_iter()
            .map(|(r, v)| (r, v.clone()))
            .collect();

        let mut split_any = false;
        for (r, sets) in &affected {
            let splits = (r.begin < range.begin && range.begin < r.end)
                || (r.begin < range.end && range.end < r.end);
            if !splits {
                continue;
            }
            split_any = true;
            for team in sets.dest.iter().chain(sets.prev_src.iter()) {
                self.index_erase(team, r);
            }
            self.shard_teams.split_at(&range.begin);
            self.shard_teams.split_at(&range.end);
            let pieces = self.shard_teams.intersecting_ranges(r);
            for piece in pieces {
                for team in sets.dest.iter().chain(sets.prev_src.iter()) {
                    self.index_insert(team, &piece);
                }
            }
        }

        // The tracker re-attaches its watchers only when a boundary
        // actually moved; an aligned re-define stays silent.
        if split_any {
            let _ = self.restart_tx.send(range.clone());
        }

        #[cfg(debug_assertions)]
        self.check();
    }

    /// Replaces `dest` with `dest_teams` on every entry in `range`,
    /// pushing the old dests into `prev_src`. Requires `range` to be a
    /// union of whole entries (i.e. `define_shard(range)` has run).
    /// Never changes shard boundaries.
    pub fn move_shard(&mut self, range: &KeyRange, dest_teams: Vec<Team>) {
        if range.is_empty() {
            return;
        }
        let mut dests = dest_teams;
        uniquify(&mut dests);

        let entries: Vec<(KeyRange, TeamSets)> = self
            .shard_teams
            .intersecting(range)
            .into_iter()
            .map(|(r, v)| (r, v.clone()))
            .collect();

        for (r, sets) in &entries {
            debug_assert!(
                range.contains_range(r),
                "move_shard without a preceding define_shard: {r} vs {range}"
            );
            // Prior dests stay indexed while the move is in flight; new
            // dests become visible to team-failure lookups immediately.
            for team in &sets.dest {
                self.index_insert(team, r);
            }
            for team in &dests {
                self.index_insert(team, r);
            }
        }

        self.shard_teams.update_intersecting(range, |_, sets| {
            let mut prev = std::mem::take(&mut sets.prev_src);
            prev.append(&mut sets.dest);
            uniquify(&mut prev);
            sets.prev_src = prev;
            sets.dest = dests.clone();
        });

        #[cfg(debug_assertions)]
        self.check();
    }

    /// Clears `prev_src` on every entry in `range`, prunes the inverse
    /// index of teams left in neither `dest` nor an overlapping
    /// `prev_src`, and merges adjacent entries that ended up equal.
    pub fn finish_move(&mut self, range: &KeyRange) {
        if range.is_empty() {
            return;
        }

        let entries: Vec<(KeyRange, TeamSets)> = self
            .shard_teams
            .intersecting(range)
            .into_iter()
            .filter(|(r, _)| range.contains_range(r))
            .map(|(r, v)| (r, v.clone()))
            .collect();

        for (r, sets) in &entries {
            for team in &sets.prev_src {
                if !sets.dest.contains(team) {
                    self.index_erase(team, r);
                }
            }
            self.shard_teams
                .update_intersecting(r, |_, sets| sets.prev_src.clear());
        }

        self.coalesce_finished(range);

        #[cfg(debug_assertions)]
        self.check();
    }

    /// Merges adjacent equal entries fully inside `range`, rewriting
    /// the inverse index to the merged granularity.
    fn coalesce_finished(&mut self, range: &KeyRange) {
        let entries: Vec<(KeyRange, TeamSets)> = self
            .shard_teams
            .intersecting(range)
            .into_iter()
            .filter(|(r, _)| range.contains_range(r))
            .map(|(r, v)| (r, v.clone()))
            .collect();

        let mut runs: Vec<(KeyRange, TeamSets, Vec<KeyRange>)> = Vec::new();
        for (r, sets) in entries {
            match runs.last_mut() {
                Some((run, run_sets, pieces))
                    if run.end == r.begin && *run_sets == sets =>
                {
                    run.end = r.end.clone();
                    pieces.push(r);
                }
                _ => runs.push((r.clone(), sets, vec![r])),
            }
        }

        for (run, sets, pieces) in runs {
            if pieces.len() < 2 {
                continue;
            }
            for piece in &pieces {
                for team in sets.dest.iter().chain(sets.prev_src.iter()) {
                    self.index_erase(team, piece);
                }
            }
            self.shard_teams.insert(&run, sets.clone());
            for team in sets.dest.iter().chain(sets.prev_src.iter()) {
                self.index_insert(team, &run);
            }
        }
    }

    /// Current dests and all prior sources, unioned across the entries
    /// intersecting `range`.
    pub fn get_teams_for(&self, range: &KeyRange) -> (Vec<Team>, Vec<Team>) {
        let mut dests = Vec::new();
        let mut prev = Vec::new();
        for (_, sets) in self.shard_teams.intersecting(range) {
            dests.extend(sets.dest.iter().cloned());
            prev.extend(sets.prev_src.iter().cloned());
        }
        uniquify(&mut dests);
        uniquify(&mut prev);
        (dests, prev)
    }

    pub fn get_shards_for(&self, team: &Team) -> Vec<KeyRange> {
        let low = (team.clone(), KeyRange::default());
        self.team_shards
            .range(&low..)
            .take_while(|(t, _)| t == team)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn has_shards(&self, team: &Team) -> bool {
        let low = (team.clone(), KeyRange::default());
        self.team_shards
            .range(&low..)
            .next()
            .map(|(t, _)| t == team)
            .unwrap_or(false)
    }

    pub fn get_number_of_shards(&self, id: &ServerId) -> usize {
        self.server_shards.get(id).copied().unwrap_or(0)
    }

    /// Teams in the inverse index whose membership includes `id`.
    pub fn get_teams_for_server(&self, id: &ServerId) -> Vec<Team> {
        let mut teams: Vec<Team> = self
            .team_shards
            .iter()
            .map(|(team, _)| team)
            .filter(|team| team.contains(id))
            .cloned()
            .collect();
        teams.dedup();
        teams
    }

    /// Entry ranges currently covering `range`; the tracker uses this to
    /// re-attach one watcher per shard after a boundary change.
    pub fn entry_ranges(&self, range: &KeyRange) -> Vec<KeyRange> {
        self.shard_teams.intersecting_ranges(range)
    }

    /// Self-audit of the registry invariants. A violation means the
    /// in-memory shard map can no longer be trusted and it is unsafe to
    /// keep distributing data, so this panics.
    pub fn check(&self) {
        // Coverage: entries tile the whole key space.
        let mut expected_begin = crate::keyspace::Key::new();
        for (r, sets) in self.shard_teams.iter() {
            assert_eq!(
                r.begin, expected_begin,
                "shard map has a coverage gap at {r}"
            );
            expected_begin = r.end.clone();

            let mut sorted = sets.dest.clone();
            uniquify(&mut sorted);
            assert_eq!(sorted, sets.dest, "dest teams not sorted at {r}");
            let mut sorted = sets.prev_src.clone();
            uniquify(&mut sorted);
            assert_eq!(sorted, sets.prev_src, "prev_src teams not sorted at {r}");

            // Every dest team is indexed for exactly this entry.
            for team in &sets.dest {
                assert!(
                    self.team_shards.contains(&(team.clone(), r.clone())),
                    "team {team:?} missing from inverse index for {r}"
                );
            }
        }
        assert_eq!(
            expected_begin,
            crate::keyspace::max_key(),
            "shard map does not reach the end of the key space"
        );

        // Every index pair points at a whole entry that still knows the
        // team.
        let mut recount: HashMap<ServerId, usize> = HashMap::new();
        for (team, r) in &self.team_shards {
            let (entry, sets) = self.shard_teams.range_containing(&r.begin);
            assert_eq!(
                entry, *r,
                "inverse index range {r} is not a whole entry (entry {entry})"
            );
            assert!(
                sets.dest.contains(team) || sets.prev_src.contains(team),
                "inverse index team {team:?} unknown to entry {r}"
            );
            for id in team.servers() {
                *recount.entry(*id).or_default() += 1;
            }
        }
        assert_eq!(
            recount, self.server_shards,
            "per-server shard counters drifted"
        );
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::keyspace::Key;

    fn key(s: &str) -> Key {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn range(b: &str, e: &str) -> KeyRange {
        KeyRange::new(key(b), key(e))
    }

    fn team(ids: &[ServerId], primary: bool) -> Team {
        Team::new(ids.to_vec(), primary)
    }

    #[test]
    fn define_is_idempotent() {
        let (mut reg, _rx) = ShardTeamRegistry::new();
        reg.define_shard(&range("b", "m"));
        let before = reg.entry_ranges(&KeyRange::all());
        reg.define_shard(&range("b", "m"));
        assert_eq!(before, reg.entry_ranges(&KeyRange::all()));
        reg.check();
    }

    #[test]
    fn move_then_finish_leaves_clean_state() {
        let ids: Vec<ServerId> = (0..4).map(|_| ServerId::random()).collect();
        let old = team(&ids[..2], true);
        let new = team(&ids[2..], true);

        let (mut reg, _rx) = ShardTeamRegistry::new();
        let r = range("b", "m");
        reg.define_shard(&r);
        reg.move_shard(&r, vec![old.clone()]);
        reg.finish_move(&r);

        reg.define_shard(&r);
        reg.move_shard(&r, vec![new.clone()]);

        // While in flight, both teams are visible.
        let (dests, prev) = reg.get_teams_for(&r);
        assert_eq!(dests, vec![new.clone()]);
        assert_eq!(prev, vec![old.clone()]);
        assert!(!reg.get_shards_for(&old).is_empty());

        reg.finish_move(&r);
        let (dests, prev) = reg.get_teams_for(&r);
        assert_eq!(dests, vec![new.clone()]);
        assert!(prev.is_empty());
        assert!(reg.get_shards_for(&old).is_empty());
        for id in old.servers() {
            assert_eq!(reg.get_number_of_shards(id), 0);
        }
        for id in new.servers() {
            assert_eq!(reg.get_number_of_shards(id), 1);
        }
    }

    #[test]
    fn split_preserves_assignments() {
        let ids: Vec<ServerId> = (0..2).map(|_| ServerId::random()).collect();
        let t = team(&ids, true);

        let (mut reg, mut rx) = ShardTeamRegistry::new();
        let r = range("b", "m");
        reg.define_shard(&r);
        reg.move_shard(&r, vec![t.clone()]);
        reg.finish_move(&r);

        reg.define_shard(&range("b", "g"));
        let (dests, _) = reg.get_teams_for(&range("b", "g"));
        assert_eq!(dests, vec![t.clone()]);
        let (dests, _) = reg.get_teams_for(&range("g", "m"));
        assert_eq!(dests, vec![t.clone()]);

        // restart notifications flowed for both defines
        assert_eq!(rx.try_recv().unwrap(), r);
        assert_eq!(rx.try_recv().unwrap(), range("b", "g"));
    }

    #[test]
    fn inverse_index_agrees_with_forward_map() {
        let ids: Vec<ServerId> = (0..6).map(|_| ServerId::random()).collect();
        let t1 = team(&ids[..3], true);
        let t2 = team(&ids[3..], true);

        let (mut reg, _rx) = ShardTeamRegistry::new();
        for (r, t) in [(range("a", "f"), &t1), (range("f", "p"), &t2)] {
            reg.define_shard(&r);
            reg.move_shard(&r, vec![t.clone()]);
            reg.finish_move(&r);
        }

        for t in [&t1, &t2] {
            for r in reg.get_shards_for(t) {
                let (dests, _) = reg.get_teams_for(&r);
                assert!(dests.contains(t));
            }
        }
    }

    // Randomized define/move/finish sequences over a small key
    // dictionary; the audit runs after every operation.
    #[test]
    fn randomized_operations_keep_invariants() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let dict: Vec<Key> = (0u8..32)
            .map(|i| Bytes::copy_from_slice(format!("{i:02}").as_bytes()))
            .collect();
        let servers: Vec<ServerId> = (0..10).map(|_| ServerId::random()).collect();

        let (mut reg, _rx) = ShardTeamRegistry::new();
        let mut defined: Vec<KeyRange> = Vec::new();

        for _ in 0..500 {
            let a = rng.gen_range(0..dict.len());
            let b = rng.gen_range(0..dict.len());
            if a == b {
                continue;
            }
            let (lo, hi) = (a.min(b), a.max(b));
            let r = KeyRange::new(dict[lo].clone(), dict[hi].clone());

            match rng.gen_range(0..3) {
                0 => {
                    reg.define_shard(&r);
                    defined.push(r);
                }
                1 => {
                    let start = rng.gen_range(0..servers.len());
                    let len = rng.gen_range(1..=3.min(servers.len() - start));
                    let t = team(&servers[start..start + len], rng.gen_bool(0.5));
                    reg.define_shard(&r);
                    reg.move_shard(&r, vec![t]);
                }
                _ => {
                    if let Some(r) = defined.last().cloned() {
                        reg.finish_move(&r);
                    }
                }
            }
            reg.check();
        }
    }
}
