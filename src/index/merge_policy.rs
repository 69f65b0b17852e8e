//! When to merge which barrels
//!
//! One `MergePolicy` serves every strategy. Each strategy only decides which
//! queue a barrel joins and when a queue is due:
//!
//! - **Tiered**: queue = size level, due at `collision_factor` barrels
//! - **LogStructured**: queue = generation, due at `max_layer_size` barrels
//! - **Partitioned**: queue = partition, due once it holds more than `capacity`
//! - **Unconditional**: a single queue, merged eagerly, at a barrel ceiling,
//!   or only on `end_merge`
//!
//! Barrel lifecycle: `Pending` (waiting in a queue) -> `Queued` (handed out
//! in a plan) -> `Merging` -> `Replaced`.
//!
//! A plan only ever holds a run of barrels with no other live barrel between
//! them in docid order, so a merged barrel never straddles one left out.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{IndexError, Result};
use crate::store::Directory;

use super::barrel_info::BarrelInfo;
use super::types::{BarrelId, DocId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnconditionalMode {
    /// Merge as soon as two barrels exist
    Immediate,
    /// Merge only on `end_merge`
    Offline,
    /// Merge everything once `max_barrels` accumulate
    Optimize { max_barrels: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MergeStrategy {
    Tiered {
        collision_factor: u32,
        level_size: u64,
    },
    LogStructured {
        max_layer_size: usize,
    },
    Partitioned {
        partitions: u32,
        capacity: usize,
    },
    Unconditional {
        mode: UnconditionalMode,
    },
}

impl Default for MergeStrategy {
    fn default() -> Self {
        MergeStrategy::Tiered {
            collision_factor: 3,
            level_size: 1_000,
        }
    }
}

impl MergeStrategy {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(IndexError::InvalidArgument(msg.to_string()));
        match *self {
            MergeStrategy::Tiered {
                collision_factor,
                level_size,
            } => {
                if collision_factor < 2 {
                    return invalid("collision_factor must be at least 2");
                }
                if level_size == 0 {
                    return invalid("level_size must be non-zero");
                }
            }
            MergeStrategy::LogStructured { max_layer_size } if max_layer_size < 2 => {
                return invalid("max_layer_size must be at least 2");
            }
            MergeStrategy::Partitioned {
                partitions,
                capacity,
            } => {
                if partitions == 0 || capacity == 0 {
                    return invalid("partitions and capacity must be non-zero");
                }
            }
            MergeStrategy::Unconditional {
                mode: UnconditionalMode::Optimize { max_barrels },
            } if max_barrels < 2 => {
                return invalid("max_barrels must be at least 2");
            }
            _ => {}
        }
        Ok(())
    }

    /// Size level of a barrel with `doc_count` documents
    fn tier_of(collision_factor: u32, level_size: u64, doc_count: u64) -> u32 {
        let mut level = 0;
        let mut q = doc_count / level_size;
        while q >= collision_factor as u64 {
            q /= collision_factor as u64;
            level += 1;
        }
        level
    }
}

/// Why a plan was produced
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeReason {
    /// A size level reached the collision factor
    TierOverflow,
    /// A generation reached its layer size
    GenerationFull,
    /// A partition exceeded its capacity
    PartitionOverflow,
    /// Unconditional strategies
    Eager,
    /// `end_merge` or `optimize`
    Forced,
}

/// A barrel taking part in a merge
#[derive(Clone)]
pub struct MergeBarrelEntry {
    pub directory: Arc<dyn Directory>,
    pub barrel: BarrelInfo,
}

impl MergeBarrelEntry {
    pub fn new(directory: Arc<dyn Directory>, barrel: BarrelInfo) -> Self {
        Self { directory, barrel }
    }

    pub fn id(&self) -> BarrelId {
        self.barrel.id
    }
}

impl fmt::Debug for MergeBarrelEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeBarrelEntry")
            .field("barrel", &self.barrel.name)
            .field("docs", &self.barrel.doc_count)
            .finish()
    }
}

/// Barrels to merge, ascending by base docid
#[derive(Clone, Debug, Default)]
pub struct MergeBarrelQueue {
    entries: Vec<MergeBarrelEntry>,
}

impl MergeBarrelQueue {
    pub fn new(mut entries: Vec<MergeBarrelEntry>) -> Self {
        entries.sort_by_key(|e| e.barrel.base_doc_id);
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[MergeBarrelEntry] {
        &self.entries
    }

    pub fn ids(&self) -> Vec<BarrelId> {
        self.entries.iter().map(MergeBarrelEntry::id).collect()
    }

    pub fn total_docs(&self) -> u64 {
        self.entries.iter().map(|e| e.barrel.doc_count as u64).sum()
    }

    pub fn into_entries(self) -> Vec<MergeBarrelEntry> {
        self.entries
    }
}

#[derive(Clone, Debug)]
pub struct MergePlan {
    pub queue: MergeBarrelQueue,
    /// Queue the merged barrel joins
    pub level: u32,
    pub reason: MergeReason,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrelState {
    Pending,
    Queued,
    Merging,
    Replaced,
}

pub struct MergePolicy {
    strategy: MergeStrategy,
    queues: BTreeMap<u32, Vec<MergeBarrelEntry>>,
    states: HashMap<BarrelId, BarrelState>,
    /// Every barrel not yet replaced, by base docid
    live: BTreeMap<DocId, BarrelId>,
}

impl MergePolicy {
    pub fn new(strategy: MergeStrategy) -> Self {
        Self {
            strategy,
            queues: BTreeMap::new(),
            states: HashMap::new(),
            live: BTreeMap::new(),
        }
    }

    pub fn strategy(&self) -> &MergeStrategy {
        &self.strategy
    }

    pub fn state_of(&self, id: BarrelId) -> Option<BarrelState> {
        self.states.get(&id).copied()
    }

    /// Barrels waiting in queues
    pub fn pending_count(&self) -> usize {
        self.queues.values().map(Vec::len).sum()
    }

    /// (queue, length) for every non-empty queue
    pub fn queue_sizes(&self) -> Vec<(u32, usize)> {
        self.queues
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(&l, q)| (l, q.len()))
            .collect()
    }

    fn check_new(&self, entry: &MergeBarrelEntry) -> Result<()> {
        if entry.barrel.is_empty() {
            return Err(IndexError::EmptyBarrel(entry.barrel.name.clone()));
        }
        if self.states.contains_key(&entry.id()) {
            return Err(IndexError::DuplicateBarrel(entry.barrel.name.clone()));
        }
        Ok(())
    }

    /// Queue a freshly flushed barrel
    ///
    /// Empty barrels are refused with the benign `EmptyBarrel` error.
    pub fn add_barrel(&mut self, entry: MergeBarrelEntry) -> Result<Option<MergePlan>> {
        self.check_new(&entry)?;
        let level = self.initial_level(&entry.barrel);
        Ok(self.place(entry, level))
    }

    /// Re-queue barrels found in the manifest at startup
    pub fn restore(&mut self, entries: Vec<MergeBarrelEntry>) -> Result<Vec<MergePlan>> {
        let mut accepted = Vec::with_capacity(entries.len());
        for entry in entries {
            match self.check_new(&entry) {
                Ok(()) => {}
                Err(e) if e.is_benign() => continue,
                Err(e) => return Err(e),
            }
            accepted.push(entry);
        }
        // all neighbours must be known before the first plan is formed
        for entry in &accepted {
            self.live.insert(entry.barrel.base_doc_id, entry.id());
        }
        let mut plans = Vec::new();
        for entry in accepted {
            let level = self.clamp_level(entry.barrel.level);
            plans.extend(self.place(entry, level));
        }
        Ok(plans)
    }

    /// Register a merge result; its sources become `Replaced`
    pub fn add_merged_barrel(
        &mut self,
        plan: &MergePlan,
        merged: Option<MergeBarrelEntry>,
    ) -> Result<Option<MergePlan>> {
        for source in plan.queue.entries() {
            self.states.insert(source.id(), BarrelState::Replaced);
            if self.live.get(&source.barrel.base_doc_id) == Some(&source.id()) {
                self.live.remove(&source.barrel.base_doc_id);
            }
        }
        let Some(merged) = merged else {
            return Ok(None);
        };
        self.check_new(&merged)?;
        Ok(self.place(merged, plan.level))
    }

    /// The executor picked up `plan`
    pub fn merge_started(&mut self, plan: &MergePlan) {
        for id in plan.queue.ids() {
            self.states.insert(id, BarrelState::Merging);
        }
    }

    /// Put a failed plan's barrels back in their queues
    pub fn merge_failed(&mut self, plan: MergePlan) {
        for entry in plan.queue.into_entries() {
            let level = self.clamp_level(entry.barrel.level);
            self.states.insert(entry.id(), BarrelState::Pending);
            self.queues.entry(level).or_default().push(entry);
        }
    }

    /// Flush partial merges at shutdown
    pub fn end_merge(&mut self) -> Vec<MergePlan> {
        match self.strategy {
            MergeStrategy::Unconditional { .. } => self.optimize().into_iter().collect(),
            _ => {
                let levels: Vec<u32> = self
                    .queues
                    .iter()
                    .filter(|(_, q)| q.len() >= 2)
                    .map(|(&l, _)| l)
                    .collect();
                levels
                    .into_iter()
                    .filter_map(|level| self.take_queue(level, MergeReason::Forced))
                    .collect()
            }
        }
    }

    /// Merge every pending barrel into one
    ///
    /// Barrels still merging split the pending ones into runs; only the
    /// longest run is handed out then.
    pub fn optimize(&mut self) -> Option<MergePlan> {
        if self.pending_count() < 2 {
            return None;
        }
        let mut entries = Vec::new();
        let mut top = 0;
        for (level, queue) in std::mem::take(&mut self.queues) {
            top = top.max(level);
            entries.extend(queue);
        }
        let (run, rest) = self.split_longest_run(entries);
        for entry in rest {
            self.queues.entry(entry.barrel.level).or_default().push(entry);
        }
        let level = match self.strategy {
            MergeStrategy::Unconditional { .. } => 0,
            _ => top,
        };
        run.map(|run| self.hand_out(run, level, MergeReason::Forced))
    }

    fn initial_level(&self, barrel: &BarrelInfo) -> u32 {
        match self.strategy {
            MergeStrategy::Tiered {
                collision_factor,
                level_size,
            } => MergeStrategy::tier_of(collision_factor, level_size, barrel.doc_count as u64),
            _ => 0,
        }
    }

    fn clamp_level(&self, level: u32) -> u32 {
        match self.strategy {
            MergeStrategy::Partitioned { partitions, .. } => level.min(partitions - 1),
            MergeStrategy::Unconditional { .. } => 0,
            _ => level,
        }
    }

    /// Queue a merged barrel from `level` joins
    fn next_level(&self, level: u32) -> u32 {
        match self.strategy {
            MergeStrategy::Tiered { .. } | MergeStrategy::LogStructured { .. } => level + 1,
            MergeStrategy::Partitioned { partitions, .. } => (level + 1).min(partitions - 1),
            MergeStrategy::Unconditional { .. } => 0,
        }
    }

    /// Queue the merge of `run` out of `level` joins
    fn target_level(&self, level: u32, run: &[MergeBarrelEntry]) -> u32 {
        match self.strategy {
            MergeStrategy::Tiered {
                collision_factor,
                level_size,
            } => {
                let docs: u64 = run.iter().map(|e| e.barrel.doc_count as u64).sum();
                (level + 1).max(MergeStrategy::tier_of(collision_factor, level_size, docs))
            }
            _ => self.next_level(level),
        }
    }

    fn place(&mut self, mut entry: MergeBarrelEntry, level: u32) -> Option<MergePlan> {
        entry.barrel.level = level;
        self.live.insert(entry.barrel.base_doc_id, entry.id());
        self.states.insert(entry.id(), BarrelState::Pending);
        debug!(barrel = %entry.barrel.name, level, "barrel queued for merging");
        self.queues.entry(level).or_default().push(entry);
        self.check_trigger(level)
    }

    fn check_trigger(&mut self, level: u32) -> Option<MergePlan> {
        let len = self.queues.get(&level).map_or(0, Vec::len);
        match self.strategy {
            MergeStrategy::Tiered {
                collision_factor,
                level_size,
            } => {
                if len < collision_factor as usize {
                    return None;
                }
                self.take_queue(level, MergeReason::TierOverflow)
            }
            MergeStrategy::LogStructured { max_layer_size } => {
                if len < max_layer_size {
                    return None;
                }
                self.take_queue(level, MergeReason::GenerationFull)
            }
            MergeStrategy::Partitioned { capacity, .. } => {
                if len <= capacity {
                    return None;
                }
                self.take_queue(level, MergeReason::PartitionOverflow)
            }
            MergeStrategy::Unconditional { mode } => {
                let due = match mode {
                    UnconditionalMode::Immediate => len >= 2,
                    UnconditionalMode::Offline => false,
                    UnconditionalMode::Optimize { max_barrels } => len >= max_barrels,
                };
                if !due {
                    return None;
                }
                self.take_queue(level, MergeReason::Eager)
            }
        }
    }

    /// Hand out the longest docid-adjacent run of `level`'s queue
    fn take_queue(&mut self, level: u32, reason: MergeReason) -> Option<MergePlan> {
        let entries = self.queues.remove(&level)?;
        let (run, rest) = self.split_longest_run(entries);
        if !rest.is_empty() {
            self.queues.insert(level, rest);
        }
        let run = run?;
        let target = self.target_level(level, &run);
        Some(self.hand_out(run, target, reason))
    }

    /// Split off the longest run of at least two barrels with no other live
    /// barrel between them; the earliest run wins ties
    fn split_longest_run(
        &self,
        mut entries: Vec<MergeBarrelEntry>,
    ) -> (Option<Vec<MergeBarrelEntry>>, Vec<MergeBarrelEntry>) {
        entries.sort_by_key(|e| e.barrel.base_doc_id);
        let mut runs: Vec<Vec<MergeBarrelEntry>> = Vec::new();
        for entry in entries {
            match runs.last_mut() {
                Some(run) if self.follows(run, &entry) => run.push(entry),
                _ => runs.push(vec![entry]),
            }
        }
        let mut best: Option<usize> = None;
        for (i, run) in runs.iter().enumerate() {
            if run.len() >= 2 && best.map_or(true, |b| run.len() > runs[b].len()) {
                best = Some(i);
            }
        }
        let run = best.map(|i| runs.remove(i));
        (run, runs.into_iter().flatten().collect())
    }

    /// Whether `entry` is the next live barrel after the end of `run`
    fn follows(&self, run: &[MergeBarrelEntry], entry: &MergeBarrelEntry) -> bool {
        let Some(prev) = run.last() else {
            return false;
        };
        self.live
            .range((Bound::Excluded(prev.barrel.base_doc_id), Bound::Unbounded))
            .next()
            .is_some_and(|(&base, _)| base == entry.barrel.base_doc_id)
    }

    fn hand_out(&mut self, entries: Vec<MergeBarrelEntry>, level: u32, reason: MergeReason) -> MergePlan {
        for entry in &entries {
            self.states.insert(entry.id(), BarrelState::Queued);
        }
        let queue = MergeBarrelQueue::new(entries);
        debug!(
            barrels = queue.len(),
            docs = queue.total_docs(),
            level,
            ?reason,
            "merge planned"
        );
        MergePlan {
            queue,
            level,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RamDirectory;

    struct Barrels {
        dir: Arc<dyn Directory>,
        next_id: u64,
        next_doc: u32,
    }

    impl Barrels {
        fn new() -> Self {
            Self {
                dir: Arc::new(RamDirectory::new()),
                next_id: 0,
                next_doc: 0,
            }
        }

        fn entry(&mut self, docs: u32) -> MergeBarrelEntry {
            let id = BarrelId(self.next_id);
            self.next_id += 1;
            let mut barrel = BarrelInfo::new(id, BarrelInfo::flushed_name(id));
            for _ in 0..docs {
                barrel.add_doc(self.next_doc);
                self.next_doc += 1;
            }
            MergeBarrelEntry::new(self.dir.clone(), barrel)
        }

        /// What a merge of `plan` would produce
        fn merged(&mut self, plan: &MergePlan) -> MergeBarrelEntry {
            let id = BarrelId(self.next_id);
            self.next_id += 1;
            let entries = plan.queue.entries();
            let mut barrel = BarrelInfo::new(id, format!("_mid_{}", id.0));
            barrel.base_doc_id = entries[0].barrel.base_doc_id;
            barrel.max_doc_id = entries[entries.len() - 1].barrel.max_doc_id;
            barrel.doc_count = plan.queue.total_docs() as u32;
            MergeBarrelEntry::new(self.dir.clone(), barrel)
        }
    }

    fn tiered() -> MergePolicy {
        MergePolicy::new(MergeStrategy::Tiered {
            collision_factor: 3,
            level_size: 10,
        })
    }

    #[test]
    fn test_tier_levels() {
        assert_eq!(MergeStrategy::tier_of(3, 10, 0), 0);
        assert_eq!(MergeStrategy::tier_of(3, 10, 29), 0);
        assert_eq!(MergeStrategy::tier_of(3, 10, 30), 1);
        assert_eq!(MergeStrategy::tier_of(3, 10, 89), 1);
        assert_eq!(MergeStrategy::tier_of(3, 10, 90), 2);
    }

    #[test]
    fn test_tiered_merges_at_collision_factor() {
        let mut b = Barrels::new();
        let mut policy = tiered();
        let first = b.entry(5);
        let first_id = first.id();
        assert!(policy.add_barrel(first).unwrap().is_none());
        assert_eq!(policy.state_of(first_id), Some(BarrelState::Pending));
        assert!(policy.add_barrel(b.entry(5)).unwrap().is_none());
        let plan = policy.add_barrel(b.entry(5)).unwrap().unwrap();
        assert_eq!(plan.queue.len(), 3);
        assert_eq!(plan.level, 1);
        assert_eq!(plan.reason, MergeReason::TierOverflow);
        assert_eq!(policy.state_of(first_id), Some(BarrelState::Queued));
        assert_eq!(policy.pending_count(), 0);

        policy.merge_started(&plan);
        assert_eq!(policy.state_of(first_id), Some(BarrelState::Merging));
        let merged = b.merged(&plan);
        let merged_id = merged.id();
        assert!(policy.add_merged_barrel(&plan, Some(merged)).unwrap().is_none());
        assert_eq!(policy.state_of(first_id), Some(BarrelState::Replaced));
        assert_eq!(policy.state_of(merged_id), Some(BarrelState::Pending));
        assert_eq!(policy.queue_sizes(), vec![(1, 1)]);
    }

    #[test]
    fn test_tiered_large_barrel_starts_high() {
        let mut b = Barrels::new();
        let mut policy = tiered();
        policy.add_barrel(b.entry(95)).unwrap();
        assert_eq!(policy.queue_sizes(), vec![(2, 1)]);
    }

    #[test]
    fn test_tiered_cascade() {
        let mut b = Barrels::new();
        let mut policy = tiered();
        let mut merges = 0;
        for _ in 0..9 {
            let mut next = policy.add_barrel(b.entry(3)).unwrap();
            while let Some(plan) = next {
                merges += 1;
                let merged = b.merged(&plan);
                next = policy.add_merged_barrel(&plan, Some(merged)).unwrap();
            }
        }
        // nine level-0 barrels -> three level-1 barrels -> one level-2 barrel
        assert_eq!(merges, 4);
        assert_eq!(policy.queue_sizes(), vec![(2, 1)]);
    }

    #[test]
    fn test_rejects_empty_and_duplicates() {
        let mut b = Barrels::new();
        let mut policy = tiered();
        let err = policy.add_barrel(b.entry(0)).unwrap_err();
        assert!(err.is_benign());
        assert!(policy.end_merge().is_empty());

        let entry = b.entry(1);
        policy.add_barrel(entry.clone()).unwrap();
        assert!(matches!(
            policy.add_barrel(entry),
            Err(IndexError::DuplicateBarrel(_))
        ));
    }

    #[test]
    fn test_log_structured_generations() {
        let mut b = Barrels::new();
        let mut policy = MergePolicy::new(MergeStrategy::LogStructured { max_layer_size: 2 });
        assert!(policy.add_barrel(b.entry(100)).unwrap().is_none());
        let plan = policy.add_barrel(b.entry(1)).unwrap().unwrap();
        assert_eq!(plan.level, 1);
        assert_eq!(plan.reason, MergeReason::GenerationFull);
        let merged = b.merged(&plan);
        assert!(policy.add_merged_barrel(&plan, Some(merged)).unwrap().is_none());
        assert_eq!(policy.queue_sizes(), vec![(1, 1)]);
    }

    #[test]
    fn test_partitioned_overflow() {
        let mut b = Barrels::new();
        let mut policy = MergePolicy::new(MergeStrategy::Partitioned {
            partitions: 2,
            capacity: 2,
        });
        let mut last_plan = None;
        for _ in 0..3 {
            policy.add_barrel(b.entry(1)).unwrap();
            policy.add_barrel(b.entry(1)).unwrap();
            let plan = policy.add_barrel(b.entry(1)).unwrap().unwrap();
            assert_eq!(plan.queue.len(), 3);
            assert_eq!(plan.level, 1);
            let merged = b.merged(&plan);
            last_plan = policy.add_merged_barrel(&plan, Some(merged)).unwrap();
        }

        // the last partition merges into itself
        let plan = last_plan.unwrap();
        assert_eq!(plan.level, 1);
        assert_eq!(plan.queue.len(), 3);
        assert_eq!(plan.reason, MergeReason::PartitionOverflow);
    }

    #[test]
    fn test_tiered_skips_barrels_that_are_not_adjacent() {
        let mut b = Barrels::new();
        let mut policy = MergePolicy::new(MergeStrategy::Tiered {
            collision_factor: 2,
            level_size: 2,
        });
        let small = b.entry(1);
        let small_id = small.id();
        assert!(policy.add_barrel(small).unwrap().is_none());
        assert!(policy.add_barrel(b.entry(4)).unwrap().is_none());
        // level 0 holds two barrels, but the large one sits between them
        assert!(policy.add_barrel(b.entry(1)).unwrap().is_none());
        assert_eq!(policy.queue_sizes(), vec![(0, 2), (1, 1)]);

        let plan = policy.add_barrel(b.entry(1)).unwrap().unwrap();
        assert_eq!(plan.queue.len(), 2);
        assert!(!plan.queue.ids().contains(&small_id));
        let merged = b.merged(&plan);
        let plan = policy.add_merged_barrel(&plan, Some(merged)).unwrap().unwrap();
        let entries = plan.queue.entries();
        assert_eq!(entries[0].barrel.base_doc_id, 1);
        assert_eq!(entries[1].barrel.max_doc_id, 6);
        assert_eq!(policy.state_of(small_id), Some(BarrelState::Pending));
    }

    #[test]
    fn test_optimize_stops_at_merging_barrels() {
        let mut b = Barrels::new();
        let mut policy = tiered();
        let first = b.entry(40);
        let first_id = first.id();
        policy.add_barrel(first).unwrap();
        policy.add_barrel(b.entry(1)).unwrap();
        policy.add_barrel(b.entry(1)).unwrap();
        policy.add_barrel(b.entry(40)).unwrap();
        let busy = policy.add_barrel(b.entry(1)).unwrap().unwrap();
        assert_eq!(busy.queue.len(), 2);
        policy.merge_started(&busy);

        let plan = policy.optimize().unwrap();
        assert_eq!(plan.queue.len(), 2);
        assert_eq!(plan.queue.entries()[0].barrel.base_doc_id, 42);
        assert_eq!(policy.state_of(first_id), Some(BarrelState::Pending));
        assert_eq!(policy.pending_count(), 1);
    }

    #[test]
    fn test_unconditional_modes() {
        let mut b = Barrels::new();
        let mut immediate = MergePolicy::new(MergeStrategy::Unconditional {
            mode: UnconditionalMode::Immediate,
        });
        assert!(immediate.add_barrel(b.entry(1)).unwrap().is_none());
        assert_eq!(immediate.add_barrel(b.entry(1)).unwrap().unwrap().reason, MergeReason::Eager);

        let mut offline = MergePolicy::new(MergeStrategy::Unconditional {
            mode: UnconditionalMode::Offline,
        });
        for _ in 0..5 {
            assert!(offline.add_barrel(b.entry(1)).unwrap().is_none());
        }
        let plans = offline.end_merge();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].queue.len(), 5);
        assert_eq!(plans[0].reason, MergeReason::Forced);

        let mut capped = MergePolicy::new(MergeStrategy::Unconditional {
            mode: UnconditionalMode::Optimize { max_barrels: 3 },
        });
        capped.add_barrel(b.entry(1)).unwrap();
        capped.add_barrel(b.entry(1)).unwrap();
        assert!(capped.add_barrel(b.entry(1)).unwrap().is_some());
        capped.add_barrel(b.entry(1)).unwrap();
        assert!(capped.end_merge().is_empty());
    }

    #[test]
    fn test_end_merge_flushes_partial_levels() {
        let mut b = Barrels::new();
        let mut policy = tiered();
        policy.add_barrel(b.entry(1)).unwrap();
        policy.add_barrel(b.entry(1)).unwrap();
        policy.add_barrel(b.entry(40)).unwrap();
        let plans = policy.end_merge();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].queue.len(), 2);
        assert_eq!(plans[0].level, 1);
        assert_eq!(policy.queue_sizes(), vec![(1, 1)]);
    }

    #[test]
    fn test_merge_failed_requeues() {
        let mut b = Barrels::new();
        let mut policy = tiered();
        policy.add_barrel(b.entry(1)).unwrap();
        policy.add_barrel(b.entry(1)).unwrap();
        let plan = policy.add_barrel(b.entry(1)).unwrap().unwrap();
        let ids = plan.queue.ids();
        policy.merge_failed(plan);
        assert_eq!(policy.pending_count(), 3);
        assert!(ids
            .iter()
            .all(|&id| policy.state_of(id) == Some(BarrelState::Pending)));
    }

    #[test]
    fn test_restore_uses_recorded_levels() {
        let mut b = Barrels::new();
        let mut policy = tiered();
        let mut entries = Vec::new();
        for level in [0, 1, 1, 1] {
            let mut e = b.entry(2);
            e.barrel.level = level;
            entries.push(e);
        }
        entries.push(b.entry(0));
        let plans = policy.restore(entries).unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].level, 2);
        assert_eq!(policy.queue_sizes(), vec![(0, 1)]);
    }

    #[test]
    fn test_strategy_validation_and_serde() {
        assert!(MergeStrategy::default().validate().is_ok());
        assert!(MergeStrategy::Tiered {
            collision_factor: 1,
            level_size: 10
        }
        .validate()
        .is_err());
        assert!(MergeStrategy::Unconditional {
            mode: UnconditionalMode::Optimize { max_barrels: 1 }
        }
        .validate()
        .is_err());

        let json = serde_json::to_string(&MergeStrategy::LogStructured { max_layer_size: 4 }).unwrap();
        assert_eq!(json, r#"{"type":"log_structured","max_layer_size":4}"#);
        let back: MergeStrategy = serde_json::from_str(
            r#"{"type":"unconditional","mode":{"optimize":{"max_barrels":5}}}"#,
        )
        .unwrap();
        assert_eq!(
            back,
            MergeStrategy::Unconditional {
                mode: UnconditionalMode::Optimize { max_barrels: 5 }
            }
        );
    }
}
