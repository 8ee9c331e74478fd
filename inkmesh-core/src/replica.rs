//! Per-participant canvas replica.
//!
//! The replica is a two-phase set of strokes keyed by id:
//! - `add` inserts a stroke unless the id is already present or erased
//! - `erase` removes by id and records a tombstone
//! - tombstones are never dropped, so an erased id stays erased
//!
//! Both operations are idempotent and commute across ids, so peers that
//! receive the same adds and erases in any order end with the same set.
//! `clear` empties the strokes but keeps tombstones and does not block
//! later adds.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::{Stroke, StrokeId};

/// Result of adding a single stroke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// Same id already present; replica unchanged.
    Duplicate,
    /// Id was erased earlier; replica unchanged.
    Tombstoned,
}

/// Result of merging a sync snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    /// Strokes that were not present before, in snapshot order.
    pub added: Vec<Stroke>,
    /// Ids removed because the snapshot carried their tombstone.
    pub erased: Vec<StrokeId>,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    stroke: Stroke,
}

/// Ordered stroke-id → stroke mapping with erase tombstones.
#[derive(Debug, Clone, Default)]
pub struct CanvasReplica {
    strokes: HashMap<StrokeId, Entry>,
    order: BTreeMap<u64, StrokeId>,
    tombstones: HashSet<StrokeId>,
    next_seq: u64,
}

impl CanvasReplica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, stroke: Stroke) -> AddOutcome {
        if self.tombstones.contains(&stroke.id) {
            log::trace!("Ignoring add of erased stroke {}", stroke.id);
            return AddOutcome::Tombstoned;
        }
        if self.strokes.contains_key(&stroke.id) {
            return AddOutcome::Duplicate;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, stroke.id.clone());
        self.strokes.insert(stroke.id.clone(), Entry { seq, stroke });
        AddOutcome::Added
    }

    /// Erase strokes by id. Returns the ids that were actually present.
    ///
    /// Unknown ids are still tombstoned so a late add cannot bring them back.
    pub fn erase(&mut self, ids: &[StrokeId]) -> Vec<StrokeId> {
        let mut removed = Vec::new();
        for id in ids {
            self.tombstones.insert(id.clone());
            if let Some(entry) = self.strokes.remove(id) {
                self.order.remove(&entry.seq);
                removed.push(id.clone());
            }
        }
        removed
    }

    /// Remove every stroke. Returns how many were removed.
    pub fn clear(&mut self) -> usize {
        let count = self.strokes.len();
        self.strokes.clear();
        self.order.clear();
        count
    }

    /// Merge a full snapshot from another replica.
    ///
    /// Tombstones are applied first so a snapshot never resurrects a stroke
    /// that either side has erased.
    pub fn merge(&mut self, strokes: Vec<Stroke>, erased: &[StrokeId]) -> MergeOutcome {
        let mut outcome = MergeOutcome {
            erased: self.erase(erased),
            ..MergeOutcome::default()
        };
        for stroke in strokes {
            match self.add(stroke.clone()) {
                AddOutcome::Added => outcome.added.push(stroke),
                AddOutcome::Duplicate | AddOutcome::Tombstoned => outcome.skipped += 1,
            }
        }
        outcome
    }

    pub fn get(&self, id: &StrokeId) -> Option<&Stroke> {
        self.strokes.get(id).map(|e| &e.stroke)
    }

    pub fn contains(&self, id: &StrokeId) -> bool {
        self.strokes.contains_key(id)
    }

    pub fn is_erased(&self, id: &StrokeId) -> bool {
        self.tombstones.contains(id)
    }

    pub fn len(&self) -> usize {
        self.strokes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strokes.is_empty()
    }

    /// Stroke ids in insertion order.
    pub fn ids(&self) -> Vec<StrokeId> {
        self.order.values().cloned().collect()
    }

    /// All strokes in insertion order.
    pub fn snapshot(&self) -> Vec<Stroke> {
        self.order
            .values()
            .filter_map(|id| self.strokes.get(id))
            .map(|e| e.stroke.clone())
            .collect()
    }

    pub fn tombstones(&self) -> Vec<StrokeId> {
        let mut ids: Vec<StrokeId> = self.tombstones.iter().cloned().collect();
        ids.sort();
        ids
    }
}
