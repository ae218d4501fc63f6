//! Piece rarity counts and the ordered wanted set.
//!
//! The index itself does no locking; [`PieceStore`](super::PieceStore) keeps
//! it behind its mutex so that count updates and wanted-set reordering happen
//! together.

use crate::peer::{Bitfield, PieceId};
use rand::Rng;
use std::collections::{BTreeSet, HashMap};

/// How [`RarityIndex::select`] draws among the rarest candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SelectionMode {
    /// Every candidate is equally likely.
    #[default]
    Uniform,
    /// Candidates are weighted by `1 / (1 + count)`, favouring rarer pieces
    /// inside the pool as well.
    RarityWeighted,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct WantedEntry {
    count: u32,
    seq: u64,
    piece: PieceId,
}

/// Per-piece peer counts plus the set of pieces we still want, ordered by
/// count ascending and then by insertion order.
#[derive(Debug, Default)]
pub struct RarityIndex {
    counts: HashMap<String, Vec<u32>>,
    wanted: BTreeSet<WantedEntry>,
    wanted_seq: HashMap<PieceId, u64>,
    next_seq: u64,
}

impl RarityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts counting for a file. Existing counts are kept.
    pub fn track_file(&mut self, file_id: &str, piece_count: usize) {
        let stale: Vec<PieceId> = self
            .wanted_seq
            .keys()
            .filter(|p| p.file_id == file_id && p.index as usize >= piece_count)
            .cloned()
            .collect();
        for piece in &stale {
            self.remove_wanted(piece);
        }

        let counts = self.counts.entry(file_id.to_string()).or_default();
        counts.resize(piece_count, 0);
    }

    pub fn is_tracked(&self, file_id: &str) -> bool {
        self.counts.contains_key(file_id)
    }

    pub fn count(&self, piece: &PieceId) -> Option<u32> {
        self.counts
            .get(&piece.file_id)?
            .get(piece.index as usize)
            .copied()
    }

    /// Adds `delta` to the count of `piece`, clamping at zero.
    ///
    /// A wanted piece is moved to its new position. Returns the new count, or
    /// `None` for pieces of untracked files.
    pub fn adjust(&mut self, piece: &PieceId, delta: i32) -> Option<u32> {
        let slot = self
            .counts
            .get_mut(&piece.file_id)?
            .get_mut(piece.index as usize)?;

        let old = *slot;
        let new = if delta < 0 {
            if old < delta.unsigned_abs() {
                tracing::debug!("rarity of {} would drop below zero", piece);
            }
            old.saturating_sub(delta.unsigned_abs())
        } else {
            old.saturating_add(delta as u32)
        };
        *slot = new;

        if old != new {
            if let Some(&seq) = self.wanted_seq.get(piece) {
                self.wanted.remove(&WantedEntry {
                    count: old,
                    seq,
                    piece: piece.clone(),
                });
                self.wanted.insert(WantedEntry {
                    count: new,
                    seq,
                    piece: piece.clone(),
                });
            }
        }
        Some(new)
    }

    /// Counts one more holder for every piece set in `bitfield`.
    ///
    /// Returns the pieces that were actually counted, sized to the tracked
    /// piece count, or `None` if the file is not tracked. Handing that value
    /// back to [`remove_bitfield`](Self::remove_bitfield) undoes exactly this
    /// call.
    pub fn add_bitfield(&mut self, file_id: &str, bitfield: &Bitfield) -> Option<Bitfield> {
        let piece_count = self.counts.get(file_id)?.len();
        let mut counted = Bitfield::new(piece_count);
        for index in bitfield.available() {
            if index < piece_count {
                self.adjust(&PieceId::new(file_id, index as u32), 1);
                counted.set(index);
            }
        }
        Some(counted)
    }

    /// Drops one holder for every piece set in `counted`.
    pub fn remove_bitfield(&mut self, file_id: &str, counted: &Bitfield) {
        for index in counted.available() {
            self.adjust(&PieceId::new(file_id, index as u32), -1);
        }
    }

    /// Adds a piece to the wanted set. Returns false if it was already there
    /// or belongs to an untracked file.
    pub fn insert_wanted(&mut self, piece: PieceId) -> bool {
        if self.wanted_seq.contains_key(&piece) {
            return false;
        }
        let Some(count) = self.count(&piece) else {
            return false;
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        self.wanted_seq.insert(piece.clone(), seq);
        self.wanted.insert(WantedEntry { count, seq, piece });
        true
    }

    /// Removes a piece from the wanted set. Returns false if it was absent.
    pub fn remove_wanted(&mut self, piece: &PieceId) -> bool {
        let Some(seq) = self.wanted_seq.remove(piece) else {
            return false;
        };
        let count = self.count(piece).unwrap_or_default();
        self.wanted.remove(&WantedEntry {
            count,
            seq,
            piece: piece.clone(),
        });
        true
    }

    pub fn is_wanted(&self, piece: &PieceId) -> bool {
        self.wanted_seq.contains_key(piece)
    }

    pub fn wanted_len(&self) -> usize {
        self.wanted.len()
    }

    /// Wanted pieces with their counts, rarest first.
    pub fn wanted(&self) -> impl Iterator<Item = (&PieceId, u32)> {
        self.wanted.iter().map(|e| (&e.piece, e.count))
    }

    /// Picks a wanted piece accepted by `eligible` and removes it from the
    /// wanted set.
    ///
    /// The pick is drawn at random from the `pool` rarest eligible pieces,
    /// uniformly or weighted by rarity depending on `mode`.
    pub fn select<F, R>(
        &mut self,
        eligible: F,
        pool: usize,
        mode: SelectionMode,
        rng: &mut R,
    ) -> Option<PieceId>
    where
        F: Fn(&PieceId) -> bool,
        R: Rng,
    {
        let candidates: Vec<(PieceId, u32)> = self
            .wanted
            .iter()
            .filter(|e| eligible(&e.piece))
            .take(pool.max(1))
            .map(|e| (e.piece.clone(), e.count))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let chosen = match mode {
            SelectionMode::Uniform => rng.random_range(0..candidates.len()),
            SelectionMode::RarityWeighted => {
                let weights: Vec<f64> = candidates
                    .iter()
                    .map(|(_, count)| 1.0 / (1.0 + *count as f64))
                    .collect();
                let total: f64 = weights.iter().sum();

                let mut target = rng.random::<f64>() * total;
                let mut chosen = candidates.len() - 1;
                for (i, weight) in weights.iter().enumerate() {
                    if target < *weight {
                        chosen = i;
                        break;
                    }
                    target -= weight;
                }
                chosen
            }
        };

        let piece = candidates[chosen].0.clone();
        self.remove_wanted(&piece);
        Some(piece)
    }
}
