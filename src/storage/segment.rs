//! Piece-aligned byte ranges assigned to workers.

use std::collections::HashMap;

use tracing::debug;

use crate::engine::Cuid;

/// Upper bound on the pieces of one download.
///
/// Piece bitmaps and segment cursors are allocated per piece, so the entity
/// length a server declares must be checked against this before either is built.
pub const MAX_PIECE_COUNT: u64 = 1 << 20;

/// Number of `piece_length` pieces covering `total_length` bytes.
#[must_use]
pub fn piece_count(total_length: u64, piece_length: u64) -> u64 {
    total_length.div_ceil(piece_length.max(1))
}

/// A byte range of the destination file assigned to one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Piece index.
    pub index: usize,
    /// Absolute offset of the first byte.
    pub offset: u64,
    /// Length in bytes.
    pub length: u64,
    /// Bytes already written from `offset`.
    pub written: u64,
}

impl Segment {
    /// Absolute offset of the next byte to write.
    #[must_use]
    pub fn position_to_write(&self) -> u64 {
        self.offset + self.written
    }

    /// Bytes still missing.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.length - self.written
    }

    /// Whether every byte has been written.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.written >= self.length
    }
}

/// Assigns segments of a known-length download and tracks their progress.
///
/// A worker holds at most one segment; asking again returns the same one
/// until it is completed or canceled. Canceling keeps the written bytes.
#[derive(Debug, Clone)]
pub struct SegmentManager {
    total_length: u64,
    piece_length: u64,
    written: Vec<u64>,
    assigned: HashMap<Cuid, usize>,
}

impl SegmentManager {
    /// Splits `total_length` bytes into pieces of `piece_length`.
    #[must_use]
    pub fn new(total_length: u64, piece_length: u64) -> Self {
        let piece_length = piece_length.max(1);
        let count = usize::try_from(total_length.div_ceil(piece_length)).unwrap_or(usize::MAX);
        Self {
            total_length,
            piece_length,
            written: vec![0; count],
            assigned: HashMap::new(),
        }
    }

    /// Number of pieces.
    #[must_use]
    pub fn piece_count(&self) -> usize {
        self.written.len()
    }

    /// Length of the download this manager splits.
    #[must_use]
    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Bytes written per piece, in piece order.
    #[must_use]
    pub fn written(&self) -> &[u64] {
        &self.written
    }

    /// Restores per-piece progress loaded from a snapshot.
    ///
    /// Returns `false` and leaves the manager untouched if the piece count
    /// does not match.
    pub fn restore(&mut self, written: &[u64]) -> bool {
        if written.len() != self.written.len() {
            return false;
        }
        for (index, &bytes) in written.iter().enumerate() {
            self.written[index] = bytes.min(self.piece_len(index));
        }
        true
    }

    /// Returns the segment assigned to `cuid`, assigning one if needed.
    ///
    /// The search for an unassigned, incomplete piece starts at `hint` and
    /// wraps around to the first piece.
    pub fn get_segment(&mut self, cuid: Cuid, hint: usize) -> Option<Segment> {
        if let Some(&index) = self.assigned.get(&cuid) {
            return Some(self.segment(index));
        }
        let count = self.written.len();
        let index = (hint.min(count)..count)
            .chain(0..hint.min(count))
            .find(|&index| self.is_available(index))?;
        self.assigned.insert(cuid, index);
        debug!(%cuid, index, "segment assigned");
        Some(self.segment(index))
    }

    /// Assigns the piece whose next byte to write is exactly `offset`.
    ///
    /// Used to keep consuming a body stream past a segment boundary.
    pub fn claim_at(&mut self, cuid: Cuid, offset: u64) -> Option<Segment> {
        let index = usize::try_from(offset / self.piece_length).ok()?;
        if index >= self.written.len() || self.assigned.contains_key(&cuid) {
            return None;
        }
        let segment = self.segment(index);
        if segment.position_to_write() != offset || !self.is_available(index) {
            return None;
        }
        self.assigned.insert(cuid, index);
        Some(segment)
    }

    /// Releases the segment held by `cuid` back to pending work.
    pub fn cancel_segment(&mut self, cuid: Cuid) -> Option<usize> {
        let index = self.assigned.remove(&cuid)?;
        debug!(%cuid, index, "segment canceled");
        Some(index)
    }

    /// Records `bytes` more bytes written to piece `index`.
    pub fn record_written(&mut self, index: usize, bytes: u64) {
        let limit = self.piece_len(index);
        if let Some(written) = self.written.get_mut(index) {
            *written = (*written + bytes).min(limit);
        }
    }

    /// Bytes written across all pieces.
    #[must_use]
    pub fn completed_length(&self) -> u64 {
        self.written.iter().sum()
    }

    /// Whether every piece is fully written.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completed_length() >= self.total_length
    }

    /// Whether some incomplete piece is not held by any worker.
    #[must_use]
    pub fn has_unassigned_work(&self) -> bool {
        (0..self.written.len()).any(|index| self.is_available(index))
    }

    /// Marks every piece fully written.
    pub fn mark_all_complete(&mut self) {
        for index in 0..self.written.len() {
            self.written[index] = self.piece_len(index);
        }
        self.assigned.clear();
    }

    fn is_available(&self, index: usize) -> bool {
        self.written[index] < self.piece_len(index) && !self.assigned.values().any(|&i| i == index)
    }

    fn piece_len(&self, index: usize) -> u64 {
        let offset = index as u64 * self.piece_length;
        self.piece_length.min(self.total_length.saturating_sub(offset))
    }

    fn segment(&self, index: usize) -> Segment {
        Segment {
            index,
            offset: index as u64 * self.piece_length,
            length: self.piece_len(index),
            written: self.written[index],
        }
    }
}
