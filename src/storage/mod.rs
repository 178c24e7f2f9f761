//! Destination file, segment assignment and persisted progress.
//!
//! - [`PieceStorage`] owns the destination file and its piece bitmap
//! - [`SegmentManager`] hands piece-aligned byte ranges to workers
//! - [`ProgressSnapshot`] is the JSON control file that makes a download resumable

mod piece;
mod progress;
mod segment;

pub use piece::PieceStorage;
pub use progress::{ProgressRecord, ProgressSnapshot, SNAPSHOT_SUFFIX};
pub use segment::{MAX_PIECE_COUNT, Segment, SegmentManager, piece_count};
