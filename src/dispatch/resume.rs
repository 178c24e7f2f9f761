//! Resume-versus-restart decisions of the default (known length) path.

use crate::storage::Segment;

/// What to do once piece storage exists for a known-length download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartDecision {
    /// A same-size file is already in place; nothing to transfer.
    AlreadyComplete,
    /// Load or create the destination and look at segment progress.
    OpenFile,
}

/// Whether the body on the current connection can feed the first segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentDecision {
    /// Stream the body into `Segment` on this connection.
    ContinueOnConnection(Segment),
    /// Give the segment back and schedule a fresh attempt.
    ReleaseAndRetry,
}

/// Decides whether the download is already finished on disk.
///
/// `satisfied` must only be computed when no snapshot exists; a snapshot
/// means the file on disk is partial whatever its size.
#[must_use]
pub fn decide_start(snapshot_exists: bool, satisfied: bool) -> StartDecision {
    if !snapshot_exists && satisfied {
        StartDecision::AlreadyComplete
    } else {
        StartDecision::OpenFile
    }
}

/// Decides whether to keep consuming the current full-entity body.
///
/// Only a segment that starts the file with nothing written lines up with a
/// body that begins at byte 0, and pipelined connections may already carry
/// the next response.
#[must_use]
pub fn decide_segment(segment: Option<&Segment>, pipelining: bool) -> SegmentDecision {
    match segment {
        Some(segment) if segment.position_to_write() == 0 && !pipelining => {
            SegmentDecision::ContinueOnConnection(*segment)
        }
        _ => SegmentDecision::ReleaseAndRetry,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(offset: u64, written: u64) -> Segment {
        Segment {
            index: usize::try_from(offset / 1024).unwrap_or_default(),
            offset,
            length: 1024,
            written,
        }
    }

    #[test]
    fn test_start_requires_missing_snapshot() {
        assert_eq!(decide_start(false, true), StartDecision::AlreadyComplete);
        assert_eq!(decide_start(true, true), StartDecision::OpenFile);
        assert_eq!(decide_start(false, false), StartDecision::OpenFile);
    }

    #[test]
    fn test_fresh_segment_continues_on_connection() {
        let fresh = segment(0, 0);
        assert_eq!(
            decide_segment(Some(&fresh), false),
            SegmentDecision::ContinueOnConnection(fresh)
        );
    }

    #[test]
    fn test_pipelining_forces_fresh_attempt() {
        assert_eq!(
            decide_segment(Some(&segment(0, 0)), true),
            SegmentDecision::ReleaseAndRetry
        );
    }

    #[test]
    fn test_progress_forces_fresh_attempt() {
        assert_eq!(
            decide_segment(Some(&segment(0, 10)), false),
            SegmentDecision::ReleaseAndRetry
        );
        assert_eq!(
            decide_segment(Some(&segment(1024, 0)), false),
            SegmentDecision::ReleaseAndRetry
        );
        assert_eq!(decide_segment(None, false), SegmentDecision::ReleaseAndRetry);
    }
}
