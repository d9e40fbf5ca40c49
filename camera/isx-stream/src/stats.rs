use tracing::{info, warn};

use isx_stream_types::FrameStats;

use crate::frame::FrameMetadata;

/// Tracks frame counters across frames to report skipped frames and
/// recording state changes.
#[derive(Debug, Default)]
pub struct FrameStatsTracker {
    prev_seq_id: Option<u32>,
    prev_record: Option<bool>,
}

impl FrameStatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, meta: &FrameMetadata) -> FrameStats {
        let seq_id = meta.seq_id;
        let missing_frames_range = match self.prev_seq_id {
            Some(prev) if seq_id > prev.saturating_add(1) => Some((prev + 1, seq_id - 1)),
            Some(prev) if seq_id <= prev => {
                warn!("frame counter went from {prev} to {seq_id}, assuming restart");
                None
            }
            _ => None,
        };
        self.prev_seq_id = Some(seq_id);

        if self.prev_record != Some(meta.isxd_record) {
            if meta.isxd_record {
                info!("recording started at frame #{seq_id}");
            } else if self.prev_record.is_some() {
                info!("recording stopped at frame #{seq_id}");
            }
            self.prev_record = Some(meta.isxd_record);
        }

        FrameStats {
            seq_id,
            missing_frames_range,
            isxd_record: meta.isxd_record,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(seq_id: u32) -> FrameMetadata {
        FrameMetadata {
            seq_id,
            isxd_record: true,
        }
    }

    #[test]
    fn reports_missing_ranges() {
        let mut tracker = FrameStatsTracker::new();
        assert_eq!(tracker.update(&meta(2)).missing_frames_range, None);
        assert_eq!(tracker.update(&meta(3)).missing_frames_range, None);
        let stats = tracker.update(&meta(6));
        assert_eq!(stats.missing_frames_range, Some((4, 5)));
        assert_eq!(stats.seq_id, 6);
        assert!(stats.isxd_record);
    }

    #[test]
    fn counter_restart_is_not_a_gap() {
        let mut tracker = FrameStatsTracker::new();
        tracker.update(&meta(100));
        assert_eq!(tracker.update(&meta(1)).missing_frames_range, None);
        assert_eq!(tracker.update(&meta(4)).missing_frames_range, Some((2, 3)));
    }

    #[test]
    fn first_frame_zero() {
        let mut tracker = FrameStatsTracker::new();
        assert_eq!(tracker.update(&meta(0)).missing_frames_range, None);
        assert_eq!(tracker.update(&meta(2)).missing_frames_range, Some((1, 1)));
    }
}
