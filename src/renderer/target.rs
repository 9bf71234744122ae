// Output targets
// Per-surface transform, enable flag and frame-rate cap

use super::MirrorMode;
use crate::matrix::Mat4;
use serde::{Deserialize, Serialize};

const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Options for a newly added target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TargetOptions {
    /// Upper bound on draws per second, 0 for uncapped
    pub max_fps: u32,
    /// The target's Y axis points the other way from the source
    pub inverted: bool,
}

impl TargetOptions {
    pub fn with_max_fps(max_fps: u32) -> Self {
        Self {
            max_fps,
            inverted: false,
        }
    }

    pub fn inverted(mut self, inverted: bool) -> Self {
        self.inverted = inverted;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameThrottle {
    interval_ns: u64,
    next_draw_ns: u64,
}

impl FrameThrottle {
    pub fn from_fps(max_fps: u32) -> Option<Self> {
        if max_fps == 0 {
            return None;
        }
        Some(Self {
            interval_ns: NANOS_PER_SECOND / max_fps as u64,
            next_draw_ns: 0,
        })
    }

    pub fn interval_ns(&self) -> u64 {
        self.interval_ns
    }

    pub fn is_due(&self, now_ns: u64) -> bool {
        now_ns >= self.next_draw_ns
    }

    pub fn arm(&mut self, now_ns: u64) {
        self.next_draw_ns = now_ns.saturating_add(self.interval_ns);
    }
}

pub(crate) struct TargetRecord<S> {
    pub id: u32,
    pub surface: S,
    pub transform: Mat4,
    pub enabled: bool,
    pub inverted: bool,
    throttle: Option<FrameThrottle>,
}

impl<S> TargetRecord<S> {
    pub fn new(id: u32, surface: S, options: TargetOptions) -> Self {
        Self {
            id,
            surface,
            transform: Mat4::IDENTITY,
            enabled: true,
            inverted: options.inverted,
            throttle: FrameThrottle::from_fps(options.max_fps),
        }
    }

    /// Whether this target takes part in the pass at `now_ns`
    pub fn is_due(&self, now_ns: u64) -> bool {
        self.enabled && self.throttle.is_none_or(|t| t.is_due(now_ns))
    }

    /// Starts the next frame interval after a frame was presented at `now_ns`
    pub fn arm(&mut self, now_ns: u64) {
        if let Some(throttle) = self.throttle.as_mut() {
            throttle.arm(now_ns);
        }
    }

    pub fn mvp(&self, mirror: MirrorMode) -> Mat4 {
        let mode = if self.inverted {
            mirror.flip_vertical()
        } else {
            mirror
        };
        mode.apply(&self.transform)
    }

    pub fn interval_ns(&self) -> Option<u64> {
        self.throttle.map(|t| t.interval_ns())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME_5MS: u64 = 5_000_000;

    fn draw_at<S>(record: &mut TargetRecord<S>, now: u64) -> bool {
        let due = record.is_due(now);
        if due {
            record.arm(now);
        }
        due
    }

    #[test]
    fn test_uncapped_target_always_draws() {
        let mut record = TargetRecord::new(1, (), TargetOptions::default());
        assert_eq!(record.interval_ns(), None);
        assert!((0..10).all(|i| draw_at(&mut record, i)));
    }

    #[test]
    fn test_disabled_target_never_draws() {
        let mut record = TargetRecord::new(1, (), TargetOptions::with_max_fps(30));
        record.enabled = false;
        assert!(!(0..100).any(|i| draw_at(&mut record, i * FRAME_5MS)));

        record.enabled = true;
        assert!(draw_at(&mut record, 100 * FRAME_5MS));
    }

    #[test]
    fn test_first_capped_draw_is_immediate() {
        let mut record = TargetRecord::new(1, (), TargetOptions::with_max_fps(30));
        assert!(draw_at(&mut record, 0));
        assert!(!draw_at(&mut record, 1));
    }

    #[test]
    fn test_throttle_caps_draw_rate() {
        let mut record = TargetRecord::new(1, (), TargetOptions::with_max_fps(30));
        let interval = record.interval_ns().unwrap();
        assert_eq!(interval, 33_333_333);

        let draws: Vec<u64> = (0..100)
            .map(|i| i * FRAME_5MS)
            .filter(|&now| draw_at(&mut record, now))
            .collect();
        for pair in draws.windows(2) {
            assert!(pair[1] - pair[0] >= interval);
        }
        // 500 ms at 30 fps, sampled every 5 ms
        assert!(draws.len() <= 16, "{} draws", draws.len());
        assert!(draws.len() >= 14, "{} draws", draws.len());
    }

    #[test]
    fn test_refused_draw_keeps_timer() {
        let mut record = TargetRecord::new(1, (), TargetOptions::with_max_fps(10));
        assert!(draw_at(&mut record, 0));
        assert!(!draw_at(&mut record, 50_000_000));
        assert!(draw_at(&mut record, 100_000_000));
    }

    #[test]
    fn test_unpresented_frame_leaves_throttle_unarmed() {
        let mut record = TargetRecord::new(1, (), TargetOptions::with_max_fps(30));
        assert!(record.is_due(0));
        assert!(record.is_due(1));

        record.arm(1);
        assert!(!record.is_due(2));
        assert!(record.is_due(1 + record.interval_ns().unwrap()));
    }

    #[test]
    fn test_inverted_target_uses_flipped_mirror() {
        let normal = TargetRecord::new(1, (), TargetOptions::default());
        let inverted = TargetRecord::new(2, (), TargetOptions::default().inverted(true));

        assert_eq!(normal.mvp(MirrorMode::Normal), Mat4::IDENTITY);
        assert_eq!(inverted.mvp(MirrorMode::Normal), Mat4::scale(1.0, -1.0, 1.0));
        assert_eq!(inverted.mvp(MirrorMode::Vertical), Mat4::IDENTITY);
        assert_eq!(inverted.mvp(MirrorMode::Horizontal), Mat4::scale(-1.0, -1.0, 1.0));
    }
}
