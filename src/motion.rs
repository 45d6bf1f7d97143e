use crate::background::{BackgroundModel, UpdatePolicy};
use crate::error::{Result, TrapcamError};
use crate::frame::Frame;
use config::ConfigError;
use image::GrayImage;
use imageproc::contrast::threshold;
use imageproc::distance_transform::Norm;
use imageproc::morphology::erode;
use tracing::{debug, info, trace};

/// Detector thresholds and kernel sizes
#[derive(Debug, Clone, Copy)]
pub struct DetectorSettings {
    /// Intensity cutoff for the binary change mask (of 255)
    pub delta_threshold: u8,
    /// Erosion kernel size while idle
    pub trigger_kernel_size: u8,
    /// Erosion kernel size while in motion
    pub recording_kernel_size: u8,
    /// Upper bound of the hysteresis counter
    pub score_cap: u8,
    /// Counter value that must be exceeded to enter the motion state
    pub trigger_score: u8,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            delta_threshold: 25,
            trigger_kernel_size: 15,
            recording_kernel_size: 10,
            score_cap: 30,
            trigger_score: 10,
        }
    }
}

/// Which reference frame the per-pixel difference is computed against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceMode {
    /// The live background estimate
    Background,
    /// A frame lagged by `window` frames, from a delay ring.
    /// More robust against slow background drift.
    LaggedFrame { window: usize },
}

/// Hysteresis state of the motion decision
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MotionState {
    pub is_motion: bool,
    /// Bounded accumulator, always within `0..=score_cap`
    pub score: u8,
}

/// Delay ring holding the lagged reference frames
struct DelayRing {
    slots: Vec<Option<GrayImage>>,
    cursor: usize,
}

impl DelayRing {
    fn new(window: usize) -> Self {
        Self {
            slots: vec![None; window],
            cursor: 0,
        }
    }

    /// The frame about to be overwritten, i.e. the oldest one.
    /// None until the ring has wrapped once.
    fn oldest(&self) -> Option<GrayImage> {
        self.slots[self.cursor].clone()
    }

    fn push(&mut self, frame: GrayImage) {
        self.slots[self.cursor] = Some(frame);
        self.cursor = (self.cursor + 1) % self.slots.len();
    }
}

/// Frame-over-frame motion decision with hysteresis.
///
/// Each frame is differenced against a reference, thresholded, eroded to
/// suppress sensor noise, and the surviving pixel count drives a bounded
/// counter. Asymmetric enter/exit thresholds prevent rapid flapping, and the
/// erosion kernel shrinks while in motion so triggering stays conservative
/// while continuation stays sensitive.
pub struct MotionDetector {
    settings: DetectorSettings,
    delay: Option<DelayRing>,
    background: BackgroundModel,
    state: MotionState,
    dims: Option<(u32, u32)>,
}

impl MotionDetector {
    pub fn new(
        settings: DetectorSettings,
        reference: ReferenceMode,
        policy: UpdatePolicy,
    ) -> Result<Self> {
        if settings.delta_threshold == 0 {
            return Err(TrapcamError::Config(ConfigError::Message(
                "Delta threshold must be greater than 0".to_string(),
            )));
        }
        if settings.trigger_kernel_size == 0 || settings.recording_kernel_size == 0 {
            return Err(TrapcamError::Config(ConfigError::Message(
                "Erosion kernel sizes must be greater than 0".to_string(),
            )));
        }
        if settings.trigger_score == 0 || settings.score_cap <= settings.trigger_score {
            return Err(TrapcamError::Config(ConfigError::Message(
                "Hysteresis scores must satisfy 0 < trigger_score < score_cap".to_string(),
            )));
        }

        let delay = match reference {
            ReferenceMode::Background => None,
            ReferenceMode::LaggedFrame { window } => {
                if window == 0 {
                    return Err(TrapcamError::Config(ConfigError::Message(
                        "Lagged reference window must be greater than 0".to_string(),
                    )));
                }
                Some(DelayRing::new(window))
            }
        };

        Ok(Self {
            settings,
            delay,
            background: BackgroundModel::new(policy),
            state: MotionState::default(),
            dims: None,
        })
    }

    /// Current hysteresis state (copy)
    pub fn state(&self) -> MotionState {
        self.state
    }

    /// Render the background estimate as a frame for scene context,
    /// reusing the sequence number and timestamp of `template`.
    pub fn background_frame(&self, template: &Frame) -> Option<Frame> {
        self.background
            .snapshot()
            .map(|image| Frame::from_gray_image(template, image))
    }

    /// Process one frame and return the post-transition motion decision.
    ///
    /// The background model and the delay ring advance on every frame,
    /// regardless of the decision, so the reference never goes stale during
    /// long motion events.
    pub fn process(&mut self, frame: &Frame) -> Result<bool> {
        match self.dims {
            None => self.dims = Some((frame.width, frame.height)),
            Some(dims) if dims != (frame.width, frame.height) => {
                return Err(TrapcamError::invalid_frame(format!(
                    "frame {} is {}x{} but the detector was seeded with {}x{}",
                    frame.seq, frame.width, frame.height, dims.0, dims.1
                )));
            }
            Some(_) => {}
        }

        let gray = frame.to_gray_image()?;

        let reference = match self.delay.as_ref() {
            Some(ring) => ring.oldest(),
            None => self.background.snapshot(),
        };

        if let Some(ring) = self.delay.as_mut() {
            ring.push(gray.clone());
        }
        self.background.update(&gray);

        let reference = match reference {
            Some(reference) => reference,
            None => {
                trace!("Frame {}: reference not yet seeded, no decision", frame.seq);
                return Ok(self.state.is_motion);
            }
        };

        let delta = absolute_difference(&reference, &gray);
        let mask = threshold(&delta, self.settings.delta_threshold);

        // imageproc's L-inf erosion uses a (2k+1)-sided square, so the
        // configured kernel size maps to radius size / 2.
        let kernel_size = if self.state.is_motion {
            self.settings.recording_kernel_size
        } else {
            self.settings.trigger_kernel_size
        };
        let eroded = erode(&mask, Norm::LInf, kernel_size / 2);

        let changed = eroded.pixels().filter(|p| p[0] > 0).count();

        if changed > 0 {
            self.state.score = self
                .state
                .score
                .saturating_add(1)
                .min(self.settings.score_cap);
        } else {
            self.state.score = self.state.score.saturating_sub(1);
        }

        trace!(
            "Frame {}: {} changed pixels, score {}",
            frame.seq,
            changed,
            self.state.score
        );

        if !self.state.is_motion && self.state.score > self.settings.trigger_score {
            self.state.is_motion = true;
            info!(
                "Motion started at frame {} (score {})",
                frame.seq, self.state.score
            );
        } else if self.state.is_motion && self.state.score == 0 {
            self.state.is_motion = false;
            debug!("Motion stopped at frame {}", frame.seq);
        }

        Ok(self.state.is_motion)
    }
}

/// Absolute per-pixel difference of two equally sized grayscale images
fn absolute_difference(a: &GrayImage, b: &GrayImage) -> GrayImage {
    let (width, height) = a.dimensions();
    let mut delta = GrayImage::new(width, height);
    for (delta_pixel, (pa, pb)) in delta.pixels_mut().zip(a.pixels().zip(b.pixels())) {
        delta_pixel[0] = pa[0].abs_diff(pb[0]);
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn still_frame(seq: u64) -> Frame {
        Frame::new(seq, SystemTime::now(), vec![60u8; 64 * 64], 64, 64)
    }

    /// A frame with a bright square of the given side length
    fn block_frame(seq: u64, side: usize) -> Frame {
        let mut data = vec![60u8; 64 * 64];
        for y in 10..10 + side {
            for x in 10..10 + side {
                data[y * 64 + x] = 255;
            }
        }
        Frame::new(seq, SystemTime::now(), data, 64, 64)
    }

    // Rolling minimum keeps the background pinned to the still scene, which
    // makes the per-frame scoring in these tests deterministic.
    fn background_detector() -> MotionDetector {
        MotionDetector::new(
            DetectorSettings::default(),
            ReferenceMode::Background,
            UpdatePolicy::RollingMinimum,
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_invalid_settings() {
        let mut settings = DetectorSettings::default();
        settings.trigger_score = 30;
        settings.score_cap = 30;
        assert!(MotionDetector::new(
            settings,
            ReferenceMode::Background,
            UpdatePolicy::default()
        )
        .is_err());

        assert!(MotionDetector::new(
            DetectorSettings::default(),
            ReferenceMode::LaggedFrame { window: 0 },
            UpdatePolicy::default()
        )
        .is_err());
    }

    #[test]
    fn test_identical_frames_never_trigger() {
        let mut detector = background_detector();
        for seq in 0..200 {
            let motion = detector.process(&still_frame(seq)).unwrap();
            assert!(!motion);
            assert_eq!(detector.state().score, 0);
        }
    }

    #[test]
    fn test_no_motion_on_second_identical_frame_after_restart() {
        let mut detector = background_detector();
        assert!(!detector.process(&still_frame(0)).unwrap());
        assert!(!detector.process(&still_frame(1)).unwrap());
        assert_eq!(detector.state().score, 0);
    }

    #[test]
    fn test_lagged_mode_makes_no_decision_until_window_filled() {
        let mut detector = MotionDetector::new(
            DetectorSettings::default(),
            ReferenceMode::LaggedFrame { window: 10 },
            UpdatePolicy::default(),
        )
        .unwrap();

        // The window is seeded with still frames; even a large foreground
        // block cannot be judged before a reference exists.
        for seq in 0..9 {
            assert!(!detector.process(&block_frame(seq, 40)).unwrap());
            assert_eq!(detector.state().score, 0);
        }
    }

    #[test]
    fn test_trigger_after_score_crosses_threshold() {
        let mut detector = background_detector();
        detector.process(&still_frame(0)).unwrap();

        // Scores 1..=10 keep the detector idle; the 11th motion frame
        // crosses the threshold.
        for seq in 1..=10 {
            assert!(!detector.process(&block_frame(seq, 40)).unwrap());
        }
        assert!(detector.process(&block_frame(11, 40)).unwrap());
        assert_eq!(detector.state().score, 11);
    }

    #[test]
    fn test_score_stays_within_bounds() {
        let mut detector = background_detector();
        detector.process(&still_frame(0)).unwrap();

        for seq in 1..100 {
            detector.process(&block_frame(seq, 40)).unwrap();
            assert!(detector.state().score <= 30);
        }
        assert_eq!(detector.state().score, 30);

        for seq in 100..200 {
            detector.process(&still_frame(seq)).unwrap();
        }
        assert_eq!(detector.state().score, 0);
        assert!(!detector.state().is_motion);
    }

    #[test]
    fn test_score_saturates_at_maximum_cap() {
        let mut settings = DetectorSettings::default();
        settings.score_cap = u8::MAX;
        let mut detector = MotionDetector::new(
            settings,
            ReferenceMode::Background,
            UpdatePolicy::RollingMinimum,
        )
        .unwrap();
        detector.process(&still_frame(0)).unwrap();

        // Enough consecutive motion frames to reach and sit on the cap
        for seq in 1..300 {
            assert!(detector.process(&block_frame(seq, 40)).is_ok());
            assert!(detector.state().score <= u8::MAX);
        }
        assert_eq!(detector.state().score, u8::MAX);
        assert!(detector.state().is_motion);
    }

    #[test]
    fn test_exit_requires_score_zero() {
        let mut detector = background_detector();
        detector.process(&still_frame(0)).unwrap();

        for seq in 1..=15 {
            detector.process(&block_frame(seq, 40)).unwrap();
        }
        assert!(detector.state().is_motion);

        // Still in motion while the score decays
        let mut seq = 16;
        while detector.state().score > 1 {
            assert!(detector.process(&still_frame(seq)).unwrap());
            seq += 1;
        }
        // The decrement to zero exits the motion state on that same step
        assert!(!detector.process(&still_frame(seq)).unwrap());
        assert!(!detector.state().is_motion);
    }

    #[test]
    fn test_trigger_kernel_suppresses_small_motion() {
        let mut detector = background_detector();
        detector.process(&still_frame(0)).unwrap();

        // A 12x12 block is eroded away by the idle 15x15 kernel
        for seq in 1..50 {
            assert!(!detector.process(&block_frame(seq, 12)).unwrap());
            assert_eq!(detector.state().score, 0);
        }
    }

    #[test]
    fn test_recording_kernel_keeps_small_motion_alive() {
        let mut detector = background_detector();
        detector.process(&still_frame(0)).unwrap();

        // Trigger with a large block first
        for seq in 1..=12 {
            detector.process(&block_frame(seq, 40)).unwrap();
        }
        assert!(detector.state().is_motion);
        let score_at_trigger = detector.state().score;

        // The same 12x12 block that cannot trigger keeps an active event
        // alive through the smaller recording kernel
        assert!(detector.process(&block_frame(13, 12)).unwrap());
        assert!(detector.state().score >= score_at_trigger);
    }

    #[test]
    fn test_dimension_change_is_an_error() {
        let mut detector = background_detector();
        detector.process(&still_frame(0)).unwrap();

        let shrunk = Frame::new(1, SystemTime::now(), vec![60u8; 32 * 32], 32, 32);
        assert!(detector.process(&shrunk).is_err());
    }

    #[test]
    fn test_background_frame_uses_template_identity() {
        let mut detector = background_detector();
        assert!(detector.background_frame(&still_frame(0)).is_none());

        detector.process(&still_frame(7)).unwrap();
        let template = still_frame(9);
        let background = detector.background_frame(&template).unwrap();
        assert_eq!(background.seq, 9);
        assert_eq!(background.data.as_ref(), still_frame(0).data.as_ref());
    }
}
