use image::GrayImage;
use tracing::debug;

/// Background update policy.
///
/// Both variants ship because both are legitimate trade-offs: the rolling
/// minimum is cheap but permanently biased toward the darkest value a pixel
/// has shown, the counted average tracks gradual lighting drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// Per-pixel `min(background, frame)`
    RollingMinimum,
    /// Counted average up to `window` frames, then fixed-window
    /// exponential smoothing with weight `1 / window`
    CountedAverage { window: u32 },
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        UpdatePolicy::CountedAverage { window: 1000 }
    }
}

/// Running estimate of the static scene, updated on every frame.
///
/// The estimate is seeded from the first frame and accumulates in `f32` so
/// the averaging policy does not lose precision to repeated u8 rounding. It
/// persists for the lifetime of the detector and is never reset.
pub struct BackgroundModel {
    policy: UpdatePolicy,
    estimate: Option<Vec<f32>>,
    width: u32,
    height: u32,
    frames_seen: u64,
}

impl BackgroundModel {
    pub fn new(policy: UpdatePolicy) -> Self {
        Self {
            policy,
            estimate: None,
            width: 0,
            height: 0,
            frames_seen: 0,
        }
    }

    /// Whether the model has been seeded with a first frame
    pub fn seeded(&self) -> bool {
        self.estimate.is_some()
    }

    /// Number of frames folded into the estimate, including the seed
    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    /// Fold a frame into the estimate.
    ///
    /// The caller (the detector) guarantees stable dimensions for the
    /// lifetime of the model.
    pub fn update(&mut self, frame: &GrayImage) {
        let (width, height) = frame.dimensions();

        let estimate = match self.estimate.as_mut() {
            None => {
                debug!("Seeding background model from first frame ({}x{})", width, height);
                self.estimate = Some(frame.pixels().map(|p| p[0] as f32).collect());
                self.width = width;
                self.height = height;
                self.frames_seen = 1;
                return;
            }
            Some(estimate) => {
                debug_assert_eq!((width, height), (self.width, self.height));
                estimate
            }
        };

        match self.policy {
            UpdatePolicy::RollingMinimum => {
                for (est, pixel) in estimate.iter_mut().zip(frame.pixels()) {
                    let value = pixel[0] as f32;
                    if value < *est {
                        *est = value;
                    }
                }
            }
            UpdatePolicy::CountedAverage { window } => {
                let n = self.frames_seen as f32;
                let window = window as f32;
                if self.frames_seen < window as u64 {
                    for (est, pixel) in estimate.iter_mut().zip(frame.pixels()) {
                        *est = (*est * n + pixel[0] as f32) / (n + 1.0);
                    }
                } else {
                    for (est, pixel) in estimate.iter_mut().zip(frame.pixels()) {
                        *est = (*est * (window - 1.0) + pixel[0] as f32) / window;
                    }
                }
            }
        }

        self.frames_seen += 1;
    }

    /// Render the current estimate as an 8-bit grayscale image.
    ///
    /// Returns a copy; the live estimate is never exposed.
    pub fn snapshot(&self) -> Option<GrayImage> {
        let estimate = self.estimate.as_ref()?;
        let rendered: Vec<u8> = estimate
            .iter()
            .map(|v| v.round().clamp(0.0, 255.0) as u8)
            .collect();
        GrayImage::from_raw(self.width, self.height, rendered)
    }
}
