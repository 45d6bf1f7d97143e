use crate::background::UpdatePolicy;
use crate::motion::{DetectorSettings, ReferenceMode};
use crate::recorder::RecorderSettings;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TrapcamConfig {
    pub capture: CaptureConfig,
    pub detector: DetectorConfig,
    pub recording: RecordingConfig,
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CaptureConfig {
    /// Stable device identifier, encoded into artifact filenames
    #[serde(default = "default_device_id")]
    pub device_id: String,

    /// Frame resolution (width, height)
    #[serde(default = "default_resolution")]
    pub resolution: (u32, u32),

    /// Nominal capture rate in frames per second
    #[serde(default = "default_fps")]
    pub fps: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DetectorConfig {
    /// Intensity cutoff for the per-pixel difference mask (0-255)
    #[serde(default = "default_delta_threshold")]
    pub delta_threshold: u32,

    /// Erosion kernel size while idle (conservative trigger)
    #[serde(default = "default_trigger_kernel_size")]
    pub trigger_kernel_size: u32,

    /// Erosion kernel size while recording (sensitive continuation)
    #[serde(default = "default_recording_kernel_size")]
    pub recording_kernel_size: u32,

    /// Upper bound of the hysteresis counter
    #[serde(default = "default_score_cap")]
    pub score_cap: u32,

    /// Counter value that must be exceeded to enter the motion state
    #[serde(default = "default_trigger_score")]
    pub trigger_score: u32,

    /// Reference frame strategy: "lagged" or "background"
    #[serde(default = "default_reference")]
    pub reference: String,

    /// Lag of the delayed reference frame, in seconds
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u32,

    /// Background update policy: "average" or "minimum"
    #[serde(default = "default_background_policy")]
    pub background_policy: String,

    /// Averaging window for the "average" background policy
    #[serde(default = "default_average_window")]
    pub average_window: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RecordingConfig {
    /// Directory for recorded video artifacts
    #[serde(default = "default_video_dir")]
    pub video_dir: String,

    /// Well-known path for the session-start still snapshot
    #[serde(default = "default_still_path")]
    pub still_path: String,

    /// Export a still snapshot when a session opens
    #[serde(default = "default_export_still")]
    pub export_still: bool,

    /// Pre-roll context retained before a trigger, in seconds
    #[serde(default = "default_preroll_seconds")]
    pub preroll_seconds: u32,

    /// Minimum session length once triggered, in seconds
    #[serde(default = "default_min_seconds")]
    pub min_seconds: u32,

    /// Hard cap on session length, in seconds
    #[serde(default = "default_max_seconds")]
    pub max_seconds: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// Prune the oldest artifacts before opening a new session
    #[serde(default = "default_prune_old")]
    pub prune_old: bool,

    /// Disk usage percentage above which pruning kicks in
    #[serde(default = "default_max_disk_usage_percent")]
    pub max_disk_usage_percent: f32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PipelineConfig {
    /// Bounded frame queue capacity for the producer/consumer shape
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Event bus capacity
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

impl TrapcamConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("trapcam.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("capture.device_id", default_device_id())?
            .set_default(
                "capture.resolution",
                vec![default_resolution().0, default_resolution().1],
            )?
            .set_default("capture.fps", default_fps())?
            .set_default("detector.delta_threshold", default_delta_threshold())?
            .set_default(
                "detector.trigger_kernel_size",
                default_trigger_kernel_size(),
            )?
            .set_default(
                "detector.recording_kernel_size",
                default_recording_kernel_size(),
            )?
            .set_default("detector.score_cap", default_score_cap())?
            .set_default("detector.trigger_score", default_trigger_score())?
            .set_default("detector.reference", default_reference())?
            .set_default("detector.window_seconds", default_window_seconds())?
            .set_default("detector.background_policy", default_background_policy())?
            .set_default("detector.average_window", default_average_window())?
            .set_default("recording.video_dir", default_video_dir())?
            .set_default("recording.still_path", default_still_path())?
            .set_default("recording.export_still", default_export_still())?
            .set_default("recording.preroll_seconds", default_preroll_seconds())?
            .set_default("recording.min_seconds", default_min_seconds())?
            .set_default("recording.max_seconds", default_max_seconds())?
            .set_default("storage.prune_old", default_prune_old())?
            .set_default(
                "storage.max_disk_usage_percent",
                default_max_disk_usage_percent() as f64,
            )?
            .set_default(
                "pipeline.queue_capacity",
                default_queue_capacity() as i64,
            )?
            .set_default(
                "pipeline.event_bus_capacity",
                default_event_bus_capacity() as i64,
            )?
            .add_source(File::with_name(&path_str).required(false))
            .add_source(Environment::with_prefix("TRAPCAM").separator("_"))
            .build()?;

        let config: TrapcamConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// Invalid dimensions, rates or buffer sizes fail here, at construction
    /// time, never during frame processing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capture.device_id.trim().is_empty() {
            return Err(ConfigError::Message(
                "Device id must not be empty".to_string(),
            ));
        }

        if self.capture.resolution.0 == 0 || self.capture.resolution.1 == 0 {
            return Err(ConfigError::Message(
                "Frame resolution must be greater than 0".to_string(),
            ));
        }

        if self.capture.fps == 0 {
            return Err(ConfigError::Message(
                "Capture fps must be greater than 0".to_string(),
            ));
        }

        if self.detector.delta_threshold == 0 || self.detector.delta_threshold > 255 {
            return Err(ConfigError::Message(
                "Delta threshold must be in 1..=255".to_string(),
            ));
        }

        if self.detector.trigger_kernel_size == 0
            || self.detector.trigger_kernel_size > 255
            || self.detector.recording_kernel_size == 0
            || self.detector.recording_kernel_size > 255
        {
            return Err(ConfigError::Message(
                "Erosion kernel sizes must be in 1..=255".to_string(),
            ));
        }

        if self.detector.trigger_score == 0
            || self.detector.score_cap <= self.detector.trigger_score
            || self.detector.score_cap > 255
        {
            return Err(ConfigError::Message(
                "Hysteresis scores must satisfy 0 < trigger_score < score_cap <= 255".to_string(),
            ));
        }

        if self.detector.window_seconds == 0 {
            return Err(ConfigError::Message(
                "Detector window_seconds must be greater than 0".to_string(),
            ));
        }

        let reference = self.detector.reference.to_ascii_lowercase();
        if reference != "lagged" && reference != "background" {
            return Err(ConfigError::Message(format!(
                "Unknown reference mode '{}' (expected 'lagged' or 'background')",
                self.detector.reference
            )));
        }

        let policy = self.detector.background_policy.to_ascii_lowercase();
        if policy != "average" && policy != "minimum" {
            return Err(ConfigError::Message(format!(
                "Unknown background policy '{}' (expected 'average' or 'minimum')",
                self.detector.background_policy
            )));
        }

        if self.detector.average_window == 0 {
            return Err(ConfigError::Message(
                "Background average_window must be greater than 0".to_string(),
            ));
        }

        if self.recording.preroll_seconds == 0 {
            return Err(ConfigError::Message(
                "Recording preroll_seconds must be greater than 0".to_string(),
            ));
        }

        if self.recording.min_seconds >= self.recording.max_seconds {
            return Err(ConfigError::Message(
                "Recording min_seconds must be less than max_seconds".to_string(),
            ));
        }

        if self.storage.max_disk_usage_percent <= 0.0
            || self.storage.max_disk_usage_percent > 100.0
        {
            return Err(ConfigError::Message(
                "max_disk_usage_percent must be in (0, 100]".to_string(),
            ));
        }

        if self.pipeline.queue_capacity == 0 {
            return Err(ConfigError::Message(
                "Pipeline queue capacity must be greater than 0".to_string(),
            ));
        }

        if self.pipeline.event_bus_capacity == 0 {
            return Err(ConfigError::Message(
                "Event bus capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Detector thresholds and kernel sizes, narrowed to their working types.
    /// Assumes `validate()` has passed.
    pub fn detector_settings(&self) -> DetectorSettings {
        DetectorSettings {
            delta_threshold: self.detector.delta_threshold as u8,
            trigger_kernel_size: self.detector.trigger_kernel_size as u8,
            recording_kernel_size: self.detector.recording_kernel_size as u8,
            score_cap: self.detector.score_cap as u8,
            trigger_score: self.detector.trigger_score as u8,
        }
    }

    pub fn reference_mode(&self) -> ReferenceMode {
        match self.detector.reference.to_ascii_lowercase().as_str() {
            "background" => ReferenceMode::Background,
            _ => ReferenceMode::LaggedFrame {
                window: self.capture.fps as usize * self.detector.window_seconds as usize,
            },
        }
    }

    pub fn update_policy(&self) -> UpdatePolicy {
        match self.detector.background_policy.to_ascii_lowercase().as_str() {
            "minimum" => UpdatePolicy::RollingMinimum,
            _ => UpdatePolicy::CountedAverage {
                window: self.detector.average_window,
            },
        }
    }

    pub fn recorder_settings(&self) -> RecorderSettings {
        RecorderSettings {
            device_id: self.capture.device_id.clone(),
            video_dir: PathBuf::from(&self.recording.video_dir),
            still_path: if self.recording.export_still {
                Some(PathBuf::from(&self.recording.still_path))
            } else {
                None
            },
            fps: self.capture.fps,
            min_frames: self.recording.min_seconds as u64 * self.capture.fps as u64,
            max_frames: self.recording.max_seconds as u64 * self.capture.fps as u64,
        }
    }

    /// Pre-roll ring capacity in frames
    pub fn preroll_capacity(&self) -> usize {
        self.capture.fps as usize * self.recording.preroll_seconds as usize
    }
}

impl Default for TrapcamConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig {
                device_id: default_device_id(),
                resolution: default_resolution(),
                fps: default_fps(),
            },
            detector: DetectorConfig {
                delta_threshold: default_delta_threshold(),
                trigger_kernel_size: default_trigger_kernel_size(),
                recording_kernel_size: default_recording_kernel_size(),
                score_cap: default_score_cap(),
                trigger_score: default_trigger_score(),
                reference: default_reference(),
                window_seconds: default_window_seconds(),
                background_policy: default_background_policy(),
                average_window: default_average_window(),
            },
            recording: RecordingConfig {
                video_dir: default_video_dir(),
                still_path: default_still_path(),
                export_still: default_export_still(),
                preroll_seconds: default_preroll_seconds(),
                min_seconds: default_min_seconds(),
                max_seconds: default_max_seconds(),
            },
            storage: StorageConfig {
                prune_old: default_prune_old(),
                max_disk_usage_percent: default_max_disk_usage_percent(),
            },
            pipeline: PipelineConfig {
                queue_capacity: default_queue_capacity(),
                event_bus_capacity: default_event_bus_capacity(),
            },
        }
    }
}

// Default value functions
fn default_device_id() -> String {
    "trapcam-0".to_string()
}
fn default_resolution() -> (u32, u32) {
    (640, 480)
}
fn default_fps() -> u32 {
    10
}

fn default_delta_threshold() -> u32 {
    25
}
fn default_trigger_kernel_size() -> u32 {
    15
}
fn default_recording_kernel_size() -> u32 {
    10
}
fn default_score_cap() -> u32 {
    30
}
fn default_trigger_score() -> u32 {
    10
}
fn default_reference() -> String {
    "lagged".to_string()
}
fn default_window_seconds() -> u32 {
    5
}
fn default_background_policy() -> String {
    "average".to_string()
}
fn default_average_window() -> u32 {
    1000
}

fn default_video_dir() -> String {
    "./videos".to_string()
}
fn default_still_path() -> String {
    "./still.png".to_string()
}
fn default_export_still() -> bool {
    true
}
fn default_preroll_seconds() -> u32 {
    5
}
fn default_min_seconds() -> u32 {
    10
}
fn default_max_seconds() -> u32 {
    120
}

fn default_prune_old() -> bool {
    true
}
fn default_max_disk_usage_percent() -> f32 {
    80.0
}

fn default_queue_capacity() -> usize {
    64
}
fn default_event_bus_capacity() -> usize {
    100
}
