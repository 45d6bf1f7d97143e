pub mod background;
pub mod config;
pub mod error;
pub mod events;
pub mod frame;
pub mod motion;
pub mod pipeline;
pub mod preroll;
pub mod recorder;
pub mod report;
pub mod sink;
pub mod source;
pub mod storage;

pub use background::{BackgroundModel, UpdatePolicy};
pub use config::TrapcamConfig;
pub use error::{Result, TrapcamError};
pub use events::{CloseReason, EventBus, PipelineEvent};
pub use frame::Frame;
pub use motion::{DetectorSettings, MotionDetector, MotionState, ReferenceMode};
pub use pipeline::{run_sequential, FrameConsumer, FrameSender, Pipeline};
pub use preroll::PreRollBuffer;
pub use recorder::{RecorderController, RecorderSettings, RecorderStats, SessionRecord};
pub use report::{MotionOutcome, TagApi};
pub use sink::{
    artifact_filename, write_still, MemoryOpener, RawVideoOpener, RawVideoSink, Sink, SinkOpener,
};
pub use source::{FrameSource, ImageDirSource};
pub use storage::{DiskUsage, PruneResult, QuotaProbe, RetentionPolicy, StatvfsProbe};
