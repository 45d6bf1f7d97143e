use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::trace;

/// Why a recording session was finalized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    /// Motion subsided after the minimum length was reached
    MotionEnded,
    /// The hard session length cap was hit
    MaxLength,
    /// End-of-stream flush
    EndOfStream,
    /// The session was abandoned after a sink write failure
    WriteError,
}

/// Observable state-machine transitions of the recording pipeline.
///
/// Every transition the controller takes is published here (and logged), so
/// a detected motion event is never silently dropped even when the write
/// later fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    /// The hysteresis counter crossed the trigger threshold
    MotionStarted { seq: u64, score: u8 },
    /// The hysteresis counter decayed back to zero
    MotionStopped { seq: u64 },
    /// A recording session opened at the given artifact path
    SessionOpened { session_id: String, path: PathBuf },
    /// A recording session was finalized
    SessionClosed {
        session_id: String,
        path: PathBuf,
        frames: u64,
        reason: CloseReason,
    },
    /// Opening a session failed; the controller stays idle
    SessionFailed { path: PathBuf, error: String },
}

impl PipelineEvent {
    /// Get the event type as a string for filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            PipelineEvent::MotionStarted { .. } => "motion_started",
            PipelineEvent::MotionStopped { .. } => "motion_stopped",
            PipelineEvent::SessionOpened { .. } => "session_opened",
            PipelineEvent::SessionClosed { .. } => "session_closed",
            PipelineEvent::SessionFailed { .. } => "session_failed",
        }
    }
}

/// Broadcast event bus for pipeline diagnostics.
///
/// Cheap to clone; publishing without any subscriber is a no-op, keeping the
/// bus off the critical recording path.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    /// Create a new event bus with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers
    pub fn publish(&self, event: PipelineEvent) {
        trace!("Publishing event: {}", event.event_type());
        // A send error only means there are no subscribers right now.
        let _ = self.sender.send(event);
    }

    /// Subscribe to pipeline events
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
