use crate::error::{Result, TrapcamError};
use crate::frame::Frame;
use config::ConfigError;
use parking_lot::RwLock;
use tracing::debug;

/// Fixed-capacity ring of the most recent frames.
///
/// The ring is always fed, recording or not, so that when motion is
/// confirmed the footage leading into the trigger is still available. Writes
/// overwrite the oldest slot; `snapshot` hands out an owned, ordered copy so
/// a preview or debug reader never observes the ring mid-write.
pub struct PreRollBuffer {
    inner: RwLock<Ring>,
    capacity: usize,
}

struct Ring {
    slots: Vec<Option<Frame>>,
    cursor: usize,
}

impl PreRollBuffer {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(TrapcamError::Config(ConfigError::Message(
                "Pre-roll capacity must be greater than 0".to_string(),
            )));
        }

        debug!("Created pre-roll buffer with capacity {}", capacity);

        Ok(Self {
            inner: RwLock::new(Ring {
                slots: vec![None; capacity],
                cursor: 0,
            }),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Push a frame, overwriting the oldest slot when full
    pub fn push(&self, frame: Frame) {
        let mut ring = self.inner.write();
        let cursor = ring.cursor;
        ring.slots[cursor] = Some(frame);
        ring.cursor = (cursor + 1) % self.capacity;
    }

    /// Number of frames currently held
    pub fn len(&self) -> usize {
        self.inner.read().slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All currently held frames, oldest to newest.
    ///
    /// A read-only copy, never a live view; frames themselves are cheap
    /// reference-counted clones.
    pub fn snapshot(&self) -> Vec<Frame> {
        let ring = self.inner.read();
        let mut frames = Vec::with_capacity(self.capacity);
        for offset in 0..self.capacity {
            let index = (ring.cursor + offset) % self.capacity;
            if let Some(frame) = ring.slots[index].as_ref() {
                frames.push(frame.clone());
            }
        }
        frames
    }
}
