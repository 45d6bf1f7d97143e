use crate::error::{Result, TrapcamError};
use crate::frame::Frame;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

/// Accepts ordered frames and finalizes them into a persisted artifact.
///
/// Failure to open is fatal for that session attempt; a failure mid-write is
/// surfaced to the caller, which decides on the drop policy.
pub trait Sink: Send {
    fn write(&mut self, frame: &Frame) -> Result<()>;

    /// Finalize and flush to durable storage
    fn finish(&mut self) -> Result<()>;
}

/// Opens sinks for new recording sessions
pub trait SinkOpener: Send {
    fn open(&mut self, path: &Path, width: u32, height: u32, fps: u32) -> Result<Box<dyn Sink>>;

    /// Artifact file extension, without the dot
    fn extension(&self) -> &str;
}

/// Generate an artifact filename encoding the capture timestamp and a stable
/// device identifier, so concurrent devices writing to shared storage never
/// collide.
pub fn artifact_filename(timestamp: SystemTime, device_id: &str, extension: &str) -> String {
    let local: DateTime<Local> = timestamp.into();
    format!(
        "{}_{}.{}",
        local.format("%Y-%m-%d_%H.%M.%S%.3f"),
        device_id,
        extension
    )
}

/// Export one representative frame as a PNG to a well-known location.
///
/// Fire-and-forget scene context for external consumers (e.g. a thumbnail
/// service); never on the critical recording path.
pub fn write_still(frame: &Frame, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    image::save_buffer(
        path,
        frame.data.as_ref(),
        frame.width,
        frame.height,
        image::ColorType::L8,
    )
    .map_err(|e| TrapcamError::component("still_export", e.to_string()))?;
    debug!("Exported still snapshot to {}", path.display());
    Ok(())
}

/// File sink writing a minimal self-describing raw luma stream.
///
/// The artifact format is deliberately trivial (magic, dimensions, fps, then
/// raw frames); transcoding to a distributable container is an external
/// concern.
pub struct RawVideoSink {
    writer: BufWriter<File>,
    path: PathBuf,
    frames_written: u64,
}

const RAW_MAGIC: &[u8; 8] = b"TRAPCAM1";

impl RawVideoSink {
    pub fn create(path: &Path, width: u32, height: u32, fps: u32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| TrapcamError::SinkOpen {
                    path: path.display().to_string(),
                    source: e,
                })?;
            }
        }

        let file = File::create(path).map_err(|e| TrapcamError::SinkOpen {
            path: path.display().to_string(),
            source: e,
        })?;
        let mut writer = BufWriter::new(file);

        let header_result = writer
            .write_all(RAW_MAGIC)
            .and_then(|_| writer.write_all(&width.to_le_bytes()))
            .and_then(|_| writer.write_all(&height.to_le_bytes()))
            .and_then(|_| writer.write_all(&fps.to_le_bytes()));
        header_result.map_err(|e| TrapcamError::SinkOpen {
            path: path.display().to_string(),
            source: e,
        })?;

        Ok(Self {
            writer,
            path: path.to_path_buf(),
            frames_written: 0,
        })
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

impl Sink for RawVideoSink {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        self.writer
            .write_all(frame.data.as_ref())
            .map_err(|e| TrapcamError::SinkWrite {
                path: self.path.display().to_string(),
                source: e,
            })?;
        self.frames_written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush().map_err(|e| TrapcamError::SinkWrite {
            path: self.path.display().to_string(),
            source: e,
        })?;
        debug!(
            "Finalized {} ({} frames)",
            self.path.display(),
            self.frames_written
        );
        Ok(())
    }
}

impl Drop for RawVideoSink {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            warn!("Flush on drop failed for {}: {}", self.path.display(), e);
        }
    }
}

/// Opener for [`RawVideoSink`] artifacts
#[derive(Debug, Default)]
pub struct RawVideoOpener;

impl SinkOpener for RawVideoOpener {
    fn open(&mut self, path: &Path, width: u32, height: u32, fps: u32) -> Result<Box<dyn Sink>> {
        Ok(Box::new(RawVideoSink::create(path, width, height, fps)?))
    }

    fn extension(&self) -> &str {
        "rawv"
    }
}

/// One artifact captured by a [`MemoryOpener`]
#[derive(Debug, Clone)]
pub struct MemoryArtifact {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Sequence numbers of the frames written, in order
    pub frame_seqs: Vec<u64>,
    pub finished: bool,
}

/// In-memory sink opener, used as a test double for the recording path.
///
/// Supports failure injection for the open and write error branches.
#[derive(Default)]
pub struct MemoryOpener {
    artifacts: Arc<Mutex<Vec<MemoryArtifact>>>,
    fail_next_open: bool,
    fail_write_after: Option<u64>,
}

impl MemoryOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle to the captured artifacts
    pub fn artifacts(&self) -> Arc<Mutex<Vec<MemoryArtifact>>> {
        Arc::clone(&self.artifacts)
    }

    /// Make the next `open` call fail
    pub fn fail_next_open(&mut self) {
        self.fail_next_open = true;
    }

    /// Make sinks fail after the given number of successful writes
    pub fn fail_write_after(&mut self, writes: u64) {
        self.fail_write_after = Some(writes);
    }
}

impl SinkOpener for MemoryOpener {
    fn open(&mut self, path: &Path, width: u32, height: u32, fps: u32) -> Result<Box<dyn Sink>> {
        if self.fail_next_open {
            self.fail_next_open = false;
            return Err(TrapcamError::SinkOpen {
                path: path.display().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "injected open failure"),
            });
        }

        let index = {
            let mut artifacts = self.artifacts.lock();
            artifacts.push(MemoryArtifact {
                path: path.to_path_buf(),
                width,
                height,
                fps,
                frame_seqs: Vec::new(),
                finished: false,
            });
            artifacts.len() - 1
        };

        Ok(Box::new(MemorySink {
            artifacts: Arc::clone(&self.artifacts),
            index,
            path: path.to_path_buf(),
            writes_remaining: self.fail_write_after,
        }))
    }

    fn extension(&self) -> &str {
        "rawv"
    }
}

struct MemorySink {
    artifacts: Arc<Mutex<Vec<MemoryArtifact>>>,
    index: usize,
    path: PathBuf,
    writes_remaining: Option<u64>,
}

impl Sink for MemorySink {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        if let Some(remaining) = self.writes_remaining.as_mut() {
            if *remaining == 0 {
                return Err(TrapcamError::SinkWrite {
                    path: self.path.display().to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "injected write failure",
                    ),
                });
            }
            *remaining -= 1;
        }

        self.artifacts.lock()[self.index].frame_seqs.push(frame.seq);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.artifacts.lock()[self.index].finished = true;
        Ok(())
    }
}
