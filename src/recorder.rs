use crate::error::Result;
use crate::events::{CloseReason, EventBus, PipelineEvent};
use crate::frame::Frame;
use crate::motion::MotionDetector;
use crate::pipeline::FrameConsumer;
use crate::preroll::PreRollBuffer;
use crate::sink::{artifact_filename, write_still, Sink, SinkOpener};
use crate::storage::RetentionPolicy;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Recording bounds and artifact locations, derived from configuration
#[derive(Debug, Clone)]
pub struct RecorderSettings {
    pub device_id: String,
    pub video_dir: PathBuf,
    /// Well-known still snapshot path; None disables the export
    pub still_path: Option<PathBuf>,
    pub fps: u32,
    /// Frames a session keeps writing even after motion subsides
    pub min_frames: u64,
    /// Hard cap on frames per session
    pub max_frames: u64,
}

/// Summary of one finalized recording session
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub path: PathBuf,
    /// Sequence number of the frame that triggered the session
    pub first_seq: u64,
    /// Sequence number of the last frame written
    pub last_seq: u64,
    pub frame_count: u64,
    pub started_at: SystemTime,
}

/// Counters for the controller's lifetime
#[derive(Debug, Clone, Copy, Default)]
pub struct RecorderStats {
    pub frames_processed: u64,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub sessions_failed: u64,
}

struct RecordingSession {
    id: String,
    path: PathBuf,
    sink: Box<dyn Sink>,
    trigger_seq: u64,
    last_seq: u64,
    /// Everything written, including the background and pre-roll frames
    frame_count: u64,
    /// Live frames only; the min/max duration bounds count these
    live_frames: u64,
    started_at: SystemTime,
}

/// Drives the motion detector and the recording state machine.
///
/// Every frame is analyzed and fed to the pre-roll ring. When motion is
/// confirmed a session opens: storage is pruned, a sink is created, the
/// background estimate and the buffered pre-roll are written ahead of the
/// live frames. A session closes when motion subsides after the minimum
/// length, or unconditionally at the maximum length. A sink that fails to
/// open keeps the controller idle rather than stopping analysis; a sink that
/// fails mid-write abandons the session and surfaces the error.
pub struct RecorderController {
    settings: RecorderSettings,
    detector: MotionDetector,
    preroll: Arc<PreRollBuffer>,
    opener: Box<dyn SinkOpener>,
    retention: Option<RetentionPolicy>,
    events: EventBus,
    session: Option<RecordingSession>,
    records: Vec<SessionRecord>,
    stats: RecorderStats,
    last_motion: bool,
}

impl RecorderController {
    pub fn new(
        settings: RecorderSettings,
        detector: MotionDetector,
        preroll: Arc<PreRollBuffer>,
        opener: Box<dyn SinkOpener>,
        retention: Option<RetentionPolicy>,
        events: EventBus,
    ) -> Self {
        Self {
            settings,
            detector,
            preroll,
            opener,
            retention,
            events,
            session: None,
            records: Vec::new(),
            stats: RecorderStats::default(),
            last_motion: false,
        }
    }

    pub fn stats(&self) -> RecorderStats {
        self.stats
    }

    /// Finalized sessions, in order of completion
    pub fn records(&self) -> &[SessionRecord] {
        &self.records
    }

    pub fn session_active(&self) -> bool {
        self.session.is_some()
    }

    /// Analyze one frame and advance the recording state machine
    pub fn process_frame(&mut self, frame: Frame) -> Result<()> {
        self.stats.frames_processed += 1;

        let motion = self.detector.process(&frame)?;
        if motion != self.last_motion {
            self.last_motion = motion;
            if motion {
                self.events.publish(PipelineEvent::MotionStarted {
                    seq: frame.seq,
                    score: self.detector.state().score,
                });
            } else {
                self.events.publish(PipelineEvent::MotionStopped { seq: frame.seq });
            }
        }

        if let Some(session) = self.session.as_ref() {
            if session.live_frames >= self.settings.max_frames {
                self.close_session(CloseReason::MaxLength)?;
            } else if !motion && session.live_frames > self.settings.min_frames {
                self.close_session(CloseReason::MotionEnded)?;
            }
        }

        if self.session.is_some() {
            self.append(&frame, true)?;
        } else if motion {
            self.open_session(&frame)?;
        }

        self.preroll.push(frame);
        Ok(())
    }

    /// Flush any open session at end of stream
    pub fn finish(&mut self) -> Result<()> {
        if self.session.is_some() {
            debug!("End of stream with an open session, finalizing");
            self.close_session(CloseReason::EndOfStream)?;
        }
        Ok(())
    }

    fn open_session(&mut self, frame: &Frame) -> Result<()> {
        if let Some(policy) = self.retention.as_ref() {
            if let Err(e) = policy.ensure_space() {
                warn!("Pruning pass failed, opening session anyway: {}", e);
            }
        }

        let name = artifact_filename(
            frame.timestamp,
            &self.settings.device_id,
            self.opener.extension(),
        );
        let path = self.settings.video_dir.join(name);

        let sink = match self
            .opener
            .open(&path, frame.width, frame.height, self.settings.fps)
        {
            Ok(sink) => sink,
            Err(e) => {
                warn!(
                    "Could not open recording sink at {}, staying idle: {}",
                    path.display(),
                    e
                );
                self.events.publish(PipelineEvent::SessionFailed {
                    path,
                    error: e.to_string(),
                });
                self.stats.sessions_failed += 1;
                return Ok(());
            }
        };

        let id = Uuid::new_v4().to_string();
        info!(
            "Recording session {} opened at {} (trigger frame {})",
            id,
            path.display(),
            frame.seq
        );
        self.events.publish(PipelineEvent::SessionOpened {
            session_id: id.clone(),
            path: path.clone(),
        });
        self.stats.sessions_opened += 1;
        self.session = Some(RecordingSession {
            id,
            path,
            sink,
            trigger_seq: frame.seq,
            last_seq: frame.seq,
            frame_count: 0,
            live_frames: 0,
            started_at: frame.timestamp,
        });

        // Scene context for external consumers, never fatal to the session
        if let Some(still_path) = self.settings.still_path.clone() {
            if let Err(e) = write_still(frame, &still_path) {
                warn!("Still export to {} failed: {}", still_path.display(), e);
            }
        }

        if let Some(background) = self.detector.background_frame(frame) {
            self.append(&background, false)?;
        }
        for buffered in self.preroll.snapshot() {
            self.append(&buffered, false)?;
        }
        self.append(frame, true)
    }

    fn append(&mut self, frame: &Frame, live: bool) -> Result<()> {
        let mut session = match self.session.take() {
            Some(session) => session,
            None => return Ok(()),
        };

        match session.sink.write(frame) {
            Ok(()) => {
                session.frame_count += 1;
                if live {
                    session.live_frames += 1;
                }
                session.last_seq = frame.seq;
                self.session = Some(session);
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Write failed for session {}, abandoning it: {}",
                    session.id, e
                );
                if let Err(finish_err) = session.sink.finish() {
                    warn!(
                        "Finalizing {} after the write failure also failed: {}",
                        session.path.display(),
                        finish_err
                    );
                }
                self.events.publish(PipelineEvent::SessionClosed {
                    session_id: session.id,
                    path: session.path,
                    frames: session.frame_count,
                    reason: CloseReason::WriteError,
                });
                self.stats.sessions_failed += 1;
                Err(e)
            }
        }
    }

    fn close_session(&mut self, reason: CloseReason) -> Result<()> {
        let mut session = match self.session.take() {
            Some(session) => session,
            None => return Ok(()),
        };

        match session.sink.finish() {
            Ok(()) => {
                info!(
                    "Recording session {} closed ({:?}, {} frames)",
                    session.id, reason, session.frame_count
                );
                self.events.publish(PipelineEvent::SessionClosed {
                    session_id: session.id.clone(),
                    path: session.path.clone(),
                    frames: session.frame_count,
                    reason,
                });
                self.stats.sessions_closed += 1;
                self.records.push(SessionRecord {
                    id: session.id,
                    path: session.path,
                    first_seq: session.trigger_seq,
                    last_seq: session.last_seq,
                    frame_count: session.frame_count,
                    started_at: session.started_at,
                });
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Finalizing session {} at {} failed: {}",
                    session.id,
                    session.path.display(),
                    e
                );
                self.events.publish(PipelineEvent::SessionFailed {
                    path: session.path,
                    error: e.to_string(),
                });
                self.stats.sessions_failed += 1;
                Err(e)
            }
        }
    }
}

impl FrameConsumer for RecorderController {
    fn consume(&mut self, frame: Frame) -> Result<()> {
        self.process_frame(frame)
    }

    fn finish(&mut self) -> Result<()> {
        RecorderController::finish(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::UpdatePolicy;
    use crate::motion::{DetectorSettings, ReferenceMode};
    use crate::sink::MemoryOpener;

    fn still_frame(seq: u64) -> Frame {
        Frame::new(seq, SystemTime::now(), vec![60u8; 64 * 64], 64, 64)
    }

    fn block_frame(seq: u64) -> Frame {
        let mut data = vec![60u8; 64 * 64];
        for y in 10..50 {
            for x in 10..50 {
                data[y * 64 + x] = 255;
            }
        }
        Frame::new(seq, SystemTime::now(), data, 64, 64)
    }

    fn settings(min_frames: u64, max_frames: u64) -> RecorderSettings {
        RecorderSettings {
            device_id: "trap-test".to_string(),
            video_dir: PathBuf::from("/virtual/videos"),
            still_path: None,
            fps: 10,
            min_frames,
            max_frames,
        }
    }

    // Rolling minimum pins the background to the still scene, keeping the
    // per-frame scoring in these tests deterministic.
    fn background_detector() -> MotionDetector {
        MotionDetector::new(
            DetectorSettings::default(),
            ReferenceMode::Background,
            UpdatePolicy::RollingMinimum,
        )
        .unwrap()
    }

    fn controller(
        settings: RecorderSettings,
        detector: MotionDetector,
        preroll_capacity: usize,
        opener: MemoryOpener,
    ) -> RecorderController {
        RecorderController::new(
            settings,
            detector,
            Arc::new(PreRollBuffer::new(preroll_capacity).unwrap()),
            Box::new(opener),
            None,
            EventBus::new(64),
        )
    }

    #[test]
    fn test_still_scene_never_opens_a_session() {
        let opener = MemoryOpener::new();
        let artifacts = opener.artifacts();
        let mut controller = controller(settings(5, 200), background_detector(), 4, opener);

        for seq in 0..200 {
            controller.process_frame(still_frame(seq)).unwrap();
        }
        controller.finish().unwrap();

        assert!(artifacts.lock().is_empty());
        assert_eq!(controller.stats().sessions_opened, 0);
        assert_eq!(controller.stats().frames_processed, 200);
    }

    #[test]
    fn test_session_includes_background_preroll_and_live_frames() {
        let opener = MemoryOpener::new();
        let artifacts = opener.artifacts();
        let mut controller = controller(settings(5, 200), background_detector(), 4, opener);

        // One still frame seeds the background; eleven motion frames cross
        // the trigger threshold on frame 11.
        controller.process_frame(still_frame(0)).unwrap();
        for seq in 1..=11 {
            controller.process_frame(block_frame(seq)).unwrap();
        }
        assert!(controller.session_active());

        // Motion subsides; the score decays to zero and the session closes
        // once past the minimum length.
        for seq in 12..40 {
            controller.process_frame(still_frame(seq)).unwrap();
        }
        assert!(!controller.session_active());

        let artifacts = artifacts.lock();
        assert_eq!(artifacts.len(), 1);
        assert!(artifacts[0].finished);
        // Background frame (template seq 11), pre-roll 7..=10, then live
        // frames 11..=21: score 11 decays to zero on frame 22, which closes
        // the session before being written.
        assert_eq!(
            artifacts[0].frame_seqs,
            vec![11, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21]
        );

        let records = controller.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].first_seq, 11);
        assert_eq!(records[0].last_seq, 21);
        assert_eq!(records[0].frame_count, 16);
    }

    #[test]
    fn test_session_keeps_writing_through_lull_under_min_length() {
        let opener = MemoryOpener::new();
        let artifacts = opener.artifacts();
        // Minimum length far beyond the motion burst
        let mut controller = controller(settings(50, 200), background_detector(), 4, opener);

        controller.process_frame(still_frame(0)).unwrap();
        for seq in 1..=11 {
            controller.process_frame(block_frame(seq)).unwrap();
        }
        // Long lull: motion exits but the session must stay open and keep
        // appending until the minimum length is reached.
        for seq in 12..45 {
            controller.process_frame(still_frame(seq)).unwrap();
            assert!(controller.session_active());
        }
        for seq in 45..80 {
            controller.process_frame(still_frame(seq)).unwrap();
        }
        assert!(!controller.session_active());

        let artifacts = artifacts.lock();
        assert_eq!(artifacts.len(), 1);
        // 1 background + 4 pre-roll + at least min_frames live frames
        assert!(artifacts[0].frame_seqs.len() as u64 > 50);
    }

    #[test]
    fn test_max_length_forces_close_and_reopens_under_motion() {
        let opener = MemoryOpener::new();
        let artifacts = opener.artifacts();
        let mut controller = controller(settings(2, 10), background_detector(), 4, opener);

        controller.process_frame(still_frame(0)).unwrap();
        for seq in 1..30 {
            controller.process_frame(block_frame(seq)).unwrap();
        }
        controller.finish().unwrap();

        let artifacts = artifacts.lock();
        // Continuous motion rolls over into fresh sessions at the cap
        assert!(artifacts.len() >= 2);
        // Background + 4 pre-roll + exactly max_frames live frames
        assert_eq!(artifacts[0].frame_seqs.len(), 15);
        assert!(artifacts[0].finished);
        assert!(artifacts[1].finished);
    }

    #[test]
    fn test_end_of_stream_flushes_open_session() {
        let opener = MemoryOpener::new();
        let artifacts = opener.artifacts();
        let mut controller = controller(settings(50, 200), background_detector(), 4, opener);

        controller.process_frame(still_frame(0)).unwrap();
        for seq in 1..=12 {
            controller.process_frame(block_frame(seq)).unwrap();
        }
        assert!(controller.session_active());
        controller.finish().unwrap();

        let artifacts = artifacts.lock();
        assert_eq!(artifacts.len(), 1);
        assert!(artifacts[0].finished);
        assert_eq!(controller.stats().sessions_closed, 1);
    }

    #[test]
    fn test_open_failure_keeps_analyzing_and_recovers() {
        let mut opener = MemoryOpener::new();
        opener.fail_next_open();
        let artifacts = opener.artifacts();
        let mut controller = controller(settings(5, 200), background_detector(), 4, opener);
        let mut events = {
            // Fresh bus with a subscriber attached before any publishing
            let bus = EventBus::new(64);
            let rx = bus.subscribe();
            controller.events = bus;
            rx
        };

        controller.process_frame(still_frame(0)).unwrap();
        for seq in 1..=11 {
            // The failed open must not surface as a processing error
            controller.process_frame(block_frame(seq)).unwrap();
        }
        assert_eq!(controller.stats().sessions_failed, 1);

        // Motion continues; the very next frame retries and succeeds
        controller.process_frame(block_frame(12)).unwrap();
        assert!(controller.session_active());
        assert_eq!(artifacts.lock().len(), 1);

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            if event.event_type() == "session_failed" {
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[test]
    fn test_write_failure_abandons_session() {
        let mut opener = MemoryOpener::new();
        // Background + 4 pre-roll + trigger frame succeed, then two more
        // live frames, then the sink starts failing.
        opener.fail_write_after(8);
        let artifacts = opener.artifacts();
        let mut controller = controller(settings(5, 200), background_detector(), 4, opener);

        controller.process_frame(still_frame(0)).unwrap();
        for seq in 1..=13 {
            controller.process_frame(block_frame(seq)).unwrap();
        }
        assert!(controller.process_frame(block_frame(14)).is_err());

        assert!(!controller.session_active());
        assert_eq!(controller.stats().sessions_failed, 1);
        let artifacts = artifacts.lock();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].frame_seqs.len(), 8);
        // Best-effort finalize after the failure
        assert!(artifacts[0].finished);
    }

    #[test]
    fn test_lagged_reference_end_to_end_scenario() {
        let opener = MemoryOpener::new();
        let artifacts = opener.artifacts();
        let detector = MotionDetector::new(
            DetectorSettings::default(),
            ReferenceMode::LaggedFrame { window: 50 },
            UpdatePolicy::RollingMinimum,
        )
        .unwrap();
        let mut controller = controller(settings(100, 1200), detector, 50, opener);
        let mut events = {
            let bus = EventBus::new(256);
            let rx = bus.subscribe();
            controller.events = bus;
            rx
        };

        // Quiet scene, a 20-frame intruder, then quiet again
        for seq in 0..50 {
            controller.process_frame(still_frame(seq)).unwrap();
        }
        for seq in 50..70 {
            controller.process_frame(block_frame(seq)).unwrap();
        }
        for seq in 70..240 {
            controller.process_frame(still_frame(seq)).unwrap();
        }
        controller.finish().unwrap();

        // Exactly one session for the whole event, even though the lagged
        // reference produces a motion echo one window after the intruder
        // leaves: the echo lands while the session is still under its
        // minimum length, so it extends the session instead of splitting it.
        let artifacts = artifacts.lock();
        assert_eq!(artifacts.len(), 1);
        assert!(artifacts[0].finished);

        let seqs = &artifacts[0].frame_seqs;
        // Background frame first (template is the trigger frame 60)
        assert_eq!(seqs[0], 60);
        // Then the full pre-roll window, oldest to newest
        let preroll: Vec<u64> = (10..60).collect();
        assert_eq!(&seqs[1..51], preroll.as_slice());
        // Live frames 60..=160: the session honors the minimum length of
        // 100 live frames past the trigger, then closes on frame 161
        assert_eq!(seqs[51], 60);
        assert_eq!(*seqs.last().unwrap(), 160);
        assert_eq!(seqs.len(), 152);

        let records = controller.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].frame_count, 152);
        assert_eq!(records[0].first_seq, 60);
        assert_eq!(records[0].last_seq, 160);

        // The event stream shows the trigger, the echo, and one session
        let mut opened = 0;
        let mut closed = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                PipelineEvent::SessionOpened { .. } => opened += 1,
                PipelineEvent::SessionClosed { frames, reason, .. } => {
                    closed += 1;
                    assert_eq!(frames, 152);
                    assert_eq!(reason, CloseReason::MotionEnded);
                }
                _ => {}
            }
        }
        assert_eq!(opened, 1);
        assert_eq!(closed, 1);
    }
}
