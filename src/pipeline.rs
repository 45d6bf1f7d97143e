use crate::error::{Result, TrapcamError};
use crate::frame::Frame;
use crate::source::FrameSource;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receives ordered frames from the pipeline.
///
/// A `consume` error means that frame could not be handled (e.g. a sink
/// write failed); the pipeline logs it and keeps delivering, since analysis
/// must continue even when persistence falters.
pub trait FrameConsumer: Send + 'static {
    fn consume(&mut self, frame: Frame) -> Result<()>;

    /// Flush at end of stream
    fn finish(&mut self) -> Result<()>;
}

enum FrameMessage {
    Frame(Frame),
    EndOfStream,
}

/// Producer handle feeding frames into a spawned pipeline.
///
/// Backed by a bounded queue: when analysis falls behind, `send` waits
/// rather than letting frames pile up unboundedly, so capture pacing is
/// inherited by the producer.
pub struct FrameSender {
    tx: mpsc::Sender<FrameMessage>,
}

impl FrameSender {
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.tx
            .send(FrameMessage::Frame(frame))
            .await
            .map_err(|_| TrapcamError::component("pipeline", "frame queue closed"))
    }

    /// Send from synchronous producer code, blocking while the queue is full
    pub fn blocking_send(&self, frame: Frame) -> Result<()> {
        self.tx
            .blocking_send(FrameMessage::Frame(frame))
            .map_err(|_| TrapcamError::component("pipeline", "frame queue closed"))
    }

    /// Signal end of stream; the consumer flushes and the task completes
    pub async fn end(&self) -> Result<()> {
        self.tx
            .send(FrameMessage::EndOfStream)
            .await
            .map_err(|_| TrapcamError::component("pipeline", "frame queue closed"))
    }

    pub fn blocking_end(&self) -> Result<()> {
        self.tx
            .blocking_send(FrameMessage::EndOfStream)
            .map_err(|_| TrapcamError::component("pipeline", "frame queue closed"))
    }
}

/// Producer/consumer shape of the pipeline.
///
/// The consumer runs on a blocking worker because frame analysis is CPU
/// bound; the bounded queue between producer and consumer preserves frame
/// order and provides backpressure.
pub struct Pipeline;

impl Pipeline {
    /// Spawn the consumer on a blocking worker behind a bounded queue.
    ///
    /// Returns the producer handle and the consumer's join handle; joining
    /// yields the consumer back for post-run inspection.
    pub fn spawn<C: FrameConsumer>(
        mut consumer: C,
        queue_capacity: usize,
    ) -> Result<(FrameSender, JoinHandle<Result<C>>)> {
        if queue_capacity == 0 {
            return Err(TrapcamError::component(
                "pipeline",
                "queue capacity must be greater than 0",
            ));
        }

        let (tx, mut rx) = mpsc::channel(queue_capacity);
        debug!("Spawning pipeline consumer (queue capacity {})", queue_capacity);

        let handle = tokio::task::spawn_blocking(move || {
            let mut delivered = 0u64;
            while let Some(message) = rx.blocking_recv() {
                match message {
                    FrameMessage::Frame(frame) => {
                        delivered += 1;
                        if let Err(e) = consumer.consume(frame) {
                            warn!("Consumer could not handle frame: {}", e);
                        }
                    }
                    FrameMessage::EndOfStream => break,
                }
            }
            consumer.finish()?;
            info!("Pipeline consumer finished after {} frames", delivered);
            Ok(consumer)
        });

        Ok((FrameSender { tx }, handle))
    }
}

/// Drain a source into a consumer on the calling thread.
///
/// The single-threaded shape for offline runs, where backpressure is
/// meaningless because the source is pulled at analysis speed anyway.
pub fn run_sequential<S, C>(source: &mut S, consumer: &mut C) -> Result<()>
where
    S: FrameSource + ?Sized,
    C: FrameConsumer,
{
    while let Some(frame) = source.next_frame()? {
        if let Err(e) = consumer.consume(frame) {
            warn!("Consumer could not handle frame: {}", e);
        }
    }
    consumer.finish()
}
