use crate::{
    annotate::{AnnotateError, Annotator},
    artifact::{ArtifactError, TempArtifact},
    encoder::{encode_jpeg, frame_chunk, EncodeError},
    sampler::{FrameSampler, FrameSource, FrameStride, SampledFrame, SamplerError, VideoOpener},
    telemetry::Metrics,
};
use bytes::Bytes;
use futures::{stream, Stream, StreamExt};
use opencv::core::Mat;
use std::{
    path::PathBuf,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_stream::wrappers::ReceiverStream;
use tracing::instrument;

const TRACK_ROUTE: &str = "/track/video";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Failed to receive upload: {0}")]
    Receive(String),
    #[error("Temporary storage error: {0}")]
    Artifact(#[from] ArtifactError),
    #[error("Failed to decode video: {0}")]
    Decode(SamplerError),
    #[error("Detection failed: {0}")]
    Upstream(#[from] AnnotateError),
    #[error("Encoding failed: {0}")]
    Encode(#[from] EncodeError),
    #[error("Worker failed: {0}")]
    Worker(String),
    #[error("HTTP builder error: {0}")]
    HttpBuilder(String),
}

impl PipelineError {
    pub fn is_client_error(&self) -> bool {
        matches!(self, PipelineError::InvalidInput(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Receiving,
    Decoding,
    Streaming,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOutcome {
    pub state: PipelineState,
    pub frames_decoded: u64,
    pub frames_sent: u64,
    pub disconnected: bool,
}

impl StreamOutcome {
    fn new() -> Self {
        Self {
            state: PipelineState::Receiving,
            frames_decoded: 0,
            frames_sent: 0,
            disconnected: false,
        }
    }

    fn transition(&mut self, state: PipelineState) {
        tracing::debug!("Pipeline {:?} -> {:?}", self.state, state);
        self.state = state;
    }
}

#[derive(Clone)]
pub struct StreamSettings {
    pub stride: FrameStride,
    pub release_grace: Duration,
    pub metrics: Option<Arc<Metrics>>,
}

/// Turns one sampled frame into one multipart chunk.
pub trait FrameStage<F>: Send + 'static {
    fn render(&mut self, sampled: SampledFrame<F>) -> Result<Bytes, PipelineError>;
}

/// Annotate, JPEG-encode and frame a decoded video frame.
pub struct DetectionStage {
    annotator: Annotator,
    jpeg_quality: i32,
    metrics: Option<Arc<Metrics>>,
}

impl DetectionStage {
    pub fn new(annotator: Annotator, jpeg_quality: i32, metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            annotator,
            jpeg_quality,
            metrics,
        }
    }
}

impl FrameStage<Mat> for DetectionStage {
    fn render(&mut self, sampled: SampledFrame<Mat>) -> Result<Bytes, PipelineError> {
        let mut frame = sampled.frame;
        let started = Instant::now();
        let detections = self.annotator.annotate(&mut frame)?;
        if let Some(metrics) = &self.metrics {
            metrics.record_inference_duration(started.elapsed().as_millis() as u64, TRACK_ROUTE);
        }
        tracing::debug!(
            "Frame {} annotated with {} detections",
            sampled.index,
            detections.len()
        );

        let jpeg = encode_jpeg(&frame, self.jpeg_quality)?;
        Ok(frame_chunk(&jpeg))
    }
}

/// Resources a stream worker must give back on every exit path: the decode
/// source first, then (after the grace period) the uploaded file.
struct RequestResources<S: FrameSource> {
    sampler: Option<FrameSampler<S>>,
    artifact: Option<TempArtifact>,
    release_grace: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl<S: FrameSource> RequestResources<S> {
    fn artifact_path(&self) -> PathBuf {
        self.artifact
            .as_ref()
            .map(|a| a.path().to_path_buf())
            .unwrap_or_default()
    }
}

impl<S: FrameSource> Drop for RequestResources<S> {
    fn drop(&mut self) {
        if let Some(mut sampler) = self.sampler.take() {
            sampler.release();
            drop(sampler);
            if !self.release_grace.is_zero() {
                thread::sleep(self.release_grace);
            }
        }
        if let Some(artifact) = self.artifact.take() {
            if let Ok(age) = artifact.created_at().elapsed() {
                tracing::debug!("Releasing upload held for {:?}", age);
            }
            if !artifact.release() {
                if let Some(metrics) = &self.metrics {
                    metrics.record_cleanup_failure();
                }
            }
        }
    }
}

/// The receiving half of a running stream worker.
pub struct FrameStream {
    pub frames: mpsc::Receiver<Result<Bytes, PipelineError>>,
    pub worker: JoinHandle<StreamOutcome>,
}

impl FrameStream {
    /// Waits for the first pipeline item so that failures before any chunk
    /// is produced can still be reported with a status code. Later failures
    /// end the returned stream with an error.
    pub async fn start(
        mut self,
    ) -> Result<impl Stream<Item = Result<Bytes, PipelineError>> + Send + 'static, PipelineError>
    {
        let first = match self.frames.recv().await {
            Some(Ok(chunk)) => Some(chunk),
            Some(Err(e)) => return Err(e),
            None => {
                if let Err(e) = (&mut self.worker).await {
                    return Err(PipelineError::Worker(e.to_string()));
                }
                None
            }
        };

        let rest = ReceiverStream::new(self.frames);
        Ok(stream::iter(first.map(Ok)).chain(rest))
    }
}

/// Runs decode -> annotate -> encode for one uploaded video on the blocking
/// pool. The channel holds at most one chunk, so a slow client stalls the
/// decode loop instead of growing a buffer.
pub fn spawn_stream<O, P>(
    opener: Arc<O>,
    stage: P,
    artifact: TempArtifact,
    settings: StreamSettings,
) -> FrameStream
where
    O: VideoOpener,
    P: FrameStage<<O::Source as FrameSource>::Frame>,
{
    let (tx, rx) = mpsc::channel(1);
    let span = tracing::Span::current();
    let worker = tokio::task::spawn_blocking(move || {
        let _entered = span.enter();
        run_stream(opener.as_ref(), stage, artifact, settings, tx)
    });

    FrameStream { frames: rx, worker }
}

#[instrument(skip_all)]
fn run_stream<O, P>(
    opener: &O,
    mut stage: P,
    artifact: TempArtifact,
    settings: StreamSettings,
    tx: mpsc::Sender<Result<Bytes, PipelineError>>,
) -> StreamOutcome
where
    O: VideoOpener,
    P: FrameStage<<O::Source as FrameSource>::Frame>,
{
    let mut outcome = StreamOutcome::new();
    let mut resources = RequestResources {
        sampler: None,
        artifact: Some(artifact),
        release_grace: settings.release_grace,
        metrics: settings.metrics.clone(),
    };

    let result = drive(opener, &mut stage, &mut resources, &settings, &tx, &mut outcome);

    // Released before the final send: the client must not see the stream end
    // while the upload still exists.
    drop(resources);

    if let Err(e) = result {
        outcome.transition(PipelineState::Failed);
        if outcome.frames_sent == 0 {
            tracing::warn!("Request failed before streaming: {}", e);
        } else {
            tracing::error!(
                "Stream aborted after {} frames: {}",
                outcome.frames_sent,
                e
            );
        }
        let _ = tx.blocking_send(Err(e));
    }

    tracing::info!(
        "Stream finished: state={:?} decoded={} sent={} disconnected={}",
        outcome.state,
        outcome.frames_decoded,
        outcome.frames_sent,
        outcome.disconnected
    );
    outcome
}

fn drive<O, P>(
    opener: &O,
    stage: &mut P,
    resources: &mut RequestResources<O::Source>,
    settings: &StreamSettings,
    tx: &mpsc::Sender<Result<Bytes, PipelineError>>,
    outcome: &mut StreamOutcome,
) -> Result<(), PipelineError>
where
    O: VideoOpener,
    P: FrameStage<<O::Source as FrameSource>::Frame>,
{
    outcome.transition(PipelineState::Decoding);
    let path = resources.artifact_path();
    let source = opener
        .open(&path)
        .map_err(|e| PipelineError::InvalidInput(e.to_string()))?;
    let sampler = resources
        .sampler
        .insert(FrameSampler::new(source, settings.stride));

    outcome.transition(PipelineState::Streaming);
    loop {
        if tx.is_closed() {
            outcome.disconnected = true;
            break;
        }

        let next = sampler.next_sampled();
        outcome.frames_decoded = sampler.decoded();
        let Some(sampled) = next.map_err(PipelineError::Decode)? else {
            break;
        };

        let chunk = stage.render(sampled)?;
        if tx.blocking_send(Ok(chunk)).is_err() {
            outcome.disconnected = true;
            break;
        }
        outcome.frames_sent += 1;
        if let Some(metrics) = &settings.metrics {
            metrics.record_frame_streamed();
        }
    }

    if outcome.disconnected {
        tracing::info!("Client disconnected, stopping decode loop");
    }
    outcome.transition(PipelineState::Completed);
    Ok(())
}
