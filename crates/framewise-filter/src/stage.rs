//! The filter-stage adapter: per-stream negotiation, the
//! submit/poll/end-of-stream edge, and a stream integration for pipelines
//! that move frames through channels.

use std::pin::Pin;
use std::time::Duration;

use futures_core::Stream;
use futures_util::StreamExt;
use futures_util::stream::unfold;
use tokio::sync::mpsc::{self, Sender};

use framewise_backend::{ModelConfig, load_model};
use framewise_types::{FilterResult, PixelFormat, VideoFrame};

use crate::engine::InferenceEngine;
use crate::inflight::PolledFrame;
use crate::options::StageOptions;
use crate::transcode::Transcoder;

pub type FrameStream = Pin<Box<dyn Stream<Item = FilterResult<VideoFrame>> + Send>>;

const STREAM_CHANNEL_CAPACITY: usize = 8;

/// Everything produced by the end-of-stream drain: the remaining frames in
/// order and the timestamp to propagate downstream.
pub struct EndOfStream {
    pub frames: Vec<VideoFrame>,
    pub timestamp: Option<Duration>,
}

pub struct FilterStage {
    name: String,
    engine: InferenceEngine,
    flushed: bool,
    last_output_timestamp: Option<Duration>,
    dropped_frames: u64,
}

impl std::fmt::Debug for FilterStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterStage")
            .field("name", &self.name)
            .field("flushed", &self.flushed)
            .field("last_output_timestamp", &self.last_output_timestamp)
            .field("dropped_frames", &self.dropped_frames)
            .finish()
    }
}

impl FilterStage {
    /// Negotiate a stream of `format` frames at `width` x `height` against
    /// the configured model. Configuration and model-load failures fail the
    /// stage here; nothing is deferred to the data path.
    pub fn new(
        options: &StageOptions,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> FilterResult<Self> {
        options.validate()?;
        let batch_size = if options.async_mode { options.batch_size } else { 1 };
        let model = load_model(&ModelConfig {
            kind: options.backend,
            model: options.model.clone(),
            input_name: options.input_name.clone(),
            output_name: options.output_name.clone(),
            batch_size,
            options: options.backend_options.clone(),
        })?;
        let transcoder = Transcoder::new(
            format,
            width,
            height,
            model.input_desc(&options.input_name)?,
            model.output_desc(&options.output_name)?,
        )?;
        tracing::info!(
            stage = %options.stage_name,
            backend = %options.backend,
            model = %options.model.display(),
            %format,
            width,
            height,
            nireq = options.nireq,
            batch_size,
            "configured dnn filter stage"
        );
        let engine = InferenceEngine::new(
            model,
            transcoder,
            options.output_name.clone(),
            options.nireq,
            options.async_mode,
        )?;
        Ok(Self {
            name: options.stage_name.clone(),
            engine,
            flushed: false,
            last_output_timestamp: None,
            dropped_frames: 0,
        })
    }

    /// Hand one input frame to the stage, taking ownership.
    pub fn submit(&mut self, frame: VideoFrame) -> FilterResult<()> {
        if self.flushed {
            return Err(framewise_types::FilterError::Shutdown);
        }
        self.engine.submit(frame)
    }

    /// Next transformed frame in submission order, if one is ready. Failed
    /// frames are logged, counted, and skipped.
    pub fn poll(&mut self) -> Option<VideoFrame> {
        loop {
            match self.engine.poll()? {
                PolledFrame::Frame(frame) => {
                    if frame.timestamp().is_some() {
                        self.last_output_timestamp = frame.timestamp();
                    }
                    return Some(frame);
                }
                PolledFrame::Dropped {
                    timestamp,
                    frame_index,
                } => {
                    tracing::warn!(
                        stage = %self.name,
                        ?timestamp,
                        ?frame_index,
                        "dropping frame whose inference failed"
                    );
                    self.dropped_frames += 1;
                }
            }
        }
    }

    /// Upstream end-of-stream. Flushes at most once, drains every pending
    /// frame, and reports the timestamp to forward downstream: the last
    /// produced timestamp, or the upstream-provided fallback when nothing
    /// was drained.
    pub fn signal_end_of_stream(
        &mut self,
        last_pts: Option<Duration>,
    ) -> FilterResult<EndOfStream> {
        if !self.flushed {
            self.flushed = true;
            self.engine.flush()?;
        }
        let mut frames = Vec::new();
        while let Some(frame) = self.poll() {
            frames.push(frame);
        }
        Ok(EndOfStream {
            timestamp: self.last_output_timestamp.or(last_pts),
            frames,
        })
    }

    /// Frames dropped so far after per-frame execution failures.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    pub fn is_empty(&self) -> bool {
        self.engine.is_empty()
    }

    /// Run the stage over a frame stream: submit while upstream produces,
    /// forward every ready output, then flush on end-of-stream. The
    /// returned stream yields transformed frames in submission order.
    pub fn into_stream(mut self, input: FrameStream) -> FrameStream {
        let (input_tx, mut input_rx) =
            mpsc::channel::<FilterResult<VideoFrame>>(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut input = input;
            while let Some(item) = input.next().await {
                if input_tx.send(item).await.is_err() {
                    break;
                }
            }
        });

        spawn_stream_from_channel(STREAM_CHANNEL_CAPACITY, move |tx| {
            while let Some(item) = input_rx.blocking_recv() {
                match item {
                    Ok(frame) => {
                        if let Err(err) = self.submit(frame) {
                            tracing::error!(stage = %self.name, error = %err, "submit failed");
                            let _ = tx.blocking_send(Err(err));
                            break;
                        }
                        while let Some(output) = self.poll() {
                            if tx.blocking_send(Ok(output)).is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        let _ = tx.blocking_send(Err(err));
                        break;
                    }
                }
            }
            match self.signal_end_of_stream(None) {
                Ok(end) => {
                    for frame in end.frames {
                        if tx.blocking_send(Ok(frame)).is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    let _ = tx.blocking_send(Err(err));
                }
            }
        })
    }
}

/// Run a blocking producer on its own task and expose its output as a
/// stream.
pub fn spawn_stream_from_channel(
    capacity: usize,
    task: impl FnOnce(Sender<FilterResult<VideoFrame>>) + Send + 'static,
) -> FrameStream {
    let (tx, rx) = mpsc::channel(capacity);
    tokio::task::spawn_blocking(move || task(tx));
    let stream = unfold(rx, |mut receiver| async {
        receiver.recv().await.map(|item| (item, receiver))
    });
    Box::pin(stream)
}
