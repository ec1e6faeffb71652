//! Video filter stage applying a deep-learning image model to every frame.
//!
//! Frames enter through [`FilterStage::submit`], run through a pluggable
//! inference backend (synchronously or batched over a pool of asynchronous
//! requests), and leave through [`FilterStage::poll`] in exactly the order
//! they were submitted, regardless of how the backend schedules its
//! completions.

mod engine;
mod inflight;
mod options;
mod resample;
mod slot_queue;
mod stage;
mod transcode;

pub use engine::InferenceEngine;
pub use inflight::PolledFrame;
pub use options::{MAX_BATCH_SIZE, MAX_NIREQ, StageOptions};
pub use stage::{EndOfStream, FilterStage, FrameStream, spawn_stream_from_channel};
pub use transcode::Transcoder;

pub use framewise_backend::{BackendKind, available_backends};
pub use framewise_types::{FilterError, FilterResult, PixelFormat, Plane, VideoFrame};
