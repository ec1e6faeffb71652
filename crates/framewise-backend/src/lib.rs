//! Pluggable inference backends for the framewise filter stage.
//!
//! The filter core talks to every model runtime through the [`DnnBackend`]
//! and [`InferenceSession`] traits. The `native` backend is always compiled
//! and keeps the default build free of vendor SDKs; the OpenVINO and
//! TensorFlow backends live behind cargo features.

mod config;
mod contract;
mod worker;

pub mod backends;

pub use config::{BackendKind, ModelConfig, available_backends, load_model};
pub use contract::{Completion, DnnBackend, InferenceSession};
