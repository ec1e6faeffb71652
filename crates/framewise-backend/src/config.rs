use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use framewise_types::{FilterError, FilterResult};

use crate::contract::DnnBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Native,
    TensorFlow,
    OpenVino,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Native => "native",
            BackendKind::TensorFlow => "tensorflow",
            BackendKind::OpenVino => "openvino",
        }
    }
}

impl FromStr for BackendKind {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "native" => Ok(BackendKind::Native),
            "tensorflow" => Ok(BackendKind::TensorFlow),
            "openvino" => Ok(BackendKind::OpenVino),
            other => Err(FilterError::configuration(format!(
                "unknown dnn backend '{other}'"
            ))),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backends compiled into this build.
pub fn available_backends() -> Vec<BackendKind> {
    let mut kinds = vec![BackendKind::Native];
    #[cfg(feature = "backend-tensorflow")]
    kinds.push(BackendKind::TensorFlow);
    #[cfg(feature = "backend-openvino")]
    kinds.push(BackendKind::OpenVino);
    kinds
}

/// Everything a backend needs to produce a ready model handle.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub kind: BackendKind,
    pub model: PathBuf,
    pub input_name: String,
    pub output_name: String,
    pub batch_size: usize,
    /// Backend-specific options string, e.g. `device=CPU`.
    pub options: Option<String>,
}

/// Load a model with the configured backend and apply the batch reshape.
pub fn load_model(config: &ModelConfig) -> FilterResult<Arc<dyn DnnBackend>> {
    if config.batch_size == 0 {
        return Err(FilterError::configuration("batch_size must be at least 1"));
    }
    match config.kind {
        BackendKind::Native => {
            let mut backend = crate::backends::native::NativeBackend::load(config)?;
            backend.reshape_batch(config.batch_size)?;
            Ok(Arc::new(backend))
        }
        BackendKind::TensorFlow => {
            #[cfg(feature = "backend-tensorflow")]
            {
                let mut backend = crate::backends::tensorflow::TensorFlowBackend::load(config)?;
                backend.reshape_batch(config.batch_size)?;
                Ok(Arc::new(backend))
            }
            #[cfg(not(feature = "backend-tensorflow"))]
            {
                Err(unsupported(BackendKind::TensorFlow))
            }
        }
        BackendKind::OpenVino => {
            #[cfg(feature = "backend-openvino")]
            {
                let mut backend = crate::backends::openvino::OpenVinoBackend::load(config)?;
                backend.reshape_batch(config.batch_size)?;
                Ok(Arc::new(backend))
            }
            #[cfg(not(feature = "backend-openvino"))]
            {
                Err(unsupported(BackendKind::OpenVino))
            }
        }
    }
}

#[allow(dead_code)]
fn unsupported(kind: BackendKind) -> FilterError {
    FilterError::configuration(format!(
        "{kind} backend is not compiled into this build"
    ))
}
