use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use framewise_backend::BackendKind;
use framewise_types::{FilterError, FilterResult};

pub const MAX_NIREQ: usize = 128;
pub const MAX_BATCH_SIZE: usize = 1000;

const DEFAULT_NIREQ: usize = 8;
const DEFAULT_STAGE_NAME: &str = "dnn-filter";

/// Per-stream stage configuration.
#[derive(Debug, Clone)]
pub struct StageOptions {
    /// Name used in log lines; defaults to `dnn-filter`.
    pub stage_name: String,
    pub backend: BackendKind,
    pub model: PathBuf,
    /// Name of the model's input tensor.
    pub input_name: String,
    /// Name of the model's output tensor.
    pub output_name: String,
    /// Pooled asynchronous execution when the backend supports it.
    pub async_mode: bool,
    /// Request slots in the pool, 1 to 128.
    pub nireq: usize,
    /// Frames packed per inference request, 1 to 1000.
    pub batch_size: usize,
    /// Backend-specific options string, e.g. `device=GPU`.
    pub backend_options: Option<String>,
}

impl StageOptions {
    pub fn new(
        backend: BackendKind,
        model: impl Into<PathBuf>,
        input_name: impl Into<String>,
        output_name: impl Into<String>,
    ) -> Self {
        Self {
            stage_name: DEFAULT_STAGE_NAME.to_string(),
            backend,
            model: model.into(),
            input_name: input_name.into(),
            output_name: output_name.into(),
            async_mode: true,
            nireq: DEFAULT_NIREQ,
            batch_size: 1,
            backend_options: None,
        }
    }

    /// Read options from `FRAMEWISE_*` environment variables. `MODEL`,
    /// `INPUT`, and `OUTPUT` are required.
    pub fn from_env() -> FilterResult<Self> {
        let backend = match env::var("FRAMEWISE_BACKEND") {
            Ok(value) => BackendKind::from_str(&value)?,
            Err(_) => BackendKind::Native,
        };
        let model = env::var("FRAMEWISE_MODEL")
            .map(PathBuf::from)
            .map_err(|_| FilterError::configuration("FRAMEWISE_MODEL is required"))?;
        let input_name = env::var("FRAMEWISE_INPUT")
            .map_err(|_| FilterError::configuration("FRAMEWISE_INPUT is required"))?;
        let output_name = env::var("FRAMEWISE_OUTPUT")
            .map_err(|_| FilterError::configuration("FRAMEWISE_OUTPUT is required"))?;

        let mut options = Self::new(backend, model, input_name, output_name);
        if let Ok(value) = env::var("FRAMEWISE_ASYNC") {
            options.async_mode = parse_bool("FRAMEWISE_ASYNC", &value)?;
        }
        if let Ok(value) = env::var("FRAMEWISE_NIREQ") {
            options.nireq = parse_count("FRAMEWISE_NIREQ", &value)?;
        }
        if let Ok(value) = env::var("FRAMEWISE_BATCH_SIZE") {
            options.batch_size = parse_count("FRAMEWISE_BATCH_SIZE", &value)?;
        }
        if let Ok(value) = env::var("FRAMEWISE_BACKEND_OPTIONS") {
            options.backend_options = Some(value);
        }
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> FilterResult<()> {
        if self.model.as_os_str().is_empty() {
            return Err(FilterError::configuration("a model path is required"));
        }
        if self.input_name.is_empty() {
            return Err(FilterError::configuration(
                "the model input tensor name is required",
            ));
        }
        if self.output_name.is_empty() {
            return Err(FilterError::configuration(
                "the model output tensor name is required",
            ));
        }
        if self.nireq == 0 || self.nireq > MAX_NIREQ {
            return Err(FilterError::configuration(format!(
                "nireq {} is out of range 1..={MAX_NIREQ}",
                self.nireq
            )));
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(FilterError::configuration(format!(
                "batch_size {} is out of range 1..={MAX_BATCH_SIZE}",
                self.batch_size
            )));
        }
        Ok(())
    }
}

fn parse_bool(name: &str, value: &str) -> FilterResult<bool> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(FilterError::configuration(format!(
            "failed to parse {name}='{other}', expected 0 or 1"
        ))),
    }
}

fn parse_count(name: &str, value: &str) -> FilterResult<usize> {
    value.parse().map_err(|_| {
        FilterError::configuration(format!(
            "failed to parse {name}='{value}' as a positive integer"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> StageOptions {
        StageOptions::new(BackendKind::Native, "model.json", "in", "out")
    }

    #[test]
    fn defaults_validate() {
        base().validate().unwrap();
    }

    #[test]
    fn nireq_range_is_enforced() {
        let mut options = base();
        options.nireq = 0;
        assert!(options.validate().is_err());
        options.nireq = MAX_NIREQ;
        assert!(options.validate().is_ok());
        options.nireq = MAX_NIREQ + 1;
        assert!(options.validate().is_err());
    }

    #[test]
    fn batch_size_range_is_enforced() {
        let mut options = base();
        options.batch_size = 0;
        assert!(options.validate().is_err());
        options.batch_size = MAX_BATCH_SIZE + 1;
        assert!(options.validate().is_err());
    }

    #[test]
    fn missing_names_are_rejected() {
        let mut options = base();
        options.input_name.clear();
        assert!(options.validate().is_err());
        let mut options = base();
        options.model = PathBuf::new();
        assert!(options.validate().is_err());
    }
}
