//! Built-in pure-Rust backend.
//!
//! Loads a small JSON model descriptor instead of a compiled network. The
//! supported operations cover what the filter pipeline needs to run without
//! a vendor runtime: identity, bilinear upscaling, and a clamped linear
//! transform. Executes synchronously or on its own completion worker.

use std::path::Path;

use serde::Deserialize;

use framewise_types::{
    DYNAMIC_DIM, ElementType, FilterError, FilterResult, Tensor, TensorDesc, TensorLayout,
};

use crate::config::{BackendKind, ModelConfig};
use crate::contract::{Completion, DnnBackend, InferenceSession};
use crate::worker::CompletionWorker;

const BACKEND_NAME: &str = "native";

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum NativeOp {
    Identity,
    Upscale { factor: u32 },
    Linear { scale: f32, bias: f32 },
}

#[derive(Debug, Deserialize)]
struct NativeModelFile {
    input: InputSpec,
    output: OutputSpec,
    op: NativeOp,
}

#[derive(Debug, Deserialize)]
struct InputSpec {
    name: String,
    channels: i64,
    #[serde(default = "dynamic_dim")]
    height: i64,
    #[serde(default = "dynamic_dim")]
    width: i64,
    dtype: String,
}

#[derive(Debug, Deserialize)]
struct OutputSpec {
    name: String,
}

fn dynamic_dim() -> i64 {
    DYNAMIC_DIM
}

#[derive(Debug)]
pub struct NativeBackend {
    input_name: String,
    output_name: String,
    input_desc: TensorDesc,
    op: NativeOp,
    worker: CompletionWorker,
}

impl NativeBackend {
    pub fn load(config: &ModelConfig) -> FilterResult<Self> {
        let file = read_model_file(&config.model)?;

        let element = match file.input.dtype.as_str() {
            "float32" => ElementType::F32,
            "uint8" => ElementType::U8,
            other => {
                return Err(FilterError::model_load(
                    BACKEND_NAME,
                    format!("unsupported input dtype '{other}'"),
                ));
            }
        };
        if file.input.channels <= 0 {
            return Err(FilterError::model_load(
                BACKEND_NAME,
                format!("invalid channel count {}", file.input.channels),
            ));
        }
        if let NativeOp::Upscale { factor } = file.op {
            if factor == 0 {
                return Err(FilterError::model_load(
                    BACKEND_NAME,
                    "upscale factor must be at least 1",
                ));
            }
        }
        if file.input.name != config.input_name {
            return Err(FilterError::configuration(format!(
                "model has no input tensor named '{}' (model declares '{}')",
                config.input_name, file.input.name
            )));
        }
        if file.output.name != config.output_name {
            return Err(FilterError::configuration(format!(
                "model has no output tensor named '{}' (model declares '{}')",
                config.output_name, file.output.name
            )));
        }

        let input_desc = TensorDesc::new(
            element,
            [1, file.input.channels, file.input.height, file.input.width],
            TensorLayout::Nhwc,
        );
        tracing::debug!(
            model = %config.model.display(),
            input = %file.input.name,
            output = %file.output.name,
            "loaded native model descriptor"
        );

        Ok(Self {
            input_name: file.input.name,
            output_name: file.output.name,
            input_desc,
            op: file.op,
            worker: CompletionWorker::spawn(BACKEND_NAME)?,
        })
    }
}

fn read_model_file(path: &Path) -> FilterResult<NativeModelFile> {
    let bytes = std::fs::read(path).map_err(|err| {
        FilterError::model_load(BACKEND_NAME, format!("cannot read {}: {err}", path.display()))
    })?;
    serde_json::from_slice(&bytes).map_err(|err| {
        FilterError::model_load(BACKEND_NAME, format!("invalid model descriptor: {err}"))
    })
}

fn op_output_desc(input: TensorDesc, op: NativeOp) -> TensorDesc {
    match op {
        NativeOp::Identity | NativeOp::Linear { .. } => input,
        NativeOp::Upscale { factor } => {
            let mut dims = input.dims();
            for dim in &mut dims[2..] {
                if *dim >= 0 {
                    *dim *= i64::from(factor);
                }
            }
            TensorDesc::new(input.element(), dims, input.layout())
        }
    }
}

impl DnnBackend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn input_desc(&self, name: &str) -> FilterResult<TensorDesc> {
        if name != self.input_name {
            return Err(FilterError::configuration(format!(
                "model has no input tensor named '{name}'"
            )));
        }
        Ok(self.input_desc)
    }

    fn output_desc(&self, name: &str) -> FilterResult<TensorDesc> {
        if name != self.output_name {
            return Err(FilterError::configuration(format!(
                "model has no output tensor named '{name}'"
            )));
        }
        Ok(op_output_desc(self.input_desc, self.op))
    }

    fn reshape_batch(&mut self, batch: usize) -> FilterResult<()> {
        if batch == 0 {
            return Err(FilterError::configuration("batch must be at least 1"));
        }
        self.input_desc = self.input_desc.with_batch(batch as i64);
        Ok(())
    }

    fn new_session(&self, input_desc: &TensorDesc) -> FilterResult<Box<dyn InferenceSession>> {
        if input_desc.element() != self.input_desc.element() {
            return Err(FilterError::configuration(format!(
                "session element {} does not match model input {}",
                input_desc.element(),
                self.input_desc.element()
            )));
        }
        if input_desc.channels() != self.input_desc.channels() {
            return Err(FilterError::configuration(format!(
                "session has {} channels, model input has {}",
                input_desc.channels(),
                self.input_desc.channels()
            )));
        }
        for (axis, label) in [(2usize, "height"), (3usize, "width")] {
            let declared = self.input_desc.dims()[axis];
            let requested = input_desc.dims()[axis];
            if declared >= 0 && requested != declared {
                return Err(FilterError::configuration(format!(
                    "session {label} {requested} does not match model {label} {declared}"
                )));
            }
        }
        if input_desc.is_dynamic() {
            return Err(FilterError::configuration(
                "session input descriptor still has dynamic dimensions",
            ));
        }

        let output_desc = op_output_desc(*input_desc, self.op);
        Ok(Box::new(NativeSession {
            op: self.op,
            output_name: self.output_name.clone(),
            input: Tensor::zeroed(*input_desc)?,
            output: Tensor::zeroed(output_desc)?,
        }))
    }

    fn supports_async(&self) -> bool {
        true
    }

    fn execute_async(&self, session: Box<dyn InferenceSession>, done: Completion) {
        self.worker.dispatch(session, done);
    }
}

struct NativeSession {
    op: NativeOp,
    output_name: String,
    input: Tensor,
    output: Tensor,
}

impl InferenceSession for NativeSession {
    fn input_mut(&mut self) -> &mut Tensor {
        &mut self.input
    }

    fn output(&self, name: &str) -> FilterResult<&Tensor> {
        if name != self.output_name {
            return Err(FilterError::configuration(format!(
                "model has no output tensor named '{name}'"
            )));
        }
        Ok(&self.output)
    }

    fn run(&mut self) -> FilterResult<()> {
        match self.op {
            NativeOp::Identity => {
                *self.output.data_mut() = self.input.data().clone();
            }
            NativeOp::Linear { scale, bias } => {
                use framewise_types::TensorData;
                match (self.input.data(), self.output.data_mut()) {
                    (TensorData::F32(src), TensorData::F32(dst)) => {
                        linear_apply(src, dst, scale, bias)
                    }
                    (TensorData::U8(src), TensorData::U8(dst)) => {
                        linear_apply(src, dst, scale, bias)
                    }
                    _ => {
                        return Err(FilterError::execution(
                            BACKEND_NAME,
                            "input/output element types diverged",
                        ));
                    }
                }
            }
            NativeOp::Upscale { .. } => {
                use framewise_types::TensorData;
                let in_dims = *self.input.desc();
                let out_dims = *self.output.desc();
                match (self.input.data(), self.output.data_mut()) {
                    (TensorData::F32(src), TensorData::F32(dst)) => {
                        upscale_nhwc(src, dst, &in_dims, &out_dims)
                    }
                    (TensorData::U8(src), TensorData::U8(dst)) => {
                        upscale_nhwc(src, dst, &in_dims, &out_dims)
                    }
                    _ => {
                        return Err(FilterError::execution(
                            BACKEND_NAME,
                            "input/output element types diverged",
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

trait Sample: Copy {
    fn to_f32(self) -> f32;
    fn from_f32(value: f32) -> Self;
}

impl Sample for f32 {
    fn to_f32(self) -> f32 {
        self
    }

    fn from_f32(value: f32) -> Self {
        value
    }
}

impl Sample for u8 {
    fn to_f32(self) -> f32 {
        f32::from(self)
    }

    fn from_f32(value: f32) -> Self {
        value.round().clamp(0.0, 255.0) as u8
    }
}

fn linear_apply<T: Sample>(src: &[T], dst: &mut [T], scale: f32, bias: f32) {
    for (out, value) in dst.iter_mut().zip(src) {
        *out = T::from_f32(value.to_f32() * scale + bias);
    }
}

fn upscale_nhwc<T: Sample>(src: &[T], dst: &mut [T], in_desc: &TensorDesc, out_desc: &TensorDesc) {
    let batch = in_desc.batch() as usize;
    let channels = in_desc.channels() as usize;
    let src_h = in_desc.height() as usize;
    let src_w = in_desc.width() as usize;
    let dst_h = out_desc.height() as usize;
    let dst_w = out_desc.width() as usize;
    let scale_y = src_h as f32 / dst_h as f32;
    let scale_x = src_w as f32 / dst_w as f32;

    for n in 0..batch {
        let src_base = n * channels * src_h * src_w;
        let dst_base = n * channels * dst_h * dst_w;
        for dy in 0..dst_h {
            let fy = ((dy as f32 + 0.5) * scale_y - 0.5).max(0.0);
            let y0 = (fy.floor() as usize).min(src_h - 1);
            let y1 = (y0 + 1).min(src_h - 1);
            let wy = fy - y0 as f32;
            for dx in 0..dst_w {
                let fx = ((dx as f32 + 0.5) * scale_x - 0.5).max(0.0);
                let x0 = (fx.floor() as usize).min(src_w - 1);
                let x1 = (x0 + 1).min(src_w - 1);
                let wx = fx - x0 as f32;
                for c in 0..channels {
                    let sample = |y: usize, x: usize| src[src_base + (y * src_w + x) * channels + c].to_f32();
                    let top = sample(y0, x0) + (sample(y0, x1) - sample(y0, x0)) * wx;
                    let bottom = sample(y1, x0) + (sample(y1, x1) - sample(y1, x0)) * wx;
                    dst[dst_base + (dy * dst_w + dx) * channels + c] =
                        T::from_f32(top + (bottom - top) * wy);
                }
            }
        }
    }
}
