#![cfg(feature = "backend-openvino")]

//! OpenVINO backend.
//!
//! The Rust bindings expose only a synchronous infer call, so asynchronous
//! dispatch runs on the backend's completion worker. Tensors cross the
//! boundary as NCHW (the runtime's convention); the session transposes from
//! and to the channel-last buffers the core produces.

use std::sync::Mutex;

use openvino::{Core, DeviceType, ElementType as OvElementType, Shape, Tensor as OvTensor};

use framewise_types::{
    ElementType, FilterError, FilterResult, Tensor, TensorData, TensorDesc, TensorLayout,
};

use crate::config::{BackendKind, ModelConfig};
use crate::contract::{Completion, DnnBackend, InferenceSession};
use crate::worker::CompletionWorker;

const BACKEND_NAME: &str = "openvino";

pub struct OpenVinoBackend {
    compiled: Mutex<openvino::CompiledModel>,
    input_name: String,
    output_name: String,
    input_desc: TensorDesc,
    output_desc: TensorDesc,
    worker: CompletionWorker,
}

fn load_error(err: impl std::fmt::Display) -> FilterError {
    FilterError::model_load(BACKEND_NAME, err.to_string())
}

fn exec_error(err: impl std::fmt::Display) -> FilterError {
    FilterError::execution(BACKEND_NAME, err.to_string())
}

fn parse_device(options: Option<&str>) -> DeviceType<'static> {
    let device = options
        .into_iter()
        .flat_map(|raw| raw.split(&[':', ',']))
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| key.trim() == "device")
        .map(|(_, value)| value.trim().to_ascii_uppercase());
    match device.as_deref() {
        Some("GPU") => DeviceType::GPU,
        _ => DeviceType::CPU,
    }
}

impl OpenVinoBackend {
    pub fn load(config: &ModelConfig) -> FilterResult<Self> {
        let xml = config.model.clone();
        let bin = xml.with_extension("bin");
        let mut core = Core::new().map_err(load_error)?;
        let model = core
            .read_model_from_file(
                &xml.to_string_lossy(),
                &bin.to_string_lossy(),
            )
            .map_err(load_error)?;
        let device = parse_device(config.options.as_deref());
        let mut compiled = core.compile_model(&model, device).map_err(load_error)?;

        // Probe the runtime for the input geometry; OpenVINO models carry
        // NCHW dims.
        let mut probe = compiled.create_infer_request().map_err(load_error)?;
        let probe_tensor = probe
            .get_tensor(&config.input_name)
            .map_err(|err| load_error(format!("input '{}': {err}", config.input_name)))?;
        let shape = probe_tensor.get_shape().map_err(load_error)?;
        let dims = shape.get_dimensions().to_vec();
        if dims.len() != 4 {
            return Err(load_error(format!(
                "expected a 4-D input tensor, model has {} dims",
                dims.len()
            )));
        }
        let output_tensor = probe
            .get_tensor(&config.output_name)
            .map_err(|err| load_error(format!("output '{}': {err}", config.output_name)))?;
        let output_dims: Vec<i64> = output_tensor
            .get_shape()
            .map(|shape| shape.get_dimensions().to_vec())
            .unwrap_or_default();

        // Logical (batch, channels, height, width); zero-sized runtime dims
        // are treated as dynamic.
        let logical: Vec<i64> = dims
            .iter()
            .map(|&dim| if dim <= 0 { -1 } else { dim })
            .collect();
        let input_desc = TensorDesc::new(
            ElementType::F32,
            [1, logical[1], logical[2], logical[3]],
            TensorLayout::Nhwc,
        );
        let output_desc = if output_dims.len() == 4 {
            let logical: Vec<i64> = output_dims
                .iter()
                .map(|&dim| if dim <= 0 { -1 } else { dim })
                .collect();
            TensorDesc::new(
                ElementType::F32,
                [1, logical[1], logical[2], logical[3]],
                TensorLayout::Nhwc,
            )
        } else {
            // Dynamic output; mirror the input until the first run reports
            // the actual geometry.
            input_desc
        };

        tracing::debug!(model = %xml.display(), "compiled openvino model");
        Ok(Self {
            compiled: Mutex::new(compiled),
            input_name: config.input_name.clone(),
            output_name: config.output_name.clone(),
            input_desc,
            output_desc,
            worker: CompletionWorker::spawn(BACKEND_NAME)?,
        })
    }
}

impl DnnBackend for OpenVinoBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::OpenVino
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
        Ok(self.output_desc)
    }

    fn reshape_batch(&mut self, batch: usize) -> FilterResult<()> {
        if batch == 0 {
            return Err(FilterError::configuration("batch must be at least 1"));
        }
        self.input_desc = self.input_desc.with_batch(batch as i64);
        self.output_desc = self.output_desc.with_batch(batch as i64);
        Ok(())
    }

    fn new_session(&self, input_desc: &TensorDesc) -> FilterResult<Box<dyn InferenceSession>> {
        if input_desc.element() != ElementType::F32 {
            return Err(FilterError::configuration(
                "openvino backend only supports float32 tensors",
            ));
        }
        if input_desc.is_dynamic() {
            return Err(FilterError::configuration(
                "session input descriptor still has dynamic dimensions",
            ));
        }
        let request = self
            .compiled
            .lock()
            .expect("openvino compiled model poisoned")
            .create_infer_request()
            .map_err(exec_error)?;
        let output_desc = self
            .output_desc
            .with_batch(input_desc.batch())
            .resolved(input_desc.height(), input_desc.width());
        Ok(Box::new(OpenVinoSession {
            request,
            input_name: self.input_name.clone(),
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

struct OpenVinoSession {
    request: openvino::InferRequest,
    input_name: String,
    output_name: String,
    input: Tensor,
    output: Tensor,
}

// The infer request is owned by exactly one session and never shared.
unsafe impl Send for OpenVinoSession {}

impl InferenceSession for OpenVinoSession {
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
        let desc = *self.input.desc();
        let nchw = [
            desc.batch(),
            desc.channels(),
            desc.height(),
            desc.width(),
        ];
        let shape = Shape::new(&nchw).map_err(exec_error)?;
        let mut ov_input = OvTensor::new(OvElementType::F32, &shape).map_err(exec_error)?;
        {
            let dst = ov_input.get_data_mut::<f32>().map_err(exec_error)?;
            let src = self
                .input
                .data()
                .as_f32()
                .ok_or_else(|| exec_error("input tensor is not float32"))?;
            nhwc_to_nchw(src, dst, &desc);
        }
        self.request
            .set_tensor(&self.input_name, &ov_input)
            .map_err(exec_error)?;
        self.request.infer().map_err(exec_error)?;

        let ov_output = self
            .request
            .get_tensor(&self.output_name)
            .map_err(exec_error)?;
        let out_shape = ov_output.get_shape().map_err(exec_error)?;
        let out_dims = out_shape.get_dimensions();
        if out_dims.len() != 4 {
            return Err(exec_error(format!(
                "expected a 4-D output tensor, runtime produced {} dims",
                out_dims.len()
            )));
        }
        let out_desc = TensorDesc::new(
            ElementType::F32,
            [out_dims[0], out_dims[1], out_dims[2], out_dims[3]],
            TensorLayout::Nhwc,
        );
        let src = ov_output.get_data::<f32>().map_err(exec_error)?;
        let mut data = vec![0f32; src.len()];
        nchw_to_nhwc(src, &mut data, &out_desc);
        self.output = Tensor::new(out_desc, TensorData::F32(data))?;
        Ok(())
    }
}

fn nhwc_to_nchw(src: &[f32], dst: &mut [f32], desc: &TensorDesc) {
    let (n, c, h, w) = (
        desc.batch() as usize,
        desc.channels() as usize,
        desc.height() as usize,
        desc.width() as usize,
    );
    for batch in 0..n {
        for y in 0..h {
            for x in 0..w {
                for ch in 0..c {
                    dst[((batch * c + ch) * h + y) * w + x] =
                        src[((batch * h + y) * w + x) * c + ch];
                }
            }
        }
    }
}

fn nchw_to_nhwc(src: &[f32], dst: &mut [f32], desc: &TensorDesc) {
    let (n, c, h, w) = (
        desc.batch() as usize,
        desc.channels() as usize,
        desc.height() as usize,
        desc.width() as usize,
    );
    for batch in 0..n {
        for ch in 0..c {
            for y in 0..h {
                for x in 0..w {
                    dst[((batch * h + y) * w + x) * c + ch] =
                        src[((batch * c + ch) * h + y) * w + x];
                }
            }
        }
    }
}
