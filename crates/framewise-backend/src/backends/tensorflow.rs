#![cfg(feature = "backend-tensorflow")]

//! TensorFlow backend.
//!
//! Loads a SavedModel directory and runs it synchronously; the engine falls
//! back to sync mode for this backend. TensorFlow's image convention is
//! already channel-last, so tensors cross the boundary without transposes.

use std::sync::Arc;

use tensorflow::{
    Graph, Operation, SavedModelBundle, Session, SessionOptions, SessionRunArgs,
    Tensor as TfTensor,
};

use framewise_types::{
    ElementType, FilterError, FilterResult, Tensor, TensorData, TensorDesc, TensorLayout,
};

use crate::config::{BackendKind, ModelConfig};
use crate::contract::{DnnBackend, InferenceSession};

const BACKEND_NAME: &str = "tensorflow";

fn load_error(err: impl std::fmt::Display) -> FilterError {
    FilterError::model_load(BACKEND_NAME, err.to_string())
}

fn exec_error(err: impl std::fmt::Display) -> FilterError {
    FilterError::execution(BACKEND_NAME, err.to_string())
}

struct TfShared {
    // Keeps the operations' graph alive for the session's lifetime.
    _graph: Graph,
    session: Session,
    input_op: Operation,
    output_op: Operation,
}

pub struct TensorFlowBackend {
    shared: Arc<TfShared>,
    input_name: String,
    output_name: String,
    input_desc: TensorDesc,
    output_desc: TensorDesc,
}

impl TensorFlowBackend {
    pub fn load(config: &ModelConfig) -> FilterResult<Self> {
        let mut graph = Graph::new();
        let bundle = SavedModelBundle::load(
            &SessionOptions::new(),
            ["serve"],
            &mut graph,
            &config.model,
        )
        .map_err(load_error)?;

        let input_op = graph
            .operation_by_name_required(&config.input_name)
            .map_err(|err| load_error(format!("input '{}': {err}", config.input_name)))?;
        let output_op = graph
            .operation_by_name_required(&config.output_name)
            .map_err(|err| load_error(format!("output '{}': {err}", config.output_name)))?;

        let input_desc = desc_from_graph(&graph, &input_op)?;
        let output_desc = desc_from_graph(&graph, &output_op)?;

        tracing::debug!(model = %config.model.display(), "loaded tensorflow saved model");
        Ok(Self {
            shared: Arc::new(TfShared {
                _graph: graph,
                session: bundle.session,
                input_op,
                output_op,
            }),
            input_name: config.input_name.clone(),
            output_name: config.output_name.clone(),
            input_desc,
            output_desc,
        })
    }
}

/// Graph shapes arrive channel-last (N, H, W, C); descriptors carry logical
/// (batch, channels, height, width) order.
fn desc_from_graph(graph: &Graph, op: &Operation) -> FilterResult<TensorDesc> {
    let shape = graph
        .tensor_shape(tensorflow::Output {
            operation: op.clone(),
            index: 0,
        })
        .map_err(load_error)?;
    let rank = shape.dims().ok_or_else(|| load_error("tensor has unknown rank"))?;
    if rank != 4 {
        return Err(load_error(format!(
            "expected a 4-D tensor, model declares {rank} dims"
        )));
    }
    let dim = |index: usize| shape[index].unwrap_or(-1);
    Ok(TensorDesc::new(
        ElementType::F32,
        [1, dim(3), dim(1), dim(2)],
        TensorLayout::Nhwc,
    ))
}

impl DnnBackend for TensorFlowBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::TensorFlow
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
                "tensorflow backend only supports float32 tensors",
            ));
        }
        if input_desc.is_dynamic() {
            return Err(FilterError::configuration(
                "session input descriptor still has dynamic dimensions",
            ));
        }
        let output_desc = self
            .output_desc
            .with_batch(input_desc.batch())
            .resolved(input_desc.height(), input_desc.width());
        Ok(Box::new(TensorFlowSession {
            shared: Arc::clone(&self.shared),
            output_name: self.output_name.clone(),
            input: Tensor::zeroed(*input_desc)?,
            output: Tensor::zeroed(output_desc)?,
        }))
    }
}

struct TensorFlowSession {
    shared: Arc<TfShared>,
    output_name: String,
    input: Tensor,
    output: Tensor,
}

impl InferenceSession for TensorFlowSession {
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
        let values = self
            .input
            .data()
            .as_f32()
            .ok_or_else(|| exec_error("input tensor is not float32"))?;
        let tf_input = TfTensor::new(&[
            desc.batch() as u64,
            desc.height() as u64,
            desc.width() as u64,
            desc.channels() as u64,
        ])
        .with_values(values)
        .map_err(exec_error)?;

        let mut args = SessionRunArgs::new();
        args.add_feed(&self.shared.input_op, 0, &tf_input);
        let fetch = args.request_fetch(&self.shared.output_op, 0);
        self.shared.session.run(&mut args).map_err(exec_error)?;
        let tf_output: TfTensor<f32> = args.fetch(fetch).map_err(exec_error)?;

        let dims = tf_output.dims();
        if dims.len() != 4 {
            return Err(exec_error(format!(
                "expected a 4-D output tensor, runtime produced {} dims",
                dims.len()
            )));
        }
        let out_desc = TensorDesc::new(
            ElementType::F32,
            [
                dims[0] as i64,
                dims[3] as i64,
                dims[1] as i64,
                dims[2] as i64,
            ],
            TensorLayout::Nhwc,
        );
        self.output = Tensor::new(out_desc, TensorData::F32(tf_output.to_vec()))?;
        Ok(())
    }
}
