use framewise_types::{FilterResult, Tensor, TensorDesc};

use crate::config::BackendKind;

/// Completion callback for asynchronous execution. The backend invokes it
/// exactly once, handing the session back together with the execution
/// result. Output tensors are readable inside the callback.
pub type Completion = Box<dyn FnOnce(Box<dyn InferenceSession>, FilterResult<()>) + Send + 'static>;

/// One inference request: a backend-owned input buffer, an execute
/// operation, and named output tensors readable after execution.
pub trait InferenceSession: Send {
    /// The input tensor to fill before running. The buffer is sized for the
    /// session's full batch.
    fn input_mut(&mut self) -> &mut Tensor;

    /// Output tensor by name. Valid after a successful run until the next
    /// run on the same session.
    fn output(&self, name: &str) -> FilterResult<&Tensor>;

    /// Synchronous execution.
    fn run(&mut self) -> FilterResult<()>;
}

/// A loaded model. Descriptor queries are cheap; sessions are created up
/// front and reused for the lifetime of the stage.
pub trait DnnBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn input_desc(&self, name: &str) -> FilterResult<TensorDesc>;

    fn output_desc(&self, name: &str) -> FilterResult<TensorDesc>;

    /// Reshape the model's batch dimension. Called once by the loader,
    /// before any session exists.
    fn reshape_batch(&mut self, batch: usize) -> FilterResult<()>;

    /// Create a session for the given fully resolved input descriptor. The
    /// descriptor's geometry must agree with the model (fixed dims equal,
    /// dynamic dims filled in); its batch may be smaller than the batch the
    /// model was reshaped to.
    fn new_session(&self, input_desc: &TensorDesc) -> FilterResult<Box<dyn InferenceSession>>;

    /// Whether [`DnnBackend::execute_async`] completes on a worker thread.
    /// When false the engine runs the stage in synchronous mode instead.
    fn supports_async(&self) -> bool {
        false
    }

    /// Asynchronous execution. `done` is invoked exactly once: on a backend
    /// worker thread after execution, or on the calling thread when the
    /// dispatch itself fails. Ownership of the session passes to the backend
    /// and returns through the callback.
    fn execute_async(&self, session: Box<dyn InferenceSession>, done: Completion) {
        let mut session = session;
        let result = session.run();
        done(session, result);
    }
}
