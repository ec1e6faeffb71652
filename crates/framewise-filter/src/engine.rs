//! The inference engine: owns the request pool, keeps output order equal to
//! submission order, and hides the difference between synchronous and
//! asynchronous backends behind `submit`/`poll`/`flush`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use framewise_backend::{Completion, DnnBackend, InferenceSession};
use framewise_types::{FilterError, FilterResult, VideoFrame};

use crate::inflight::{Completed, InflightEntry, InflightList, PolledFrame};
use crate::slot_queue::SlotQueue;
use crate::transcode::Transcoder;

const FLUSH_BACKOFF: Duration = Duration::from_millis(5);

pub struct InferenceEngine {
    inner: EngineInner,
}

enum EngineInner {
    Sync(SyncEngine),
    Async(AsyncEngine),
}

impl InferenceEngine {
    /// Build the engine for a loaded model. Asynchronous mode requires the
    /// backend to support callback execution; otherwise the engine silently
    /// degrades to one inference per submit.
    pub fn new(
        model: Arc<dyn DnnBackend>,
        transcoder: Transcoder,
        output_name: String,
        nireq: usize,
        async_mode: bool,
    ) -> FilterResult<Self> {
        if async_mode && !model.supports_async() {
            tracing::info!(
                backend = %model.kind(),
                "backend has no asynchronous execution, falling back to synchronous mode"
            );
        }
        let inner = if async_mode && model.supports_async() {
            EngineInner::Async(AsyncEngine::new(model, transcoder, output_name, nireq)?)
        } else {
            EngineInner::Sync(SyncEngine::new(model, transcoder, output_name)?)
        };
        Ok(Self { inner })
    }

    pub fn is_async(&self) -> bool {
        matches!(self.inner, EngineInner::Async(_))
    }

    /// Hand one frame to the engine. Never waits for inference to finish;
    /// in asynchronous mode it may briefly wait for a free request slot.
    pub fn submit(&self, frame: VideoFrame) -> FilterResult<()> {
        match &self.inner {
            EngineInner::Sync(engine) => engine.submit(frame),
            EngineInner::Async(engine) => engine.submit(frame),
        }
    }

    /// The oldest submitted frame, if its inference has finished. Frames
    /// come out strictly in submission order.
    pub fn poll(&self) -> Option<PolledFrame> {
        match &self.inner {
            EngineInner::Sync(engine) => engine.poll(),
            EngineInner::Async(engine) => engine.poll(),
        }
    }

    /// Dispatch any partially filled request and wait until every pending
    /// completion has fired. Results stay queued for `poll`. Idempotent.
    pub fn flush(&self) -> FilterResult<()> {
        match &self.inner {
            EngineInner::Sync(_) => Ok(()),
            EngineInner::Async(engine) => engine.flush(),
        }
    }

    /// True when no submitted frame remains, processed or pending.
    pub fn is_empty(&self) -> bool {
        match &self.inner {
            EngineInner::Sync(engine) => engine.is_empty(),
            EngineInner::Async(engine) => engine.is_empty(),
        }
    }

    #[cfg(test)]
    fn free_slots(&self) -> usize {
        match &self.inner {
            EngineInner::Sync(_) => 0,
            EngineInner::Async(engine) => engine.shared.slots.len(),
        }
    }
}

/// One inference per submit; no pooling. The output of each run goes
/// straight into the processed queue.
struct SyncEngine {
    transcoder: Transcoder,
    output_name: String,
    session: Mutex<Box<dyn InferenceSession>>,
    processed: Mutex<VecDeque<PolledFrame>>,
}

impl SyncEngine {
    fn new(
        model: Arc<dyn DnnBackend>,
        transcoder: Transcoder,
        output_name: String,
    ) -> FilterResult<Self> {
        let session_desc = transcoder.input_desc().with_batch(1);
        let session = model.new_session(&session_desc)?;
        Ok(Self {
            transcoder,
            output_name,
            session: Mutex::new(session),
            processed: Mutex::new(VecDeque::new()),
        })
    }

    fn submit(&self, frame: VideoFrame) -> FilterResult<()> {
        let outcome = {
            let mut session = self.session.lock().expect("inference session poisoned");
            self.transcoder.preproc(&frame, session.input_mut(), 0)?;
            session
                .run()
                .and_then(|()| {
                    let tensor = session.output(&self.output_name)?;
                    self.transcoder.postproc(tensor, 0, &frame)
                })
        };
        let polled = match outcome {
            Ok(output) => PolledFrame::Frame(output),
            Err(err) => {
                tracing::warn!(
                    timestamp = ?frame.timestamp(),
                    error = %err,
                    "inference failed, dropping frame"
                );
                PolledFrame::Dropped {
                    timestamp: frame.timestamp(),
                    frame_index: frame.frame_index(),
                }
            }
        };
        self.processed
            .lock()
            .expect("processed queue poisoned")
            .push_back(polled);
        Ok(())
    }

    fn poll(&self) -> Option<PolledFrame> {
        self.processed
            .lock()
            .expect("processed queue poisoned")
            .pop_front()
    }

    fn is_empty(&self) -> bool {
        self.processed
            .lock()
            .expect("processed queue poisoned")
            .is_empty()
    }
}

/// Pooled, batched execution with callback-driven completion.
struct AsyncEngine {
    shared: Arc<AsyncShared>,
}

struct AsyncShared {
    model: Arc<dyn DnnBackend>,
    transcoder: Transcoder,
    output_name: String,
    batch_size: usize,
    slots: SlotQueue<RequestSlot>,
    inflight: InflightList,
    /// Serializes completion work when the backend runs more than one
    /// worker thread.
    completion_lock: Mutex<()>,
}

/// A pooled request. Free slots sit in the queue with an idle session;
/// while a request is dispatched the session and its packed entries travel
/// through the backend callback and the slot is reassembled on completion.
struct RequestSlot {
    session: Option<Box<dyn InferenceSession>>,
    entries: Vec<Arc<InflightEntry>>,
}

impl AsyncEngine {
    fn new(
        model: Arc<dyn DnnBackend>,
        transcoder: Transcoder,
        output_name: String,
        nireq: usize,
    ) -> FilterResult<Self> {
        let batch_size = transcoder.input_desc().batch();
        if batch_size <= 0 {
            return Err(FilterError::configuration(format!(
                "invalid request batch {batch_size}"
            )));
        }
        let batch_size = batch_size as usize;
        let slots = SlotQueue::with_capacity(nireq);
        for _ in 0..nireq {
            slots.push(RequestSlot {
                session: Some(model.new_session(transcoder.input_desc())?),
                entries: Vec::with_capacity(batch_size),
            });
        }
        Ok(Self {
            shared: Arc::new(AsyncShared {
                model,
                transcoder,
                output_name,
                batch_size,
                slots,
                inflight: InflightList::new(),
                completion_lock: Mutex::new(()),
            }),
        })
    }

    fn submit(&self, frame: VideoFrame) -> FilterResult<()> {
        let shared = &self.shared;
        let mut slot = shared.slots.pop();
        let batch_index = slot.entries.len();
        let packed = match slot.session.as_mut() {
            Some(session) => shared
                .transcoder
                .preproc(&frame, session.input_mut(), batch_index),
            None => Err(FilterError::resource("request slot lost its backend session")),
        };
        if let Err(err) = packed {
            shared.slots.push_front(slot);
            return Err(err);
        }

        let entry = Arc::new(InflightEntry::new(frame));
        shared.inflight.append(Arc::clone(&entry));
        slot.entries.push(entry);

        if slot.entries.len() == shared.batch_size {
            AsyncShared::dispatch(shared, slot);
        } else {
            shared.slots.push_front(slot);
        }
        Ok(())
    }

    fn poll(&self) -> Option<PolledFrame> {
        self.shared.inflight.pop_ready()
    }

    fn flush(&self) -> FilterResult<()> {
        // The slot being filled, if any, is at the queue head.
        if let Some(slot) = self.shared.slots.try_pop() {
            if slot.entries.is_empty() {
                self.shared.slots.push_front(slot);
            } else {
                AsyncShared::dispatch(&self.shared, slot);
            }
        }
        while !self.shared.inflight.all_done() {
            thread::sleep(FLUSH_BACKOFF);
        }
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.shared.inflight.is_empty()
    }
}

impl AsyncShared {
    fn dispatch(shared: &Arc<AsyncShared>, mut slot: RequestSlot) {
        let entries = std::mem::take(&mut slot.entries);
        let Some(session) = slot.session.take() else {
            tracing::error!("request slot has no backend session at dispatch");
            for entry in &entries {
                entry.finish(Completed::Failed);
            }
            return;
        };
        let callback_shared = Arc::clone(shared);
        let done: Completion = Box::new(move |session, result| {
            callback_shared.complete(session, entries, result);
        });
        shared.model.execute_async(session, done);
    }

    /// Runs on a backend worker thread (or on the filter thread when a
    /// dispatch fails immediately).
    fn complete(
        &self,
        session: Box<dyn InferenceSession>,
        entries: Vec<Arc<InflightEntry>>,
        result: FilterResult<()>,
    ) {
        let _serialize = self.completion_lock.lock().expect("completion lock poisoned");
        match result.and_then(|()| session.output(&self.output_name)) {
            Ok(tensor) => {
                for (batch_index, entry) in entries.iter().enumerate() {
                    match self.transcoder.postproc(tensor, batch_index, entry.input()) {
                        Ok(frame) => entry.finish(Completed::Frame(frame)),
                        Err(err) => {
                            tracing::warn!(
                                timestamp = ?entry.input().timestamp(),
                                error = %err,
                                "tensor conversion failed, dropping frame"
                            );
                            entry.finish(Completed::Failed);
                        }
                    }
                }
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    frames = entries.len(),
                    "inference request failed, dropping its frames"
                );
                for entry in &entries {
                    entry.finish(Completed::Failed);
                }
            }
        }
        self.slots.push(RequestSlot {
            session: Some(session),
            entries: Vec::with_capacity(self.batch_size),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use framewise_backend::{BackendKind, ModelConfig, load_model};
    use framewise_types::{PixelFormat, Tensor, TensorDesc};

    const IDENTITY_GRAY: &str = r#"{
        "input": { "name": "in", "channels": 1, "dtype": "uint8" },
        "output": { "name": "out" },
        "op": { "type": "identity" }
    }"#;

    fn engine_over_identity(
        nireq: usize,
        batch_size: usize,
        async_mode: bool,
    ) -> (InferenceEngine, tempfile::NamedTempFile) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(IDENTITY_GRAY.as_bytes()).unwrap();
        let model = load_model(&ModelConfig {
            kind: BackendKind::Native,
            model: file.path().to_path_buf(),
            input_name: "in".into(),
            output_name: "out".into(),
            batch_size,
            options: None,
        })
        .unwrap();
        let transcoder = Transcoder::new(
            PixelFormat::Gray8,
            4,
            4,
            model.input_desc("in").unwrap(),
            model.output_desc("out").unwrap(),
        )
        .unwrap();
        let engine =
            InferenceEngine::new(model, transcoder, "out".into(), nireq, async_mode).unwrap();
        (engine, file)
    }

    fn gray_frame(index: u64) -> VideoFrame {
        let mut frame = VideoFrame::new(PixelFormat::Gray8, 4, 4).unwrap();
        frame.plane_mut(0).data_mut().fill(index as u8);
        frame
            .with_frame_index(Some(index))
            .with_timestamp(Some(Duration::from_millis(index * 40)))
    }

    fn drain_indices(engine: &InferenceEngine) -> Vec<Option<u64>> {
        let mut indices = Vec::new();
        while let Some(polled) = engine.poll() {
            match polled {
                PolledFrame::Frame(frame) => indices.push(frame.frame_index()),
                PolledFrame::Dropped { frame_index, .. } => indices.push(frame_index),
            }
        }
        indices
    }

    #[test]
    fn partial_batches_flush_in_order() {
        let (engine, _model) = engine_over_identity(2, 4, true);
        assert!(engine.is_async());
        for index in 0..9 {
            engine.submit(gray_frame(index)).unwrap();
        }
        engine.flush().unwrap();
        let indices = drain_indices(&engine);
        assert_eq!(indices, (0..9).map(Some).collect::<Vec<_>>());
        assert!(engine.is_empty());
    }

    #[test]
    fn request_pool_is_conserved() {
        let (engine, _model) = engine_over_identity(3, 2, true);
        for index in 0..12 {
            engine.submit(gray_frame(index)).unwrap();
        }
        engine.flush().unwrap();
        assert_eq!(engine.free_slots(), 3);
        assert_eq!(drain_indices(&engine).len(), 12);
        // A second flush finds nothing to dispatch and returns immediately.
        engine.flush().unwrap();
        assert_eq!(engine.free_slots(), 3);
    }

    #[test]
    fn sync_and_async_modes_agree() {
        let (async_engine, _guard_a) = engine_over_identity(2, 3, true);
        let (sync_engine, _guard_s) = engine_over_identity(1, 1, false);
        assert!(!sync_engine.is_async());

        for index in 0..7 {
            async_engine.submit(gray_frame(index)).unwrap();
            sync_engine.submit(gray_frame(index)).unwrap();
        }
        async_engine.flush().unwrap();
        sync_engine.flush().unwrap();
        assert_eq!(drain_indices(&async_engine), drain_indices(&sync_engine));
    }

    #[test]
    fn sync_fallback_when_backend_cannot_run_async() {
        struct SyncOnly;

        struct SyncOnlySession {
            tensor: Tensor,
        }

        impl InferenceSession for SyncOnlySession {
            fn input_mut(&mut self) -> &mut Tensor {
                &mut self.tensor
            }

            fn output(&self, _name: &str) -> FilterResult<&Tensor> {
                Ok(&self.tensor)
            }

            fn run(&mut self) -> FilterResult<()> {
                Ok(())
            }
        }

        impl DnnBackend for SyncOnly {
            fn kind(&self) -> BackendKind {
                BackendKind::TensorFlow
            }

            fn input_desc(&self, _name: &str) -> FilterResult<TensorDesc> {
                unreachable!("engine resolves descriptors before construction")
            }

            fn output_desc(&self, _name: &str) -> FilterResult<TensorDesc> {
                unreachable!()
            }

            fn reshape_batch(&mut self, _batch: usize) -> FilterResult<()> {
                Ok(())
            }

            fn new_session(
                &self,
                input_desc: &TensorDesc,
            ) -> FilterResult<Box<dyn InferenceSession>> {
                Ok(Box::new(SyncOnlySession {
                    tensor: Tensor::zeroed(*input_desc)?,
                }))
            }
        }

        let desc = TensorDesc::new(
            framewise_types::ElementType::U8,
            [1, 1, 4, 4],
            framewise_types::TensorLayout::Nhwc,
        );
        let transcoder = Transcoder::new(PixelFormat::Gray8, 4, 4, desc, desc).unwrap();
        let engine =
            InferenceEngine::new(Arc::new(SyncOnly), transcoder, "out".into(), 4, true).unwrap();
        assert!(!engine.is_async());
        engine.submit(gray_frame(0)).unwrap();
        assert!(matches!(engine.poll(), Some(PolledFrame::Frame(_))));
    }
}
