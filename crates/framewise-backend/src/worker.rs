use std::sync::mpsc;
use std::thread;

use framewise_types::{FilterError, FilterResult};

use crate::contract::{Completion, InferenceSession};

type Job = (Box<dyn InferenceSession>, Completion);

/// Dedicated execution thread shared by backends whose runtime only exposes
/// a synchronous infer call. Jobs run in dispatch order; each completion
/// callback fires on the worker thread before the next job starts.
#[derive(Debug)]
pub(crate) struct CompletionWorker {
    backend: &'static str,
    sender: Option<mpsc::Sender<Job>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl CompletionWorker {
    pub(crate) fn spawn(backend: &'static str) -> FilterResult<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let handle = thread::Builder::new()
            .name(format!("framewise-{backend}-infer"))
            .spawn(move || {
                while let Ok((mut session, done)) = receiver.recv() {
                    let result = session.run();
                    done(session, result);
                }
            })
            .map_err(|err| {
                FilterError::execution(backend, format!("failed to spawn worker thread: {err}"))
            })?;
        Ok(Self {
            backend,
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    pub(crate) fn dispatch(&self, session: Box<dyn InferenceSession>, done: Completion) {
        let Some(sender) = self.sender.as_ref() else {
            done(session, Err(FilterError::execution(self.backend, "worker is shut down")));
            return;
        };
        if let Err(mpsc::SendError((session, done))) = sender.send((session, done)) {
            done(
                session,
                Err(FilterError::execution(self.backend, "worker thread stopped")),
            );
        }
    }
}

impl Drop for CompletionWorker {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(handle) = self.handle.take() {
            // The last owner of a backend can be a completion callback, in
            // which case this drop runs on the worker thread itself; the
            // thread exits on its own once the channel closes.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
