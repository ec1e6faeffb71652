use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use framewise_types::VideoFrame;

/// What `poll` hands back for one submitted frame.
#[derive(Debug)]
pub enum PolledFrame {
    Frame(VideoFrame),
    /// The frame's inference failed; it keeps its position in the output
    /// sequence so callers can account for it and move on.
    Dropped {
        timestamp: Option<Duration>,
        frame_index: Option<u64>,
    },
}

pub(crate) enum Completed {
    Frame(VideoFrame),
    Failed,
}

/// Bookkeeping for one submitted frame. The completion cell is written
/// exactly once, by whichever thread finishes the frame's request.
pub(crate) struct InflightEntry {
    input: VideoFrame,
    completed: Mutex<Option<Completed>>,
}

impl InflightEntry {
    pub(crate) fn new(input: VideoFrame) -> Self {
        Self {
            input,
            completed: Mutex::new(None),
        }
    }

    pub(crate) fn input(&self) -> &VideoFrame {
        &self.input
    }

    pub(crate) fn finish(&self, outcome: Completed) {
        let mut cell = self.completed.lock().expect("in-flight entry poisoned");
        debug_assert!(cell.is_none(), "in-flight entry completed twice");
        *cell = Some(outcome);
    }

    fn is_done(&self) -> bool {
        self.completed.lock().expect("in-flight entry poisoned").is_some()
    }

    fn take(&self) -> Option<Completed> {
        self.completed.lock().expect("in-flight entry poisoned").take()
    }
}

/// Submission-ordered list of pending frames. Entries leave only from the
/// head and only once finished, so output order always equals submission
/// order no matter how the backend completes requests.
pub(crate) struct InflightList {
    entries: Mutex<VecDeque<Arc<InflightEntry>>>,
}

impl InflightList {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn append(&self, entry: Arc<InflightEntry>) {
        self.entries.lock().expect("in-flight list poisoned").push_back(entry);
    }

    /// Remove and return the head entry if it has completed.
    pub(crate) fn pop_ready(&self) -> Option<PolledFrame> {
        let mut entries = self.entries.lock().expect("in-flight list poisoned");
        let outcome = entries.front()?.take()?;
        let entry = entries.pop_front().expect("list changed under its own lock");
        Some(match outcome {
            Completed::Frame(frame) => PolledFrame::Frame(frame),
            Completed::Failed => PolledFrame::Dropped {
                timestamp: entry.input().timestamp(),
                frame_index: entry.input().frame_index(),
            },
        })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.lock().expect("in-flight list poisoned").is_empty()
    }

    /// True when nothing is pending: every queued entry has completed.
    pub(crate) fn all_done(&self) -> bool {
        self.entries
            .lock()
            .expect("in-flight list poisoned")
            .iter()
            .all(|entry| entry.is_done())
    }
}
