//! Progress reporting for long-running store operations.
//!
//! Operations such as a metadata rebuild accept an optional
//! `mpsc::Sender<TaskUpdate>` and a shared cancel flag; the caller drains the
//! receiver on its own thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;

/// Progress information for a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskProgress {
    pub current: usize,
    pub total: usize,
    pub current_item: Option<String>,
}

impl TaskProgress {
    pub fn new(current: usize, total: usize) -> Self {
        Self {
            current,
            total,
            current_item: None,
        }
    }

    pub fn with_item(mut self, item: impl Into<String>) -> Self {
        self.current_item = Some(item.into());
        self
    }

    /// Progress percentage (0-100).
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            0
        } else {
            ((self.current as f64 / self.total as f64) * 100.0).min(100.0) as u8
        }
    }
}

/// Update messages sent from background work via channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskUpdate {
    Started { total: usize },
    Progress(TaskProgress),
    Completed { message: String },
    Cancelled,
    Failed { error: String },
}

/// Best-effort progress sink; a dropped receiver is not an error.
pub(crate) fn report(sink: Option<&mpsc::Sender<TaskUpdate>>, update: TaskUpdate) {
    if let Some(tx) = sink {
        let _ = tx.send(update);
    }
}

pub(crate) fn is_cancelled(flag: &AtomicBool) -> bool {
    flag.load(Ordering::SeqCst)
}
