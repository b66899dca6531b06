//! Event-driven state machines and the loop that drives them.
//!
//! A task never blocks on an agent. It issues the call, returns
//! [`Next::Wait`], and is stepped again when the registry posts the
//! operation's outcome to the task's mailbox.

use crate::registry::OperationCallback;
use parking_lot::Mutex;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};

/// Input to one step of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    /// Run the current state.
    Execute,
    /// An operation completed.
    OperationComplete {
        /// Operation token.
        token: u32,
        /// Completion result.
        result: i64,
    },
    /// An operation timed out or was cancelled.
    Cancel {
        /// Operation token.
        token: u32,
        /// Whether the whole task should stop.
        cancel_all: bool,
    },
}

/// What the driver does after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Step again right away.
    Execute,
    /// Wait for the next mailbox event.
    Wait,
    /// The task is done.
    Finished,
}

/// A resumable state machine.
pub trait Task {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Advances the machine by one event.
    fn step(&mut self, event: TaskEvent) -> Next;
}

/// Forwards registry callbacks into a channel.
struct MailboxCallback {
    tx: Mutex<Sender<TaskEvent>>,
}

impl OperationCallback for MailboxCallback {
    fn operation_complete(&self, token: u32, result: i64) {
        // A closed mailbox means the task already finished.
        let _ = self
            .tx
            .lock()
            .send(TaskEvent::OperationComplete { token, result });
    }

    fn handle_cancel(&self, token: u32, cancel_all: bool) {
        let _ = self.tx.lock().send(TaskEvent::Cancel { token, cancel_all });
    }
}

/// Event queue of one task.
pub struct TaskMailbox {
    rx: Receiver<TaskEvent>,
    callback: Arc<MailboxCallback>,
}

impl Default for TaskMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskMailbox {
    /// Creates an empty mailbox.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            rx,
            callback: Arc::new(MailboxCallback { tx: Mutex::new(tx) }),
        }
    }

    /// Callback to register operations with. It stops delivering once the
    /// mailbox is dropped.
    #[must_use]
    pub fn callback(&self) -> Weak<dyn OperationCallback> {
        let strong: Arc<dyn OperationCallback> = self.callback.clone();
        Arc::downgrade(&strong)
    }

    /// Posts an event directly.
    pub fn post(&self, event: TaskEvent) {
        let _ = self.callback.tx.lock().send(event);
    }

    fn recv(&self) -> Option<TaskEvent> {
        self.rx.recv().ok()
    }
}

/// Runs a task to completion on the current thread. Returns the number of
/// steps taken.
pub fn drive_task(task: &mut dyn Task, mailbox: &TaskMailbox) -> usize {
    let mut event = TaskEvent::Execute;
    let mut steps = 0;
    loop {
        steps += 1;
        match task.step(event) {
            Next::Execute => event = TaskEvent::Execute,
            Next::Wait => match mailbox.recv() {
                Some(next) => event = next,
                None => {
                    tracing::error!(task = task.name(), "mailbox closed while waiting");
                    return steps;
                }
            },
            Next::Finished => {
                tracing::debug!(task = task.name(), steps, "task finished");
                return steps;
            }
        }
    }
}
