//! Async task runner with progress streaming.
//!
//! Every submitted operation runs on its own blocking worker of the tokio
//! runtime. The caller gets a [`TaskHandle`] it can poll without blocking
//! (`is_done`, `try_next_line`, `try_result`) or wait on.
//!
//! Ordering contract: the worker stores the result and pushes its last output
//! line *before* it raises the done flag. A coordinator that drains the
//! output channel once more after observing `is_done()` sees every line
//! exactly once.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("{action} failed: {message}")]
    Failed { action: String, message: String },
    #[error("{action} panicked: {message}")]
    Panicked { action: String, message: String },
    #[error("{action} was cancelled")]
    Cancelled { action: String },
}

impl TaskError {
    pub fn action(&self) -> &str {
        match self {
            TaskError::Failed { action, .. }
            | TaskError::Panicked { action, .. }
            | TaskError::Cancelled { action } => action,
        }
    }
}

// ---------------------------------------------------------------------------
// Output sink
// ---------------------------------------------------------------------------

/// Write side of a task's output channel. Cloneable; a detached sink drops
/// every line.
#[derive(Debug, Clone, Default)]
pub struct OutputSink {
    tx: Option<UnboundedSender<String>>,
}

impl OutputSink {
    pub fn channel() -> (OutputSink, UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (OutputSink { tx: Some(tx) }, rx)
    }

    pub fn detached() -> OutputSink {
        OutputSink { tx: None }
    }

    /// Whether anyone listens; adapters only ask the engine for verbose
    /// output when this is true.
    pub fn is_attached(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    pub fn send(&self, line: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(line.into());
        }
    }
}

/// What a running operation can see of its own task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub output: OutputSink,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

enum SlotState<T> {
    Pending,
    Ready(Result<T, TaskError>),
    Taken,
}

struct Shared<T> {
    slot: Mutex<SlotState<T>>,
    ready: Condvar,
    done: AtomicBool,
}

impl<T> Shared<T> {
    fn store(&self, value: Result<T, TaskError>) {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        *slot = SlotState::Ready(value);
        self.done.store(true, Ordering::Release);
        self.ready.notify_all();
    }
}

pub struct TaskHandle<T> {
    label: String,
    shared: Arc<Shared<T>>,
    output: Mutex<UnboundedReceiver<String>>,
    cancel: CancellationToken,
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("label", &self.label)
            .field("done", &self.is_done())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl<T> TaskHandle<T> {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_done(&self) -> bool {
        self.shared.done.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Mark the task cancelled and stop waiting for it. The worker is not
    /// interrupted; it may still run its subprocess to completion.
    pub fn cancel(&self) {
        self.cancel.cancel();
        let _guard = self.shared.slot.lock().unwrap_or_else(|p| p.into_inner());
        self.shared.ready.notify_all();
    }

    pub fn try_next_line(&self) -> Option<String> {
        self.output
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .try_recv()
            .ok()
    }

    /// Every line currently queued, in push order.
    pub fn drain_output(&self) -> Vec<String> {
        let mut rx = self.output.lock().unwrap_or_else(|p| p.into_inner());
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        lines
    }

    fn cancelled_error(&self) -> TaskError {
        TaskError::Cancelled {
            action: self.label.clone(),
        }
    }

    /// Block until the slot is filled or the handle is cancelled, then run
    /// `f` on the filled slot.
    fn wait_slot<R>(&self, f: impl FnOnce(&mut SlotState<T>) -> R) -> Result<R, TaskError> {
        let mut slot = self.shared.slot.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if !matches!(*slot, SlotState::Pending) {
                return Ok(f(&mut slot));
            }
            if self.is_cancelled() {
                return Err(self.cancelled_error());
            }
            slot = self
                .shared
                .ready
                .wait(slot)
                .unwrap_or_else(|p| p.into_inner());
        }
    }

    /// Consume the handle and move the value out. Blocks like `result()`.
    pub fn into_result(self) -> Result<T, TaskError> {
        let label = self.label.clone();
        self.wait_slot(|slot| match std::mem::replace(slot, SlotState::Taken) {
            SlotState::Ready(r) => r,
            _ => Err(TaskError::Failed {
                action: label,
                message: "result already taken".into(),
            }),
        })?
    }

    /// Poll on a fixed interval until done or cancelled, without blocking
    /// the async runtime.
    pub async fn wait(&self, poll_interval: Duration) {
        while !self.is_done() && !self.is_cancelled() {
            tokio::time::sleep(poll_interval).await;
        }
    }
}

impl<T: Clone> TaskHandle<T> {
    /// Block until the task finishes and return its outcome. Idempotent:
    /// later calls return the same value without re-running anything.
    pub fn result(&self) -> Result<T, TaskError> {
        let label = &self.label;
        self.wait_slot(|slot| match slot {
            SlotState::Ready(r) => r.clone(),
            _ => Err(TaskError::Failed {
                action: label.clone(),
                message: "result already taken".into(),
            }),
        })?
    }

    /// Non-blocking: `None` while the task is still running.
    pub fn try_result(&self) -> Option<Result<T, TaskError>> {
        if !self.is_done() {
            return None;
        }
        Some(self.result())
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Submits operations to the blocking pool of a tokio runtime.
#[derive(Debug, Clone)]
pub struct TaskRunner {
    runtime: tokio::runtime::Handle,
}

impl TaskRunner {
    pub fn new(runtime: tokio::runtime::Handle) -> Self {
        Self { runtime }
    }

    /// Runner bound to the runtime of the calling context, if any.
    pub fn current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }

    pub fn submit<T, E, F>(&self, label: impl Into<String>, op: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        E: std::fmt::Display,
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        self.submit_with(label, move |_ctx: &TaskContext| op())
    }

    pub fn submit_with<T, E, F>(&self, label: impl Into<String>, op: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        E: std::fmt::Display,
        F: FnOnce(&TaskContext) -> Result<T, E> + Send + 'static,
    {
        let label = label.into();
        let (sink, rx) = OutputSink::channel();
        let cancel = CancellationToken::new();
        let shared = Arc::new(Shared {
            slot: Mutex::new(SlotState::Pending),
            ready: Condvar::new(),
            done: AtomicBool::new(false),
        });

        let ctx = TaskContext {
            output: sink,
            cancel: cancel.clone(),
        };
        let worker_shared = Arc::clone(&shared);
        let worker_label = label.clone();
        self.runtime.spawn_blocking(move || {
            tracing::debug!(task = %worker_label, "task started");
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| op(&ctx)));
            // Close the channel before raising the done flag.
            drop(ctx);
            let result = match outcome {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(e)) => Err(TaskError::Failed {
                    action: worker_label.clone(),
                    message: e.to_string(),
                }),
                Err(payload) => Err(TaskError::Panicked {
                    action: worker_label.clone(),
                    message: panic_message(payload.as_ref()),
                }),
            };
            if let Err(ref e) = result {
                tracing::warn!(task = %worker_label, error = %e, "task finished with error");
            } else {
                tracing::debug!(task = %worker_label, "task finished");
            }
            worker_shared.store(result);
        });

        TaskHandle {
            label,
            shared,
            output: Mutex::new(rx),
            cancel,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const POLL: Duration = Duration::from_millis(5);

    #[tokio::test]
    async fn test_result_is_idempotent() {
        let runner = TaskRunner::current().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let handle = runner.submit("list", move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(vec![1, 2, 3])
        });
        handle.wait(POLL).await;
        assert_eq!(handle.result(), Ok(vec![1, 2, 3]));
        assert_eq!(handle.result(), Ok(vec![1, 2, 3]));
        assert_eq!(handle.try_result(), Some(Ok(vec![1, 2, 3])));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_tagged_with_action() {
        let runner = TaskRunner::current().unwrap();
        let handle = runner.submit("restore", || Err::<(), _>("target is empty"));
        handle.wait(POLL).await;
        let err = handle.result().unwrap_err();
        assert_eq!(err.action(), "restore");
        assert_eq!(
            err,
            TaskError::Failed {
                action: "restore".into(),
                message: "target is empty".into()
            }
        );
        // A second read reports the same failure.
        assert_eq!(handle.result().unwrap_err(), err);
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let runner = TaskRunner::current().unwrap();
        let handle = runner.submit("ls", || -> Result<(), String> { panic!("boom") });
        handle.wait(POLL).await;
        match handle.result() {
            Err(TaskError::Panicked { action, message }) => {
                assert_eq!(action, "ls");
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_streamed_lines_survive_completion() {
        const N: usize = 500;
        let runner = TaskRunner::current().unwrap();
        let handle = runner.submit_with("backup", |ctx: &TaskContext| {
            for i in 0..N {
                ctx.output.send(format!("progress {}", i));
            }
            Ok::<_, String>(true)
        });

        let mut seen = Vec::new();
        while !handle.is_done() {
            seen.extend(handle.drain_output());
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        seen.extend(handle.drain_output());

        assert_eq!(seen.len(), N);
        let expected: Vec<String> = (0..N).map(|i| format!("progress {}", i)).collect();
        assert_eq!(seen, expected);
        assert_eq!(handle.try_next_line(), None);
        assert_eq!(handle.result(), Ok(true));
    }

    #[tokio::test]
    async fn test_cancel_stops_waiting() {
        let runner = TaskRunner::current().unwrap();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let handle = runner.submit_with("backup", move |ctx: &TaskContext| {
            let _ = release_rx.recv();
            Ok::<_, String>(ctx.is_cancelled())
        });
        assert!(!handle.is_done());
        handle.cancel();
        assert!(handle.is_cancelled());
        assert_eq!(
            handle.result(),
            Err(TaskError::Cancelled {
                action: "backup".into()
            })
        );
        release_tx.send(()).unwrap();
    }

    #[tokio::test]
    async fn test_into_result_moves_non_clone_value() {
        struct NotClone(u8);
        let runner = TaskRunner::current().unwrap();
        let handle = runner.submit("ls", || Ok::<_, String>(NotClone(7)));
        handle.wait(POLL).await;
        assert_eq!(handle.into_result().map(|v| v.0), Ok(7));
    }

    #[test]
    fn test_detached_sink_drops_lines() {
        let sink = OutputSink::detached();
        assert!(!sink.is_attached());
        sink.send("ignored");
        let (attached, mut rx) = OutputSink::channel();
        assert!(attached.is_attached());
        attached.send("kept");
        assert_eq!(rx.try_recv().unwrap(), "kept");
    }
}
