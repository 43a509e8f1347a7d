//! Single-shot asynchronous unit of work with an observable state machine.
//!
//! A [`Task`] moves `Pending → Running → Success | Failure` exactly once.
//! State is published through a `tokio::sync::watch` channel at every
//! transition, so observers either poll [`Task::state`] or await changes on
//! [`Task::subscribe`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

pub type TaskFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'static>>;

/// Opaque, cheaply clonable failure captured in a terminal task state.
#[derive(Clone)]
pub struct TaskFailure(Arc<anyhow::Error>);

impl TaskFailure {
    pub fn new(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }

    pub fn error(&self) -> &anyhow::Error {
        &self.0
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// Full context chain on one line, suitable for a status message.
    pub fn message(&self) -> String {
        format!("{:#}", self.0)
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl fmt::Debug for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for TaskFailure {}

#[derive(Clone, Debug)]
pub enum TaskState<T> {
    Pending,
    Running,
    Success(T),
    Failure(TaskFailure),
}

/// Payload-free discriminant of [`TaskState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failure,
}

impl<T> TaskState<T> {
    pub fn status(&self) -> TaskStatus {
        match self {
            Self::Pending => TaskStatus::Pending,
            Self::Running => TaskStatus::Running,
            Self::Success(_) => TaskStatus::Success,
            Self::Failure(_) => TaskStatus::Failure,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success(_) | Self::Failure(_))
    }

    pub fn result(&self) -> Option<&T> {
        match self {
            Self::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&TaskFailure> {
        match self {
            Self::Failure(failure) => Some(failure),
            _ => None,
        }
    }
}

pub struct Task<T> {
    inner: Arc<TaskInner<T>>,
}

struct TaskInner<T> {
    state: watch::Sender<TaskState<T>>,
    work: Mutex<Option<TaskFuture<T>>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("status", &self.inner.state.borrow().status())
            .finish()
    }
}

impl<T> Task<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Bind a computation without starting it.
    pub fn new<F>(work: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (state, _) = watch::channel(TaskState::Pending);
        Self {
            inner: Arc::new(TaskInner {
                state,
                work: Mutex::new(Some(Box::pin(work))),
            }),
        }
    }

    pub fn state(&self) -> TaskState<T> {
        self.inner.state.borrow().clone()
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.state.borrow().status()
    }

    pub fn subscribe(&self) -> watch::Receiver<TaskState<T>> {
        self.inner.state.subscribe()
    }

    /// Start the computation if it has not been started, then resolve to its
    /// outcome.
    ///
    /// The state is `Running` by the time this returns, before the returned
    /// future is polled. The work is driven on the tokio runtime, so it
    /// reaches a terminal state even if the returned future is dropped.
    /// Later calls never re-execute the work; they resolve to the same
    /// outcome as the first.
    ///
    /// Panics if called outside a tokio runtime.
    pub fn run(&self) -> impl Future<Output = Result<T, TaskFailure>> + Send + 'static {
        if let Some(work) = self.claim_work() {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                let next = match tokio::spawn(work).await {
                    Ok(Ok(value)) => TaskState::Success(value),
                    Ok(Err(error)) => TaskState::Failure(TaskFailure::new(error)),
                    Err(join_error) => TaskState::Failure(TaskFailure::new(anyhow!(
                        "task aborted before completing: {join_error}"
                    ))),
                };
                inner.state.send_replace(next);
            });
        }

        let mut rx = self.subscribe();
        async move {
            let settled = rx.wait_for(TaskState::is_terminal).await;
            match settled {
                Ok(state) => match &*state {
                    TaskState::Success(value) => Ok(value.clone()),
                    TaskState::Failure(failure) => Err(failure.clone()),
                    TaskState::Pending | TaskState::Running => Err(TaskFailure::new(anyhow!(
                        "task settled in a non-terminal state"
                    ))),
                },
                Err(_) => Err(TaskFailure::new(anyhow!("task state channel closed"))),
            }
        }
    }

    /// Take the work and publish `Running` under the same lock, so a racing
    /// `run()` that finds no work never observes `Pending`.
    fn claim_work(&self) -> Option<TaskFuture<T>> {
        let mut slot = self
            .inner
            .work
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let work = slot.take()?;
        self.inner.state.send_replace(TaskState::Running);
        Some(work)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use anyhow::bail;
    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test]
    async fn test_fresh_task_is_pending() {
        let task = Task::new(async { Ok(1u32) });
        assert_eq!(task.status(), TaskStatus::Pending);
        assert!(task.state().result().is_none());
    }

    #[tokio::test]
    async fn test_run_marks_running_before_work_resolves() {
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let task = Task::new(async move {
            release_rx.await?;
            Ok("done".to_string())
        });

        let outcome = task.run();
        assert_eq!(task.status(), TaskStatus::Running);

        release_tx.send(()).unwrap();
        assert_eq!(outcome.await.unwrap(), "done");
        assert_eq!(task.status(), TaskStatus::Success);
        assert_eq!(task.state().result().map(String::as_str), Some("done"));
    }

    #[tokio::test]
    async fn test_failure_is_captured_in_state() {
        let task: Task<u32> = Task::new(async { bail!("model rejected tile") });
        let err = task.run().await.unwrap_err();
        assert!(err.message().contains("model rejected tile"));

        let state = task.state();
        assert_eq!(state.status(), TaskStatus::Failure);
        assert!(state.failure().unwrap().to_string().contains("model rejected tile"));
    }

    #[tokio::test]
    async fn test_run_twice_executes_work_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_task = Arc::clone(&calls);
        let task = Task::new(async move {
            calls_in_task.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(7u8)
        });

        let first = task.run();
        let second = task.run();
        assert_eq!(first.await.unwrap(), 7);
        assert_eq!(second.await.unwrap(), 7);
        assert_eq!(task.run().await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_runs_never_observe_pending() {
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let task = Task::new(async move {
            release_rx.await?;
            Ok(7u32)
        });

        let callers: Vec<_> = (0..8)
            .map(|_| {
                let task = task.clone();
                tokio::spawn(async move {
                    let outcome = task.run();
                    let status = task.status();
                    drop(outcome);
                    status
                })
            })
            .collect();
        for caller in callers {
            assert_eq!(caller.await.unwrap(), TaskStatus::Running);
        }

        release_tx.send(()).unwrap();
        assert_eq!(task.run().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_terminal_state_is_never_left() {
        let task: Task<u8> = Task::new(async { bail!("boom") });
        assert!(task.run().await.is_err());
        assert!(task.run().await.is_err());
        assert_eq!(task.status(), TaskStatus::Failure);
    }

    #[tokio::test]
    async fn test_subscribers_observe_transitions() {
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let task = Task::new(async move {
            release_rx.await?;
            Ok(3u16)
        });
        let mut rx = task.subscribe();
        assert_eq!(rx.borrow_and_update().status(), TaskStatus::Pending);

        let outcome = task.run();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().status(), TaskStatus::Running);

        release_tx.send(()).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().status(), TaskStatus::Success);
        assert_eq!(outcome.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_dropped_outcome_still_completes() {
        let task = Task::new(async { Ok(11u32) });
        drop(task.run());

        let mut rx = task.subscribe();
        rx.wait_for(TaskState::is_terminal).await.unwrap();
        assert_eq!(task.state().result(), Some(&11));
    }

    #[tokio::test]
    async fn test_panicking_work_ends_in_failure() {
        let task: Task<u8> = Task::new(async {
            if true {
                panic!("tile exploded");
            }
            Ok(0)
        });
        let err = task.run().await.unwrap_err();
        assert!(err.message().contains("aborted"));
        assert_eq!(task.status(), TaskStatus::Failure);
    }

    #[tokio::test]
    async fn test_failure_keeps_typed_cause() {
        let task: Task<u8> = Task::new(async {
            Err(crate::error::UpscaleError::Conversion("bad tile".to_string()).into())
        });
        let err = task.run().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::UpscaleError>(),
            Some(crate::error::UpscaleError::Conversion(_))
        ));
    }
}
