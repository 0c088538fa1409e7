use crate::error::{panic_message, GroupError};
use crate::task::{BoxError, GroupTask, TaskFuture};

use std::any::Any;
use std::backtrace::Backtrace;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Coordinates a dynamic set of cancellable, fallible tasks.
///
/// Tasks are submitted with [`go`](Self::go) and receive the group's
/// [`CancellationToken`] when they start. [`wait`](Self::wait) blocks until
/// every submitted task has finished and returns the first captured failure,
/// if any.
///
/// By default each task runs on its own Tokio task (unbounded concurrency);
/// [`set_concurrency_limit`](Self::set_concurrency_limit) switches later
/// submissions to a fixed pool of persistent workers.
///
/// The group is cheap to clone; clones share the same state, so tasks may be
/// submitted from several places before a single `wait`.
#[derive(Clone)]
pub struct TaskGroup {
  inner: Arc<GroupInner>,
}

struct GroupInner {
  /// The token every task observes. In cancelable mode this is a child of the
  /// caller's token and is fired by the first failure or by `wait`.
  token: CancellationToken,
  /// Whether this group owns a derived token it may cancel.
  cancelable: bool,
  /// First failure wins; the winning write also decides who fires the token.
  first_err: OnceLock<GroupError>,
  /// Count of submitted-but-not-completed tasks, observable by `wait`.
  outstanding: watch::Sender<usize>,
  /// Set once by `set_concurrency_limit`; never reconfigured.
  limiter: OnceLock<Limiter>,
  /// Tasks that found every worker busy; drained into the channel by `wait`.
  overflow: Mutex<Vec<GroupTask>>,
  handle: TokioHandle,
}

struct Limiter {
  tx: async_channel::Sender<GroupTask>,
}

impl Default for TaskGroup {
  fn default() -> Self {
    Self::new(CancellationToken::new())
  }
}

impl TaskGroup {
  /// Creates a group whose tasks observe `parent` directly.
  ///
  /// A task failure is captured as the group's result but does not cancel
  /// sibling tasks; only cancellation of `parent` itself reaches them.
  ///
  /// # Panics
  ///
  /// Panics when called outside a Tokio runtime context.
  pub fn new(parent: CancellationToken) -> Self {
    Self::build(parent, false)
  }

  /// Creates a group with a child token derived from `parent`.
  ///
  /// The derived token is cancelled the first time a task fails, or the first
  /// time [`wait`](Self::wait) returns, whichever occurs first. Cancelling
  /// `parent` propagates down to every task as well.
  ///
  /// # Panics
  ///
  /// Panics when called outside a Tokio runtime context.
  pub fn with_cancel(parent: CancellationToken) -> Self {
    Self::build(parent.child_token(), true)
  }

  fn build(token: CancellationToken, cancelable: bool) -> Self {
    let (outstanding, _) = watch::channel(0usize);
    Self {
      inner: Arc::new(GroupInner {
        token,
        cancelable,
        first_err: OnceLock::new(),
        outstanding,
        limiter: OnceLock::new(),
        overflow: Mutex::new(Vec::new()),
        handle: TokioHandle::current(),
      }),
    }
  }

  /// Caps execution concurrency at `n` persistent workers.
  ///
  /// Tasks submitted after this call are handed to the workers through a
  /// bounded channel; tasks that find the channel full wait in an unbounded
  /// overflow list until [`wait`](Self::wait) flushes them. Tasks already
  /// started before the call are unaffected. The first call wins; subsequent
  /// calls are no-ops.
  ///
  /// # Panics
  ///
  /// Panics if `n` is zero.
  pub fn set_concurrency_limit(&self, n: usize) {
    assert!(n > 0, "concurrency limit must be greater than zero");
    self.inner.limiter.get_or_init(|| {
      debug!(workers = n, "task group switching to bounded dispatch");
      let (tx, rx) = async_channel::bounded::<GroupTask>(n);
      for _ in 0..n {
        let rx = rx.clone();
        let inner = self.inner.clone();
        self.inner.handle.spawn(async move {
          while let Ok(task) = rx.recv().await {
            run_task(&inner, task).await;
          }
          trace!("task group worker exited");
        });
      }
      Limiter { tx }
    });
  }

  /// Submits a task to the group.
  ///
  /// The task receives the group's token when it starts. In unbounded mode it
  /// starts immediately on its own Tokio task; in bounded mode it is handed to
  /// an idle worker if one can take it right now, otherwise it is parked in
  /// the overflow list until [`wait`](Self::wait). `go` itself never blocks.
  pub fn go<F, Fut>(&self, task: F)
  where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
  {
    let task: GroupTask = Box::new(move |token| {
      let fut: TaskFuture<Result<(), BoxError>> = Box::pin(task(token));
      fut
    });

    // Counted before the task has any chance to run, so a concurrent `wait`
    // cannot observe zero while this task is still pending.
    self.inner.outstanding.send_modify(|n| *n += 1);

    if let Some(limiter) = self.inner.limiter.get() {
      match limiter.tx.try_send(task) {
        Ok(()) => {}
        Err(async_channel::TrySendError::Full(task)) => {
          self.inner.overflow.lock().push(task);
        }
        Err(async_channel::TrySendError::Closed(task)) => {
          // Late submission after `wait` already closed the worker channel.
          // Run it unbounded under the (by now cancelled) group token rather
          // than dropping it, so the outstanding count still reaches zero.
          let inner = self.inner.clone();
          self.inner.handle.spawn(async move {
            run_task(&inner, task).await;
          });
        }
      }
      return;
    }

    let inner = self.inner.clone();
    self.inner.handle.spawn(async move {
      run_task(&inner, task).await;
    });
  }

  /// Blocks until every task submitted via [`go`](Self::go) has finished,
  /// then returns the first captured failure, if any.
  ///
  /// In bounded mode the overflow list is flushed into the worker channel
  /// first; those sends wait for workers to free capacity, bounded by the
  /// total amount of submitted work. Once the count of outstanding tasks
  /// reaches zero the worker channel is closed so the worker loops exit, and
  /// for a [`with_cancel`](Self::with_cancel) group the derived token is
  /// cancelled unconditionally as cleanup.
  pub async fn wait(&self) -> Result<(), GroupError> {
    if let Some(limiter) = self.inner.limiter.get() {
      let queued = std::mem::take(&mut *self.inner.overflow.lock());
      if !queued.is_empty() {
        trace!(queued = queued.len(), "flushing overflowed tasks to workers");
      }
      for task in queued {
        if let Err(async_channel::SendError(task)) = limiter.tx.send(task).await {
          // Channel closed by an earlier `wait`. Fall back to unbounded
          // execution so the task is not silently dropped.
          let inner = self.inner.clone();
          self.inner.handle.spawn(async move {
            run_task(&inner, task).await;
          });
        }
      }
    }

    let mut outstanding = self.inner.outstanding.subscribe();
    outstanding
      .wait_for(|n| *n == 0)
      .await
      .expect("outstanding counter sender lives inside the group");

    if let Some(limiter) = self.inner.limiter.get() {
      limiter.tx.close();
    }
    if self.inner.cancelable {
      self.inner.token.cancel();
    }

    match self.inner.first_err.get() {
      Some(err) => Err(err.clone()),
      None => Ok(()),
    }
  }
}

impl GroupInner {
  /// Exactly-once capture: the first writer stores the error and, for a
  /// cancelable group, fires the token. Later failures are dropped.
  fn capture_failure(&self, err: GroupError) {
    match self.first_err.set(err) {
      Ok(()) => {
        debug!("first task failure captured");
        if self.cancelable {
          self.token.cancel();
        }
      }
      Err(dropped) => {
        trace!(error = %dropped, "subsequent task failure dropped");
      }
    }
  }
}

/// Executes one task under the group token, whichever path dispatched it.
///
/// The task body (including the closure invocation itself) runs under
/// `catch_unwind`, and the run is raced against the group token. If the token
/// fires first, `GroupError::Cancelled` is recorded as this task's outcome
/// while the body is detached to run to completion in the background: the
/// token only short-circuits reporting, the body must check it to actually
/// stop early.
async fn run_task(inner: &Arc<GroupInner>, task: GroupTask) {
  let token = inner.token.clone();
  let mut body = {
    let token = token.clone();
    Box::pin(AssertUnwindSafe(async move { task(token).await }).catch_unwind())
  };

  // `None` means the token fired before the body finished.
  let finished: Option<std::thread::Result<Result<(), BoxError>>> = tokio::select! {
    outcome = &mut body => Some(outcome),
    _ = token.cancelled() => None,
  };

  let failure = match finished {
    Some(Ok(Ok(()))) => None,
    Some(Ok(Err(err))) => Some(GroupError::Task(Arc::from(err))),
    Some(Err(payload)) => Some(panic_failure(payload)),
    None => {
      trace!("group cancelled before task completed, detaching task body");
      inner.handle.spawn(async move {
        let _ = body.await;
      });
      Some(GroupError::Cancelled)
    }
  };

  if let Some(err) = failure {
    inner.capture_failure(err);
  }
  inner.outstanding.send_modify(|n| *n -= 1);
}

fn panic_failure(payload: Box<dyn Any + Send>) -> GroupError {
  GroupError::Panicked {
    payload: panic_message(payload.as_ref()),
    backtrace: Backtrace::force_capture().to_string(),
  }
}
