use crate::error::{panic_message, FanoutError};
use crate::task::{FanoutItem, FanoutTask, TaskFuture};

use std::backtrace::Backtrace;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::runtime::Handle as TokioHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

const DEFAULT_WORKERS: usize = 1;
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Configures and starts a [`Fanout`] pool.
///
/// Obtained from [`Fanout::builder`]. Workers start as soon as
/// [`build`](Self::build) is called.
pub struct FanoutBuilder {
  name: String,
  workers: usize,
  queue_capacity: usize,
  handle: Option<TokioHandle>,
}

impl FanoutBuilder {
  /// Sets the number of worker loops (default 1).
  ///
  /// # Panics
  ///
  /// Panics if `n` is zero.
  pub fn workers(mut self, n: usize) -> Self {
    assert!(n > 0, "fanout workers must be greater than zero");
    self.workers = n;
    self
  }

  /// Sets the capacity of the bounded task queue (default 1024).
  ///
  /// # Panics
  ///
  /// Panics if `n` is zero.
  pub fn queue_capacity(mut self, n: usize) -> Self {
    assert!(n > 0, "fanout queue capacity must be greater than zero");
    self.queue_capacity = n;
    self
  }

  /// Runs the workers on `handle` instead of the current runtime.
  pub fn tokio_handle(mut self, handle: TokioHandle) -> Self {
    self.handle = Some(handle);
    self
  }

  /// Starts the pool: spawns the workers and returns the handle used to
  /// submit tasks.
  ///
  /// # Panics
  ///
  /// Panics when no handle was configured and the call is made outside a
  /// Tokio runtime context.
  pub fn build(self) -> Fanout {
    let name = Arc::new(if self.name.is_empty() {
      "anonymous".to_string()
    } else {
      self.name
    });
    let handle = self.handle.unwrap_or_else(TokioHandle::current);
    let (tx, rx) = async_channel::bounded::<FanoutItem>(self.queue_capacity);
    let shutdown = CancellationToken::new();
    let workers = TaskTracker::new();

    info!(
      pool_name = %name,
      workers = self.workers,
      queue_capacity = self.queue_capacity,
      "starting fanout workers"
    );
    for _ in 0..self.workers {
      let rx = rx.clone();
      let shutdown = shutdown.clone();
      let name = name.clone();
      workers.spawn_on(worker_loop(name, rx, shutdown), &handle);
    }
    workers.close();

    Fanout {
      name,
      tx,
      shutdown,
      closed: AtomicBool::new(false),
      workers,
    }
  }
}

/// A named, fixed-size pool of long-lived workers draining a bounded queue of
/// fire-and-forget tasks.
///
/// Producers get backpressure instead of blocking: a full queue rejects the
/// submission synchronously. Tasks carry no completion signal; their panics
/// are contained and logged, never surfaced.
pub struct Fanout {
  /// Diagnostic label only; no uniqueness requirement.
  name: Arc<String>,
  tx: async_channel::Sender<FanoutItem>,
  shutdown: CancellationToken,
  /// First-writer-wins latch for `close`.
  closed: AtomicBool,
  /// Completion barrier over the worker loops; makes `close` synchronous.
  workers: TaskTracker,
}

impl Fanout {
  /// Starts a pool with the default configuration: one worker and a queue
  /// capacity of 1024. An empty name becomes `"anonymous"`.
  ///
  /// # Panics
  ///
  /// Panics when called outside a Tokio runtime context.
  pub fn new(name: &str) -> Self {
    Self::builder(name).build()
  }

  /// Returns a builder for a pool named `name`.
  pub fn builder(name: &str) -> FanoutBuilder {
    FanoutBuilder {
      name: name.to_string(),
      workers: DEFAULT_WORKERS,
      queue_capacity: DEFAULT_QUEUE_CAPACITY,
      handle: None,
    }
  }

  /// Returns the pool's diagnostic name.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Returns the number of tasks currently sitting in the queue.
  pub fn queued_task_count(&self) -> usize {
    self.tx.len()
  }

  /// Returns `true` once shutdown has been initiated, whether by
  /// [`close`](Self::close) or by dropping the pool.
  pub fn is_closed(&self) -> bool {
    self.shutdown.is_cancelled()
  }

  /// Enqueues a fire-and-forget task. The task is invoked with `ctx` by
  /// whichever worker dequeues it.
  ///
  /// Never blocks the caller: a pool that is shutting down reports
  /// [`FanoutError::Closed`] and a full queue reports
  /// [`FanoutError::QueueFull`], both synchronously.
  pub fn submit<F, Fut>(&self, ctx: CancellationToken, task: F) -> Result<(), FanoutError>
  where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    if self.shutdown.is_cancelled() {
      warn!(pool_name = %self.name, "submit rejected, fanout is shutting down");
      return Err(FanoutError::Closed);
    }

    let task: FanoutTask = Box::new(move |token| {
      let fut: TaskFuture<()> = Box::pin(task(token));
      fut
    });
    match self.tx.try_send(FanoutItem { token: ctx, task }) {
      Ok(()) => Ok(()),
      Err(async_channel::TrySendError::Full(_)) => {
        debug!(pool_name = %self.name, "submit rejected, fanout queue is full");
        Err(FanoutError::QueueFull)
      }
      Err(async_channel::TrySendError::Closed(_)) => Err(FanoutError::Closed),
    }
  }

  /// Shuts the pool down: signals every worker and blocks until all of them
  /// have exited.
  ///
  /// Draining of items still queued at this point is best-effort; see the
  /// worker loop. Exactly-once: a second call returns
  /// [`FanoutError::Closed`] without waiting.
  pub async fn close(&self) -> Result<(), FanoutError> {
    if self.closed.swap(true, Ordering::SeqCst) {
      return Err(FanoutError::Closed);
    }

    info!(pool_name = %self.name, "closing fanout, waiting for workers to exit");
    self.shutdown.cancel();
    self.tx.close();
    self.workers.wait().await;
    info!(pool_name = %self.name, "fanout closed");
    Ok(())
  }
}

impl Drop for Fanout {
  fn drop(&mut self) {
    if !self.closed.swap(true, Ordering::SeqCst) {
      // Signal only; never block in drop. The workers observe the token and
      // the closed queue and exit on their own.
      debug!(pool_name = %self.name, "fanout dropped without explicit close, signalling workers");
      self.shutdown.cancel();
      self.tx.close();
    }
  }
}

/// One worker: repeatedly takes the next queued item and executes it inline,
/// or exits on the shutdown signal.
///
/// The select is deliberately unbiased: when shutdown and queued items are
/// both ready, whether a given item still runs is a race. Items queued before
/// shutdown may therefore be lost; producers needing stronger guarantees must
/// drain before closing.
async fn worker_loop(
  pool_name: Arc<String>,
  rx: async_channel::Receiver<FanoutItem>,
  shutdown: CancellationToken,
) {
  trace!(pool_name = %pool_name, "fanout worker started");
  loop {
    tokio::select! {
      _ = shutdown.cancelled() => break,
      received = rx.recv() => match received {
        Ok(item) => run_item(&pool_name, item).await,
        Err(_) => break,
      },
    }
  }
  trace!(pool_name = %pool_name, "fanout worker stopped");
}

/// Executes a dequeued item inside a panic-recovery boundary. A panicking
/// task is logged and the worker moves on to the next item.
async fn run_item(pool_name: &Arc<String>, item: FanoutItem) {
  let FanoutItem { token, task } = item;
  if let Err(payload) = AssertUnwindSafe(async move { task(token).await })
    .catch_unwind()
    .await
  {
    error!(
      pool_name = %pool_name,
      panic = %panic_message(payload.as_ref()),
      backtrace = %Backtrace::force_capture(),
      "panic in fanout task, worker continues"
    );
  }
}
