use std::any::Any;
use std::sync::Arc;

use thiserror::Error;

/// The failure reported by [`TaskGroup::wait`](crate::TaskGroup::wait).
///
/// Only the first failure observed by the group is captured; every later
/// failure is dropped. The captured error is `Clone` so that `wait` can hand
/// it out while the group retains the original.
#[derive(Error, Debug, Clone)]
pub enum GroupError {
  /// A task returned an error.
  #[error("task failed: {0}")]
  Task(#[source] Arc<dyn std::error::Error + Send + Sync + 'static>),

  /// A task panicked. The panic payload and a backtrace captured at the
  /// recovery site stand in for a return value.
  #[error("task panicked: {payload}")]
  Panicked { payload: String, backtrace: String },

  /// The group token was cancelled before the task finished. The task body
  /// keeps running detached in the background; only its outcome reporting is
  /// short-circuited.
  #[error("group cancelled before the task completed")]
  Cancelled,
}

/// Errors returned by [`Fanout::submit`](crate::Fanout::submit) and
/// [`Fanout::close`](crate::Fanout::close).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FanoutError {
  /// The bounded queue is at capacity. Submission never blocks; the caller
  /// decides whether to retry, drop, or propagate.
  #[error("fanout queue is full, task rejected")]
  QueueFull,

  /// The pool is shutting down or already shut down and accepts no new tasks.
  #[error("fanout is closed, cannot accept new tasks")]
  Closed,
}

/// Best-effort rendering of a panic payload for logs and captured errors.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&'static str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "non-string panic payload".to_string()
  }
}
