use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

/// The error type a group task reports on failure.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The boxed future a submitted task produces once invoked with its token.
pub type TaskFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// A fallible unit of work owned by a [`TaskGroup`](crate::TaskGroup) for the
/// duration of its execution.
pub(crate) type GroupTask =
  Box<dyn FnOnce(CancellationToken) -> TaskFuture<Result<(), BoxError>> + Send + 'static>;

/// A fire-and-forget unit of work executed by a [`Fanout`](crate::Fanout)
/// worker.
pub(crate) type FanoutTask = Box<dyn FnOnce(CancellationToken) -> TaskFuture<()> + Send + 'static>;

/// A queued fanout task paired with the token supplied at submission time.
pub(crate) struct FanoutItem {
  pub(crate) token: CancellationToken,
  pub(crate) task: FanoutTask,
}
