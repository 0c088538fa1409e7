use groupwork::{BoxError, TaskGroup};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::info;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Concurrency Limit Example ---");

  let group = TaskGroup::default();
  group.set_concurrency_limit(5); // at most 5 tasks execute at once

  let inflight = Arc::new(AtomicUsize::new(0));
  let count = Arc::new(AtomicUsize::new(0));

  for i in 0..100usize {
    let inflight = inflight.clone();
    let count = count.clone();
    group.go(move |_| async move {
      let now = inflight.fetch_add(1, Ordering::SeqCst) + 1;
      if now > 5 {
        info!("task {} observed {} tasks in flight!", i, now);
      }
      sleep(Duration::from_millis(5)).await;
      inflight.fetch_sub(1, Ordering::SeqCst);
      count.fetch_add(1, Ordering::SeqCst);
      Ok::<(), BoxError>(())
    });
  }

  match group.wait().await {
    Ok(()) => info!("The final count is {}", count.load(Ordering::SeqCst)),
    Err(e) => info!("Err is {}", e),
  }
  info!("--- Concurrency Limit Example End ---");
}
