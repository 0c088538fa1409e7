use groupwork::{BoxError, TaskGroup};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Basic Group Example ---");

  let group = TaskGroup::new(CancellationToken::new());
  let count = Arc::new(AtomicUsize::new(0));

  for _ in 0..100 {
    let count = count.clone();
    group.go(move |_| async move {
      count.fetch_add(1, Ordering::SeqCst);
      Ok::<(), BoxError>(())
    });
  }

  match group.wait().await {
    Ok(()) => info!("The final count is {}", count.load(Ordering::SeqCst)),
    Err(e) => info!("Err is {}", e),
  }
  info!("--- Basic Group Example End ---");
}
