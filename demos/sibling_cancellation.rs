use groupwork::{BoxError, TaskGroup};

use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Sibling Cancellation Example ---");

  // A parent token the application could cancel on its own deadline.
  let parent = CancellationToken::new();
  let group = TaskGroup::with_cancel(parent.clone());

  for i in 0..5usize {
    group.go(move |token| async move {
      tokio::select! {
        _ = token.cancelled() => {
          info!("task {} stopping early, a sibling failed", i);
        }
        _ = sleep(Duration::from_secs(2)) => {
          info!("task {} finished its slow work", i);
        }
      }
      Ok::<(), BoxError>(())
    });
  }

  group.go(|_| async {
    sleep(Duration::from_millis(100)).await;
    Err::<(), BoxError>("simulated fetch failure".into())
  });

  match group.wait().await {
    Ok(()) => info!("all tasks succeeded"),
    Err(e) => info!("Err is {}", e),
  }
  info!("--- Sibling Cancellation Example End ---");
}
