use groupwork::Fanout;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
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

  info!("--- Fanout Background Example ---");

  let dealer = Fanout::builder("task_dealer").workers(50).queue_capacity(1024).build();
  let done = Arc::new(AtomicUsize::new(0));

  for i in 0..150usize {
    let done = done.clone();
    let result = dealer.submit(CancellationToken::new(), move |_| async move {
      // Some heavy background work would run here.
      sleep(Duration::from_millis(10)).await;
      done.fetch_add(1, Ordering::SeqCst);
    });
    if let Err(e) = result {
      info!("task {} rejected: {}", i, e);
    }
  }

  sleep(Duration::from_millis(200)).await;
  info!("{} background tasks completed", done.load(Ordering::SeqCst));

  dealer.close().await.expect("close the pool exactly once");
  info!("--- Fanout Background Example End ---");
}
