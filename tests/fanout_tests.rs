use groupwork::{Fanout, FanoutError};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,groupwork=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

#[tokio::test]
async fn test_panicking_task_does_not_kill_worker() {
  setup_tracing_for_test();
  let pool = Fanout::builder("panic_pool").workers(1).queue_capacity(1024).build();

  let flag_before_panic = Arc::new(AtomicBool::new(false));
  let later_task_ran = Arc::new(AtomicBool::new(false));

  {
    let flag = flag_before_panic.clone();
    pool
      .submit(CancellationToken::new(), move |_| async move {
        flag.store(true, Ordering::SeqCst);
        panic!("intentional panic inside fanout task");
      })
      .expect("submit succeeds");
  }
  {
    let flag = later_task_ran.clone();
    pool
      .submit(CancellationToken::new(), move |_| async move {
        flag.store(true, Ordering::SeqCst);
      })
      .expect("submit succeeds");
  }

  sleep(Duration::from_millis(100)).await;
  assert!(flag_before_panic.load(Ordering::SeqCst));
  assert!(
    later_task_ran.load(Ordering::SeqCst),
    "the worker must keep serving items after containing a panic"
  );

  pool.close().await.expect("first close succeeds");
}

#[tokio::test]
async fn test_full_queue_rejects_submission_without_blocking() {
  setup_tracing_for_test();
  let pool = Fanout::builder("backpressure_pool").workers(1).queue_capacity(2).build();

  // Park the only worker on a task that waits for the gate, so queued items
  // cannot drain.
  let gate = Arc::new(Notify::new());
  {
    let gate = gate.clone();
    pool
      .submit(CancellationToken::new(), move |_| async move {
        gate.notified().await;
      })
      .expect("submit succeeds");
  }
  sleep(Duration::from_millis(50)).await;

  pool
    .submit(CancellationToken::new(), |_| async {})
    .expect("first queued item fits");
  pool
    .submit(CancellationToken::new(), |_| async {})
    .expect("second queued item fits");
  assert_eq!(pool.queued_task_count(), 2);

  let overflow = pool.submit(CancellationToken::new(), |_| async {});
  assert_eq!(overflow, Err(FanoutError::QueueFull));

  gate.notify_one();
  pool.close().await.expect("first close succeeds");
}

#[tokio::test]
async fn test_submit_after_close_and_double_close() {
  setup_tracing_for_test();
  let pool = Fanout::new("close_pool");

  pool.close().await.expect("first close succeeds");
  assert!(pool.is_closed());

  let rejected = pool.submit(CancellationToken::new(), |_| async {});
  assert_eq!(rejected, Err(FanoutError::Closed));

  let second = pool.close().await;
  assert_eq!(second, Err(FanoutError::Closed));
}

#[tokio::test]
async fn test_close_waits_for_inflight_task() {
  setup_tracing_for_test();
  let pool = Fanout::builder("drain_pool").workers(1).build();

  let task_finished = Arc::new(AtomicBool::new(false));
  {
    let flag = task_finished.clone();
    pool
      .submit(CancellationToken::new(), move |_| async move {
        sleep(Duration::from_millis(200)).await;
        flag.store(true, Ordering::SeqCst);
      })
      .expect("submit succeeds");
  }
  sleep(Duration::from_millis(50)).await; // let the worker dequeue it

  timeout(Duration::from_secs(1), pool.close())
    .await
    .expect("close must not hang")
    .expect("first close succeeds");
  assert!(
    task_finished.load(Ordering::SeqCst),
    "close must block until the in-flight task finished"
  );
}

#[tokio::test]
async fn test_submission_token_reaches_the_task() {
  setup_tracing_for_test();
  let pool = Fanout::new("token_pool");

  let ctx = CancellationToken::new();
  ctx.cancel();

  let observed_cancelled = Arc::new(AtomicBool::new(false));
  {
    let flag = observed_cancelled.clone();
    pool
      .submit(ctx, move |token| async move {
        flag.store(token.is_cancelled(), Ordering::SeqCst);
      })
      .expect("submit succeeds");
  }

  sleep(Duration::from_millis(50)).await;
  assert!(
    observed_cancelled.load(Ordering::SeqCst),
    "the task must be invoked with the token supplied at submission"
  );
  pool.close().await.expect("first close succeeds");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_work_spreads_across_workers() {
  setup_tracing_for_test();
  let pool = Fanout::builder("spread_pool").workers(4).queue_capacity(16).build();

  let done = Arc::new(AtomicUsize::new(0));
  for _ in 0..8 {
    let done = done.clone();
    pool
      .submit(CancellationToken::new(), move |_| async move {
        sleep(Duration::from_millis(50)).await;
        done.fetch_add(1, Ordering::SeqCst);
      })
      .expect("submit succeeds");
  }

  // Eight 50ms tasks through four workers fit comfortably in 150ms; a single
  // worker would need 400ms.
  sleep(Duration::from_millis(150)).await;
  assert_eq!(done.load(Ordering::SeqCst), 8);

  pool.close().await.expect("first close succeeds");
}
