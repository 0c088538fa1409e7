//! Task coordination for Tokio: a cancellation-aware [`TaskGroup`] that runs
//! a dynamic set of fallible tasks to completion and captures the first
//! error, and a [`Fanout`] pool of long-lived workers draining a bounded
//! queue of fire-and-forget tasks.
//!
//! The two primitives are independent; use either or both side by side.

mod error;
mod fanout;
mod group;
mod task;

pub use error::{FanoutError, GroupError};
pub use fanout::{Fanout, FanoutBuilder};
pub use group::TaskGroup;
pub use task::{BoxError, TaskFuture};
