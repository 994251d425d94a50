//! Timer-task execution core for durable workflows replicated across clusters.
//!
//! Timerflow decides when the timers of a workflow execution fire (user timers,
//! activity and decision timeouts, workflow timeouts, backoff and retry timers)
//! and executes those firings against the execution's mutable state:
//!
//! - **Deterministic recomputation**: [`TimerSequence`] derives the single
//!   next timer task from state, so recomputing twice changes nothing
//! - **Exactly-once-effective firing**: tasks act only on items still
//!   pending, under a per-execution lease, with conditional writes
//! - **Bounded standby lag**: a standby cluster never mutates; it waits,
//!   requests history catch-up, and finally discards stale tasks
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                      TimerTaskExecutor<S, G>                         │
//! │                                                                      │
//! │   1. now = ShardClock::now(guard cluster)                            │
//! │   2. Acquire execution lease, load or refresh mutable state          │
//! │   3. Compute due transitions for the task                            │
//! │   4. Nothing due → Completed                                         │
//! │   5. guard.check → Proceed | Redispatch | FetchHistory | Discard     │
//! │   6. Proceed: apply, close transaction (TimerSequence), persist      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`ActiveGuard`] always proceeds. [`StandbyGuard`] judges expiry at the
//! task's visibility timestamp and picks a band from the lag behind it.
//! [`TimerTaskRouter`] selects the mode per task, and the
//! [`runtime`] module polls a [`TimerTaskQueue`](store::TimerTaskQueue) and
//! settles each task by its [`TaskOutcome`].
//!
//! # Example
//!
//! ```ignore
//! use timerflow::{ExecutorConfig, TimerTaskRouter};
//! use timerflow::runtime::{RuntimeConfig, TimerRuntime};
//!
//! let router = TimerTaskRouter::new(
//!     store.clone(),
//!     Arc::new(ShardClock::system("east")),
//!     metadata,
//!     resender,
//!     ExecutorConfig::default(),
//!     ["west"],
//! )?;
//!
//! TimerRuntime::new(router, store, RuntimeConfig::default())
//!     .run(shutdown_signal)
//!     .await?;
//! ```
//!
//! # Design Documentation
//!
//! See `DESIGN.md` for decisions on ambiguous behavior.

mod cache;
pub mod clock;
mod error;
pub mod executor;
pub mod mutable_state;
pub mod runtime;
pub mod store;
mod task;
mod timer_sequence;
mod workflow;

pub use cache::{ExecutionCache, WorkflowContext};
pub use error::{Error, Result};
pub use executor::{
    ActiveGuard, ExecutorConfig, GuardDecision, StandbyGuard, TaskGuard, TaskOutcome,
    TimerTaskExecutor, TimerTaskRouter,
};
pub use task::{TimeoutType, TimerTask, TimerTaskType, TransferTask, TransferTaskType};
pub use timer_sequence::{
    TimerSequence, TimerSequenceId, load_and_sort_activity_timers, load_and_sort_user_timers,
};
pub use workflow::WorkflowKey;
