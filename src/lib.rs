//! A work-stealing fork-join runtime for structured parallelism.
//!
//! Tasks are `async` functions that [`fork`] stealable children, [`call`]
//! non-stealable ones, and [`join`] with everything forked in the current
//! scope. Workers execute tasks on per-worker segmented stacks ("cactus
//! stacks"), so a stolen continuation keeps the stack discipline of an
//! ordinary function call: frames are bump-allocated, freed LIFO, and whole
//! stack chains change owners at the join races the counters decide.
//!
//! ```
//! use forklift::{BusyPool, call, fork, join, sync_wait};
//!
//! async fn fib(n: u64) -> u64 {
//!     if n < 2 {
//!         return n;
//!     }
//!     let mut a = 0;
//!     let mut b = 0;
//!     fork(&mut a, fib(n - 1)).await;
//!     call(&mut b, fib(n - 2)).await;
//!     join().await;
//!     a + b
//! }
//!
//! let pool = BusyPool::new(4);
//! assert_eq!(sync_wait(&pool, fib(10)), 55);
//! ```
//!
//! Results flow through return addresses (`&mut r`, [`Eventually`],
//! [`TryEventually`], [`Discard`]), never through the awaitables: a stolen
//! child outlives the await that spawned it, up to the scope's `join`. Task
//! panics follow the same discipline: stashed at the frame they unwind out
//! of, re-raised at the join point (or eagerly, via [`fork_sync`] /
//! [`call_eager`], when no steal makes that unsafe).
//!
//! Two pool flavors: [`BusyPool`] (steal or spin) and [`LazyPool`] (steal
//! then sleep, NUMA-domain aware). The scheduler extension surface
//! ([`worker_init`], [`WorkerContext`], [`resume_submission`],
//! [`resume_stolen`]) is public so custom schedulers can host tasks too.

// Public API
pub mod future;
pub use future::{
    Call, EagerCall, Fork, Join, StackSpan, Switch, SyncFork, call, call_eager,
    call_eager_outside, co_new, fork, fork_sync, fork_sync_outside, join, resume_on,
};

pub mod runtime;
pub use runtime::{
    Builder, BusyPool, Future, LazyPool, Scheduler, detach, resume_stolen, resume_submission,
    schedule, sync_wait,
};

pub mod task;
pub use task::{Discard, Eventually, IntoRet, SubmitHandle, TaskHandle, TryEventually};

pub mod context;
pub use context::{WorkerContext, finalize, worker_init};

pub mod queue;
pub use queue::Steal;

mod errors;
pub use errors::{Error, ExceptionBeforeJoin};

// Re-exports
pub(crate) mod stack;

pub(crate) mod utils;
