//! The per-worker execution context.
//!
//! Wraps the worker's Chase–Lev deque, its MPSC submission list, the
//! notifier fired when external producers submit to it, and its steal
//! neighborhood. Also carries the per-execution cells the awaitables use to
//! communicate the deferred transfer action to the resume shim.

use crate::queue::{Deque, Drain, IntrusiveList, Steal};
use crate::runtime::Scheduler;
use crate::runtime::neighborhood::Neighborhood;
use crate::task::{Frame, SubmitHandle, TaskHandle};
use parking_lot::RwLock;
use std::cell::Cell;
use std::ptr::NonNull;

/// The transfer a suspending awaitable requested. Executed by the resume
/// shim after the frame's `poll` has returned, so that publication of the
/// suspended frame can never race with its own poll.
#[derive(Clone, Copy)]
pub(crate) enum Action {
    None,
    /// Push the parent's continuation, then run the child.
    Fork(TaskHandle),
    /// Run the child; the continuation stays private.
    Call(TaskHandle),
    /// Resolve the join race for the current frame.
    Join,
    /// Hand the current frame to another scheduler.
    Switch {
        node: SubmitHandle,
        sched: SchedShim,
    },
}

/// A type-erased `&dyn Scheduler` that stays `Copy` so it fits in a `Cell`.
#[derive(Clone, Copy)]
pub(crate) struct SchedShim {
    data: *const (),
    call: unsafe fn(*const (), SubmitHandle),
}

impl SchedShim {
    pub(crate) fn new<S: Scheduler>(sched: &S) -> Self {
        Self {
            data: sched as *const S as *const (),
            call: shim::<S>,
        }
    }

    /// Safety: the scheduler the shim was built from must still be live.
    pub(crate) unsafe fn schedule(self, sub: SubmitHandle) {
        unsafe { (self.call)(self.data, sub) };
    }
}

unsafe fn shim<S: Scheduler>(data: *const (), sub: SubmitHandle) {
    // Safety: `data` came from `SchedShim::new::<S>`.
    unsafe { (*data.cast::<S>()).schedule(sub) };
}

/// A worker's shared context. Created by [`worker_init`](crate::worker_init),
/// one per worker thread; peers hold it to steal from and submit to.
pub struct WorkerContext {
    /// Stealable continuations. `push`/`pop` owner-only, `steal` any thread.
    deque: Deque<TaskHandle>,

    /// Externally submitted roots (and context-switched tasks).
    submissions: IntrusiveList,

    /// Fired after every submission; pools use it to wake the owner.
    notify: Box<dyn Fn() + Send + Sync>,

    /// Steal targets, wired once the whole pool exists. Read on every steal
    /// sweep, written twice (init and teardown), so a read-write lock keeps
    /// the hot path to an uncontended read.
    neighbors: RwLock<Neighborhood>,

    /// The frame currently being polled on this worker.
    current: Cell<Option<NonNull<Frame>>>,

    /// Deferred transfer requested by the current frame's awaitable.
    action: Cell<Action>,

    /// Set when a fork push failed; the fork awaitable re-raises on resume.
    fork_oom: Cell<bool>,
}

// Safety: deque/submissions/neighbors are thread-safe by construction. The
// Cells are only touched by the worker thread that owns this context (the
// single thread ever polling frames on it).
unsafe impl Send for WorkerContext {}
unsafe impl Sync for WorkerContext {}

impl WorkerContext {
    pub(crate) fn new(notify: Box<dyn Fn() + Send + Sync>) -> Self {
        Self {
            deque: Deque::new(),
            submissions: IntrusiveList::new(),
            notify,
            neighbors: RwLock::new(Neighborhood::empty()),
            current: Cell::new(None),
            action: Cell::new(Action::None),
            fork_oom: Cell::new(false),
        }
    }

    /// Deliver a submitted task to this worker and fire its notifier.
    /// Any thread.
    pub fn schedule(&self, sub: SubmitHandle) {
        self.submissions.push(sub.node());
        (self.notify)();
    }

    /// Drain the submission list in FIFO order. Owner only.
    pub fn try_pop_all(&self) -> Drain {
        self.submissions.try_pop_all()
    }

    /// One steal attempt against this worker's deque. Any thread.
    pub fn try_steal(&self) -> Steal<TaskHandle> {
        self.deque.steal()
    }

    pub(crate) fn has_submissions(&self) -> bool {
        !self.submissions.is_empty()
    }

    /// Owner-side push of a continuation.
    pub(crate) fn push(&self, task: TaskHandle) -> Result<(), crate::errors::Error> {
        self.deque.push(task)
    }

    /// Owner-side pop, used by the terminal protocol and self-stealing.
    pub(crate) fn pop(&self) -> Option<TaskHandle> {
        self.deque.pop()
    }

    /// One sweep over the steal neighborhood.
    pub(crate) fn steal_from_neighbors(&self) -> Option<TaskHandle> {
        self.neighbors.read().steal()
    }

    pub(crate) fn set_neighbors(&self, neighbors: Neighborhood) {
        *self.neighbors.write() = neighbors;
    }

    /// Drop the peer references; breaks the cycle between contexts so the
    /// pool's teardown actually frees them.
    pub(crate) fn clear_neighbors(&self) {
        *self.neighbors.write() = Neighborhood::empty();
    }

    pub(crate) fn current(&self) -> Option<NonNull<Frame>> {
        self.current.get()
    }

    pub(crate) fn set_current(&self, frame: Option<NonNull<Frame>>) {
        self.current.set(frame);
    }

    pub(crate) fn set_action(&self, action: Action) {
        self.action.set(action);
    }

    pub(crate) fn take_action(&self) -> Action {
        self.action.replace(Action::None)
    }

    pub(crate) fn set_fork_oom(&self) {
        self.fork_oom.set(true);
    }

    pub(crate) fn take_fork_oom(&self) -> bool {
        self.fork_oom.replace(false)
    }
}
