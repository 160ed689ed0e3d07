//! The resume shim: drives one task to quiescence.
//!
//! `run` is the symmetric-transfer loop. It polls a frame, then interprets
//! what happened: a completion runs the terminal-suspension protocol
//! (transfer to the parent, or the join race through the parent's counter),
//! a suspension executes the transfer action the awaitable recorded.
//! Executing the action *after* `poll` has returned is what makes the
//! protocol sound: a frame is never published to other workers (deque push,
//! join-counter subtract, scheduler hand-off) while its own poll is still on
//! this worker's call stack.

use crate::context::{self, Action, SchedShim, WorkerContext};
use crate::task::layout;
use crate::task::{JOINS_INIT, Polled, SubmitHandle, Tag, TaskHandle};
use std::sync::atomic::{Ordering, fence};

/// Execute a drained submission: restore stack ownership from the root's
/// retained stacklet (when no steal intervened) and resume it.
///
/// Extension-surface entry; must run on a worker thread.
pub fn resume_submission(sub: SubmitHandle) {
    let task = sub.task();
    let frame = task.frame();

    if frame.load_steals() == 0 {
        // The submitter (or the switching worker) released the chain this
        // frame lives on; take it.
        context::with_stack(|stack| unsafe { stack.adopt(frame.stacklet()) });
        debug_assert!(context::with_stack(|stack| stack.top()) == frame.stacklet());
    } else {
        // Mid-scope context switch with stolen children: the frame's chain
        // belongs to the join protocol, we run on a fresh stack.
        debug_assert!(context::with_stack(|stack| stack.is_unused()));
    }

    tracing::trace!("resuming submission");
    run(task);
}

/// Execute a stolen task: bump its steal count and resume it on this
/// worker's (empty) stack.
///
/// Extension-surface entry; must run on a worker thread.
pub fn resume_stolen(task: TaskHandle) {
    task.frame().fetch_add_steal();
    debug_assert!(context::with_stack(|stack| stack.is_unused()));

    tracing::trace!("resuming stolen continuation");
    run(task);
}

/// Drive `task` (and everything it symmetric-transfers to) until this worker
/// has nothing left to resume directly.
fn run(task: TaskHandle) {
    context::with_worker(|ctx| {
        let mut task = task;
        loop {
            let frame = task.frame();
            ctx.set_current(Some(task.ptr()));
            // Safety: we hold the exclusive resume right for this frame.
            let polled = unsafe { (frame.vtable().poll)(task.ptr()) };
            ctx.set_current(None);

            let next = match polled {
                Polled::Suspend => match ctx.take_action() {
                    Action::Call(child) => Some(child),
                    Action::Fork(child) => fork_transfer(ctx, task, child),
                    Action::Join => pending_join(ctx, task),
                    Action::Switch { node, sched } => switch(ctx, task, node, sched),
                    Action::None => unreachable!(
                        "task suspended without a transfer action; \
                         only forklift awaitables may be awaited inside a task"
                    ),
                },
                Polled::Complete => finish(ctx, task),
            };

            match next {
                Some(next) => task = next,
                None => return,
            }
        }
    });
}

/// Fork: publish the parent's continuation, then transfer to the child.
fn fork_transfer(
    ctx: &WorkerContext,
    parent: TaskHandle,
    child: TaskHandle,
) -> Option<TaskHandle> {
    match ctx.push(parent) {
        Ok(()) => Some(child),
        Err(_) => {
            // The deque could not grow: the child never starts, the parent
            // resumes, and the fork awaitable re-raises there.
            tracing::warn!("fork push failed, resuming parent");
            unsafe { layout::destroy_frame(child) };
            ctx.set_fork_oom();
            Some(parent)
        }
    }
}

/// Terminal suspension: the task body finished.
fn finish(ctx: &WorkerContext, task: TaskHandle) -> Option<TaskHandle> {
    let frame = task.frame();
    match frame.tag() {
        Tag::Root => {
            // The root receptacle delivered result and semaphore during the
            // final poll; only the frame remains.
            unsafe { layout::destroy_frame(task) };
            tracing::trace!("root completed");
            self_steal(ctx)
        }

        Tag::Call => {
            // Non-stealable continuation: the parent is necessarily still
            // ours, transfer straight back.
            let parent = frame.parent().expect("call child without a parent");
            unsafe { layout::destroy_frame(task) };
            Some(TaskHandle::new(parent))
        }

        Tag::Fork => {
            let parent = frame.parent().expect("forked child without a parent");

            if let Some(popped) = ctx.pop() {
                // No one stole the continuation; we already own the parent's
                // stacklet. No counter traffic at all on this path.
                debug_assert_eq!(popped.ptr(), parent);
                unsafe { layout::destroy_frame(task) };
                return Some(popped);
            }

            // The continuation was stolen: settle through the join counter.
            // Destroy the child first so the winner observes a fully
            // unwound chain; the release decrement publishes those writes.
            unsafe { layout::destroy_frame(task) };
            let chain_in_use = context::with_stack(|stack| !stack.is_unused());

            let parent = TaskHandle::new(parent);
            if parent.frame().fetch_sub_joins(1, Ordering::Release) == 1 {
                // Last child, join already pending: we win the race.
                fence(Ordering::Acquire);
                context::with_stack(|stack| unsafe { stack.adopt(parent.frame().stacklet()) });
                parent.frame().reset();
                tracing::trace!("join race won by last child");
                Some(parent)
            } else {
                // Someone else will finish the join. If our chain still
                // holds the parent's frame, float it for the winner;
                // otherwise it is a fresh chain we keep.
                if chain_in_use {
                    context::with_stack(|stack| {
                        let _floating = stack.release();
                    });
                }
                self_steal(ctx)
            }
        }
    }
}

/// A join that could not complete synchronously: publish it with a single
/// `fetch_sub`, then either resume (we won) or abandon the frame to the last
/// child (we lost).
fn pending_join(ctx: &WorkerContext, task: TaskHandle) -> Option<TaskHandle> {
    let frame = task.frame();
    let steals = frame.load_steals();
    debug_assert_ne!(steals, 0, "pending join without steals");
    debug_assert!(context::with_stack(|stack| stack.is_unused()));

    // joins = MAX - num_joined; afterwards it holds steals - num_joined.
    let joined = frame.fetch_sub_joins(JOINS_INIT - steals, Ordering::Release);

    if steals == JOINS_INIT - joined {
        // Every stolen child had already returned: resume ourselves. The
        // fence orders their writes before we touch the frame's chain.
        fence(Ordering::Acquire);
        context::with_stack(|stack| unsafe { stack.adopt(frame.stacklet()) });
        frame.reset();
        tracing::trace!("join race won by parent");
        Some(task)
    } else {
        // The last returning child resumes the frame; we cannot touch it
        // (it may already be running elsewhere).
        tracing::trace!("join race lost, parent abandoned");
        self_steal(ctx)
    }
}

/// Context switch: release the stack if this frame's chain is ours, hand the
/// frame to the destination scheduler, then self-steal.
fn switch(
    ctx: &WorkerContext,
    task: TaskHandle,
    node: SubmitHandle,
    sched: SchedShim,
) -> Option<TaskHandle> {
    let frame = task.frame();

    if frame.load_steals() == 0 {
        // The destination takes this chain on resumption.
        context::with_stack(|stack| {
            debug_assert!(!stack.is_unused());
            let _floating = stack.release();
        });
    } else {
        // The chain was never ours; the join protocol owns it.
        debug_assert!(context::with_stack(|stack| stack.is_unused()));
    }

    // Safety: the `resume_on` contract keeps the destination scheduler alive
    // while any task it was handed can still resume. The frame must not be
    // touched past this call.
    unsafe { sched.schedule(node) };
    tracing::trace!("rescheduled task onto another scheduler");

    self_steal(ctx)
}

/// Promote one of our own queued continuations that has become effectively
/// stolen (the task ahead of it was rescheduled elsewhere) and resume it
/// under the stolen-task protocol.
fn self_steal(ctx: &WorkerContext) -> Option<TaskHandle> {
    let task = ctx.pop()?;
    task.frame().fetch_add_steal();
    tracing::trace!("self-stole an effectively stolen continuation");
    Some(task)
}

/// Shutdown helper: run everything still sitting in this worker's
/// submission list and deque until both are dry.
pub(crate) fn drain_all(ctx: &WorkerContext) {
    loop {
        let mut progressed = false;

        for sub in ctx.try_pop_all() {
            resume_submission(sub);
            progressed = true;
        }

        while let Some(task) = ctx.pop() {
            task.frame().fetch_add_steal();
            run(task);
            progressed = true;
        }

        if !progressed && !ctx.has_submissions() {
            return;
        }
    }
}
