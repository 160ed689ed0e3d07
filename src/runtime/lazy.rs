//! The sleeping pool: workers steal, then sleep.
//!
//! Shared state per NUMA domain `i`: a thief count `T_i` and an event-count
//! notifier. Globally: an active count `A` and the stop flag. The loop
//! maintains the invariant
//!
//! ```text
//! A > 0  =>  for every domain i:  T_i >= 1  or  S_i = 0
//! ```
//!
//! (`S_i` is the implied number of sleepers): whenever anyone is running
//! work, each domain either has a thief awake to pick up what that work
//! spawns, or has nobody asleep to miss it. Every transition below is
//! annotated with how it preserves the invariant.

use crate::context::{self, WorkerContext};
use crate::runtime::builder::{Builder, PoolConfig};
use crate::runtime::{Scheduler, neighborhood, resume};
use crate::task::SubmitHandle;
use crate::utils::EventCount;
use anyhow::ensure;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::JoinHandle;

struct DomainState {
    /// `T_i`: workers of this domain currently hunting for work.
    thieves: CachePadded<AtomicUsize>,
    notifier: EventCount,
}

struct LazyShared {
    stop: AtomicBool,
    /// `A`: workers currently executing a task, pool-wide.
    active: AtomicUsize,
    domains: Box<[DomainState]>,
}

/// A fixed pool of workers running the lazy (steal-then-sleep) loop.
pub struct LazyPool {
    contexts: Vec<Arc<WorkerContext>>,
    handles: Vec<JoinHandle<()>>,
    shared: Arc<LazyShared>,
    next: AtomicUsize,
}

impl LazyPool {
    /// A lazy pool with `threads` workers.
    pub fn new(threads: usize) -> Self {
        Builder::new().worker_threads(threads).lazy()
    }

    pub(crate) fn build(cfg: PoolConfig) -> Self {
        let shared = Arc::new(LazyShared {
            stop: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            domains: (0..cfg.domains.len())
                .map(|_| DomainState {
                    thieves: CachePadded::new(AtomicUsize::new(0)),
                    notifier: EventCount::new(),
                })
                .collect(),
        });

        let domain_of = cfg.domain_of();
        let slots: Arc<Mutex<Vec<Option<Arc<WorkerContext>>>>> =
            Arc::new(Mutex::new(vec![None; cfg.threads]));
        let barrier = Arc::new(Barrier::new(cfg.threads + 1));

        let handles = (0..cfg.threads)
            .map(|index| {
                let shared = Arc::clone(&shared);
                let slots = Arc::clone(&slots);
                let barrier = Arc::clone(&barrier);
                let hook = cfg.on_thread_start.clone();
                let domain = domain_of[index];

                cfg.spawn_thread(index, move || {
                    // A submission must wake the worker that owns the list:
                    // notify the whole domain, sleepers re-check their own
                    // lists before committing, so the owner cannot miss it.
                    let notify = {
                        let shared = Arc::clone(&shared);
                        move || shared.domains[domain].notifier.notify_all()
                    };
                    let ctx = context::worker_init(notify);
                    slots.lock()[index] = Some(Arc::clone(&ctx));

                    barrier.wait(); // every context registered
                    barrier.wait(); // neighborhoods wired

                    if let Some(hook) = &hook {
                        hook(index);
                    }

                    worker_loop(&ctx, &shared, domain);
                    context::finalize(&ctx);
                })
            })
            .collect();

        barrier.wait();
        let contexts: Vec<_> = slots
            .lock()
            .iter_mut()
            .map(|slot| slot.take().expect("worker failed to register"))
            .collect();
        neighborhood::wire(&contexts, &cfg.domains);
        barrier.wait();

        tracing::debug!(
            workers = contexts.len(),
            domains = cfg.domains.len(),
            "lazy pool started"
        );
        Self {
            contexts,
            handles,
            shared,
            next: AtomicUsize::new(0),
        }
    }

    pub fn workers(&self) -> usize {
        self.contexts.len()
    }

    /// Cooperative shutdown: set the stop flag, wake everyone, join.
    pub fn shutdown(&mut self) -> anyhow::Result<()> {
        if self.handles.is_empty() {
            return Ok(());
        }
        self.shared.stop.store(true, Ordering::SeqCst);
        for domain in &self.shared.domains {
            domain.notifier.notify_all();
        }

        let panicked = self
            .handles
            .drain(..)
            .map(|handle| handle.join())
            .filter(Result::is_err)
            .count();
        ensure!(panicked == 0, "{panicked} worker thread(s) panicked");
        Ok(())
    }
}

impl Scheduler for LazyPool {
    fn schedule(&self, task: SubmitHandle) {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.contexts.len();
        // Fires the worker's notifier, which wakes its domain.
        self.contexts[index].schedule(task);
    }
}

impl Drop for LazyPool {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::error!(?err, "lazy pool shutdown");
        }
    }
}

/// Steal-then-sleep event loop.
fn worker_loop(ctx: &WorkerContext, shared: &LazyShared, domain: usize) {
    let dom = &shared.domains[domain];

    // Becoming a thief only increases T_i: always safe.
    dom.thieves.fetch_add(1, Ordering::SeqCst);

    loop {
        // Thief with work: private submissions first, then a steal sweep.
        if ctx.has_submissions() {
            become_active(shared, dom);
            for sub in ctx.try_pop_all() {
                resume::resume_submission(sub);
            }
            become_thief(shared, dom);
            continue;
        }

        if let Some(task) = ctx.steal_from_neighbors() {
            become_active(shared, dom);
            resume::resume_stolen(task);
            become_thief(shared, dom);
            continue;
        }

        // Nothing found: try to sleep. Prepare the wait key, then re-check
        // the private submissions and the stop flag, ordered before the
        // commit, so a wake between them is never lost.
        let key = dom.notifier.prepare_wait();
        if shared.stop.load(Ordering::SeqCst) {
            dom.notifier.cancel_wait();
            break;
        }
        if ctx.has_submissions() {
            dom.notifier.cancel_wait();
            continue;
        }

        // T_i -= 1. If that left the domain thief-less while someone is
        // active, we must not sleep: cancel and resume thieving, restoring
        // T_i >= 1.
        if dom.thieves.fetch_sub(1, Ordering::SeqCst) == 1
            && shared.active.load(Ordering::SeqCst) > 0
        {
            dom.notifier.cancel_wait();
            dom.thieves.fetch_add(1, Ordering::SeqCst);
            continue;
        }

        tracing::trace!(domain, "worker sleeping");
        dom.notifier.commit_wait(key);

        // Wake-up is always followed by becoming a thief before any steal.
        dom.thieves.fetch_add(1, Ordering::SeqCst);
    }

    dom.thieves.fetch_sub(1, Ordering::SeqCst);

    // Shutdown: run whatever is still queued here before exiting.
    resume::drain_all(ctx);
}

/// Thief-with-work transition.
fn become_active(shared: &LazyShared, dom: &DomainState) {
    // T_i -= 1: if we were the last thief, wake one peer (keeps T_i >= 1,
    // or proves S_i = 0 when no one is there to wake).
    if dom.thieves.fetch_sub(1, Ordering::SeqCst) == 1 {
        dom.notifier.notify_one();
    }

    // A += 1: if A rose from zero, every domain needs a thief or no
    // sleepers; wake one thread per domain to restore the invariant.
    if shared.active.fetch_add(1, Ordering::SeqCst) == 0 {
        for domain in &shared.domains {
            domain.notifier.notify_one();
        }
    }
}

/// Active-back-to-thief transition; both steps only strengthen the
/// invariant.
fn become_thief(shared: &LazyShared, dom: &DomainState) {
    shared.active.fetch_sub(1, Ordering::SeqCst);
    dom.thieves.fetch_add(1, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(LazyPool: Send, Sync);

    #[test]
    fn starts_and_stops() {
        let mut pool = LazyPool::new(4);
        assert_eq!(pool.workers(), 4);
        pool.shutdown().unwrap();
    }

    #[test]
    fn restart_after_shutdown_is_ok() {
        let mut pool = LazyPool::new(2);
        pool.shutdown().unwrap();
        // Idempotent.
        pool.shutdown().unwrap();
    }
}
