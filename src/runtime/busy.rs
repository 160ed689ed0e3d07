//! The eager pool: workers drain submissions, steal, or spin.

use crate::context::{self, WorkerContext};
use crate::runtime::builder::{Builder, PoolConfig};
use crate::runtime::{Scheduler, neighborhood, resume};
use crate::task::SubmitHandle;
use anyhow::ensure;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::JoinHandle;

/// A fixed pool of workers running the busy (steal-or-spin) loop.
///
/// Lowest latency, burns idle CPU. Use [`LazyPool`](crate::LazyPool) when
/// workers should sleep between bursts of work.
pub struct BusyPool {
    contexts: Vec<Arc<WorkerContext>>,
    handles: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    next: AtomicUsize,
}

impl BusyPool {
    /// A busy pool with `threads` workers.
    pub fn new(threads: usize) -> Self {
        Builder::new().worker_threads(threads).busy()
    }

    pub(crate) fn build(cfg: PoolConfig) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let slots: Arc<Mutex<Vec<Option<Arc<WorkerContext>>>>> =
            Arc::new(Mutex::new(vec![None; cfg.threads]));
        let barrier = Arc::new(Barrier::new(cfg.threads + 1));

        let handles = (0..cfg.threads)
            .map(|index| {
                let stop = Arc::clone(&stop);
                let slots = Arc::clone(&slots);
                let barrier = Arc::clone(&barrier);
                let hook = cfg.on_thread_start.clone();

                cfg.spawn_thread(index, move || {
                    // Busy workers poll; submissions need no wakeup.
                    let ctx = context::worker_init(|| {});
                    slots.lock()[index] = Some(Arc::clone(&ctx));

                    barrier.wait(); // every context registered
                    barrier.wait(); // neighborhoods wired

                    if let Some(hook) = &hook {
                        hook(index);
                    }

                    worker_loop(&ctx, &stop);
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

        tracing::debug!(workers = contexts.len(), "busy pool started");
        Self {
            contexts,
            handles,
            stop,
            next: AtomicUsize::new(0),
        }
    }

    pub fn workers(&self) -> usize {
        self.contexts.len()
    }

    /// Cooperative shutdown: set the stop flag and join the workers, who
    /// drain their submission lists and deques first.
    pub fn shutdown(&mut self) -> anyhow::Result<()> {
        if self.handles.is_empty() {
            return Ok(());
        }
        self.stop.store(true, Ordering::Release);

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

impl Scheduler for BusyPool {
    fn schedule(&self, task: SubmitHandle) {
        // Round-robin across workers; no fairness promised beyond delivery.
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.contexts.len();
        self.contexts[index].schedule(task);
    }
}

impl Drop for BusyPool {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::error!(?err, "busy pool shutdown");
        }
    }
}

/// Steal-or-spin event loop: drain submissions, attempt one steal sweep,
/// otherwise spin. On shutdown, keep draining until nothing is left.
fn worker_loop(ctx: &WorkerContext, stop: &AtomicBool) {
    loop {
        for sub in ctx.try_pop_all() {
            resume::resume_submission(sub);
        }

        if let Some(task) = ctx.steal_from_neighbors() {
            resume::resume_stolen(task);
            continue;
        }

        if stop.load(Ordering::Acquire) {
            resume::drain_all(ctx);
            if !ctx.has_submissions() {
                return;
            }
            continue;
        }

        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(BusyPool: Send, Sync);

    #[test]
    fn starts_and_stops() {
        let mut pool = BusyPool::new(2);
        assert_eq!(pool.workers(), 2);
        pool.shutdown().unwrap();
    }
}
