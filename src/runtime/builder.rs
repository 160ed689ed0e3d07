use crate::runtime::{BusyPool, LazyPool};
use std::sync::Arc;

/// Hook run on each worker thread before it enters its loop; receives the
/// worker index (for pinning via an external NUMA library, say).
pub(crate) type StartHook = Arc<dyn Fn(usize) + Send + Sync>;

/// Configures a worker pool.
///
/// ```no_run
/// use forklift::Builder;
///
/// let pool = Builder::new().worker_threads(8).lazy();
/// ```
pub struct Builder {
    /// Defaults to the hardware parallelism.
    worker_threads: Option<usize>,

    /// Thread name prefix; workers are named `{prefix}-{index}`.
    thread_name: String,

    /// Stack size for worker threads (the OS stack; task frames live on the
    /// segmented stacks regardless).
    thread_stack_size: Option<usize>,

    /// Worker indices per NUMA domain. Defaults to one flat domain.
    numa: Option<Vec<Vec<usize>>>,

    on_thread_start: Option<StartHook>,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            worker_threads: None,
            thread_name: "forklift-worker".to_string(),
            thread_stack_size: None,
            numa: None,
            on_thread_start: None,
        }
    }

    /// Number of worker threads. Defaults to the hardware parallelism.
    pub fn worker_threads(mut self, threads: usize) -> Self {
        assert!(threads > 0, "worker_threads cannot be 0");
        self.worker_threads = Some(threads);
        self
    }

    /// Thread name prefix for the pool's workers.
    pub fn thread_name(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name = prefix.into();
        self
    }

    /// OS stack size (bytes) for worker threads.
    pub fn thread_stack_size(mut self, bytes: usize) -> Self {
        self.thread_stack_size = Some(bytes);
        self
    }

    /// Partition the workers into NUMA domains: `domains[d]` lists the worker
    /// indices of domain `d`. Drives steal-target selection and, for the
    /// lazy pool, the per-domain sleep bookkeeping. The partition must cover
    /// every worker exactly once.
    pub fn numa(mut self, domains: Vec<Vec<usize>>) -> Self {
        self.numa = Some(domains);
        self
    }

    /// Run `hook(worker_index)` on each worker thread before its loop; the
    /// place to bind threads to processing units.
    pub fn on_thread_start<F>(mut self, hook: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.on_thread_start = Some(Arc::new(hook));
        self
    }

    /// Build a pool with the eager (steal-or-spin) scheduler.
    pub fn busy(self) -> BusyPool {
        BusyPool::build(self.resolve())
    }

    /// Build a pool with the sleeping (steal-then-sleep) scheduler.
    pub fn lazy(self) -> LazyPool {
        LazyPool::build(self.resolve())
    }

    fn resolve(self) -> PoolConfig {
        let threads = self.worker_threads.unwrap_or_else(|| {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        });

        let domains = self
            .numa
            .unwrap_or_else(|| vec![(0..threads).collect::<Vec<_>>()]);

        // The partition must cover 0..threads exactly once.
        let mut seen = vec![false; threads];
        for &worker in domains.iter().flatten() {
            assert!(worker < threads, "numa domain names worker {worker} out of range");
            assert!(!seen[worker], "numa domains assign worker {worker} twice");
            seen[worker] = true;
        }
        assert!(
            seen.iter().all(|&covered| covered),
            "numa domains must cover every worker",
        );

        PoolConfig {
            threads,
            thread_name: self.thread_name,
            thread_stack_size: self.thread_stack_size,
            domains,
            on_thread_start: self.on_thread_start,
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolved configuration handed to the pools.
pub(crate) struct PoolConfig {
    pub(crate) threads: usize,
    pub(crate) thread_name: String,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) domains: Vec<Vec<usize>>,
    pub(crate) on_thread_start: Option<StartHook>,
}

impl PoolConfig {
    /// `domain_of[w]` = the domain index of worker `w`.
    pub(crate) fn domain_of(&self) -> Vec<usize> {
        let mut map = vec![0; self.threads];
        for (d, domain) in self.domains.iter().enumerate() {
            for &w in domain {
                map[w] = d;
            }
        }
        map
    }

    pub(crate) fn spawn_thread(
        &self,
        index: usize,
        body: impl FnOnce() + Send + 'static,
    ) -> std::thread::JoinHandle<()> {
        let mut builder = std::thread::Builder::new().name(format!("{}-{index}", self.thread_name));
        if let Some(bytes) = self.thread_stack_size {
            builder = builder.stack_size(bytes);
        }
        builder.spawn(body).expect("failed to spawn worker thread")
    }
}
