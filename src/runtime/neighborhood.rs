//! Steal-target selection.
//!
//! Each worker sees its peers partitioned into a "close" neighborhood (its
//! first-hop cohort) and a weighted tail of farther cohorts. A steal sweep
//! shuffles the close set and tries each peer once, then performs a bounded
//! number of weighted random probes into the tail. A probe is a single
//! `steal()`; `Lost` and `Empty` are treated identically.

use crate::context::WorkerContext;
use crate::queue::Steal;
use crate::task::TaskHandle;
use smallvec::SmallVec;
use std::sync::Arc;

const BASE_PROBES: usize = 1024;
const PROBES_PER_NEIGHBOR: usize = 32;

struct TailEntry {
    ctx: Arc<WorkerContext>,
    /// Cumulative weight, for binary-searched sampling.
    cum: f64,
}

pub(crate) struct Neighborhood {
    close: Vec<Arc<WorkerContext>>,
    tail: Vec<TailEntry>,
    probes: usize,
}

impl Neighborhood {
    pub(crate) fn empty() -> Self {
        Self {
            close: Vec::new(),
            tail: Vec::new(),
            probes: 0,
        }
    }

    /// Build from hop-distance cohorts: `cohorts[0]` is the close set (hop
    /// distance 1), farther cohorts get per-member weight `1 / (i^2 * |cohort|)`.
    pub(crate) fn new(cohorts: Vec<Vec<Arc<WorkerContext>>>) -> Self {
        let mut cohorts = cohorts.into_iter();
        let close = cohorts.next().unwrap_or_default();

        let mut tail = Vec::new();
        let mut cum = 0.0;
        for (hop, cohort) in cohorts.enumerate() {
            if cohort.is_empty() {
                continue;
            }
            let distance = (hop + 2) as f64;
            let weight = 1.0 / (distance * distance * cohort.len() as f64);
            for ctx in cohort {
                cum += weight;
                tail.push(TailEntry { ctx, cum });
            }
        }

        let probes = if tail.is_empty() {
            0
        } else {
            BASE_PROBES + PROBES_PER_NEIGHBOR * close.len()
        };

        Self {
            close,
            tail,
            probes,
        }
    }

    /// One steal sweep. Returns as soon as any target yields a task.
    pub(crate) fn steal(&self) -> Option<TaskHandle> {
        let mut order: SmallVec<[usize; 16]> = (0..self.close.len()).collect();
        fastrand::shuffle(&mut order);
        for &i in &order {
            if let Steal::Success(task) = self.close[i].try_steal() {
                return Some(task);
            }
        }

        if let Some(total) = self.tail.last().map(|entry| entry.cum) {
            for _ in 0..self.probes {
                let r = fastrand::f64() * total;
                let idx = self
                    .tail
                    .partition_point(|entry| entry.cum < r)
                    .min(self.tail.len() - 1);
                if let Steal::Success(task) = self.tail[idx].ctx.try_steal() {
                    return Some(task);
                }
            }
        }

        None
    }
}

/// Wire every worker's neighborhood from the domain partition: the close set
/// is the worker's own domain (minus itself); farther domains become tail
/// cohorts ordered by index distance, the hop-distance proxy.
pub(crate) fn wire(contexts: &[Arc<WorkerContext>], domains: &[Vec<usize>]) {
    for (d, domain) in domains.iter().enumerate() {
        for &worker in domain {
            let close = domain
                .iter()
                .filter(|&&peer| peer != worker)
                .map(|&peer| Arc::clone(&contexts[peer]))
                .collect();

            let mut cohorts = vec![close];
            let mut others: Vec<usize> = (0..domains.len()).filter(|&j| j != d).collect();
            others.sort_by_key(|&j| j.abs_diff(d));
            for j in others {
                cohorts.push(domains[j].iter().map(|&p| Arc::clone(&contexts[p])).collect());
            }

            contexts[worker].set_neighbors(Neighborhood::new(cohorts));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::WorkerContext;
    use crate::task::TaskHandle;
    use std::ptr::NonNull;

    fn ctx() -> Arc<WorkerContext> {
        Arc::new(WorkerContext::new(Box::new(|| {})))
    }

    fn dummy_task(addr: usize) -> TaskHandle {
        // Queue-level test: the handle is never dereferenced.
        TaskHandle::new(NonNull::new(addr as *mut _).unwrap())
    }

    #[test]
    fn empty_neighborhood_steals_nothing() {
        assert!(Neighborhood::empty().steal().is_none());
    }

    #[test]
    fn close_sweep_finds_work() {
        let peers = vec![ctx(), ctx(), ctx()];
        peers[1].push(dummy_task(0x1000)).unwrap();

        let hood = Neighborhood::new(vec![peers.clone()]);
        assert_eq!(hood.steal(), Some(dummy_task(0x1000)));
        assert!(hood.steal().is_none());
    }

    #[test]
    fn tail_probes_find_work() {
        let close = vec![ctx()];
        let far = vec![ctx(), ctx()];
        far[0].push(dummy_task(0x2000)).unwrap();

        let hood = Neighborhood::new(vec![close, far]);
        assert_eq!(hood.steal(), Some(dummy_task(0x2000)));
    }
}
