//! End-to-end scheduler scenarios: recursive fork/join, panic propagation,
//! the sentinel discipline, context switches with self-stealing, detach
//! draining, and lazy wake-ups.

use crate::errors::{Error, ExceptionBeforeJoin};
use crate::{
    BusyPool, Discard, Eventually, LazyPool, TryEventually, call, call_eager, co_new, detach,
    fork, fork_sync, join, resume_on, schedule, sync_wait,
};
use rstest::rstest;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

async fn fib(n: u64) -> u64 {
    if n < 2 {
        return n;
    }
    let mut a = 0;
    let mut b = 0;
    fork(&mut a, fib(n - 1)).await;
    call(&mut b, fib(n - 2)).await;
    join().await;
    a + b
}

fn fib_reference(n: u64) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        (a, b) = (b, a + b);
    }
    a
}

async fn produce(n: u32) -> u32 {
    n
}

async fn tiny() -> u32 {
    0
}

async fn faulty_leaf() -> u32 {
    panic!("boom");
}

#[rstest]
#[case::one(1)]
#[case::two(2)]
#[case::four(4)]
#[case::eight(8)]
fn fib_on_busy_pool(#[case] workers: usize) {
    let pool = BusyPool::new(workers);
    for _ in 0..1000 {
        assert_eq!(sync_wait(&pool, fib(10)), 55);
    }
    assert_eq!(sync_wait(&pool, fib(20)), fib_reference(20));
}

#[rstest]
#[case::one(1)]
#[case::two(2)]
#[case::four(4)]
#[case::eight(8)]
fn fib_on_lazy_pool(#[case] workers: usize) {
    let pool = LazyPool::new(workers);
    for _ in 0..1000 {
        assert_eq!(sync_wait(&pool, fib(10)), 55);
    }
    assert_eq!(sync_wait(&pool, fib(20)), fib_reference(20));
}

/// `sync_wait(pool, f(x)) == f(x)` for pure `f`.
#[test]
fn sync_wait_matches_direct_evaluation() {
    let pool = crate::Builder::new().busy();
    for n in 0..15 {
        assert_eq!(sync_wait(&pool, fib(n)), fib_reference(n));
    }
}

#[test]
fn results_flow_through_cells() {
    let pool = BusyPool::new(2);
    let got = sync_wait(&pool, async {
        let a = Eventually::new();
        let b = TryEventually::new();
        fork(&a, produce(3)).await;
        call(&b, produce(4)).await;
        join().await;

        let (mut a, mut b) = (a, b);
        a.take().unwrap() + b.take().unwrap()
    });
    assert_eq!(got, 7);
}

/// A task that issues no forks and awaits `join` resumes synchronously.
#[test]
fn join_without_forks_is_synchronous() {
    let pool = BusyPool::new(1);
    let got = sync_wait(&pool, async {
        join().await;
        11u32
    });
    assert_eq!(got, 11);
}

/// A panic at depth 2 under `fork` re-raises, payload intact, from
/// `sync_wait`.
#[rstest]
#[case::one(1)]
#[case::four(4)]
fn panic_propagates_two_levels(#[case] workers: usize) {
    async fn level_two() -> u32 {
        let mut y = 0;
        fork(&mut y, faulty_leaf()).await;
        join().await;
        y
    }
    async fn level_one() -> u32 {
        let mut x = 0;
        fork(&mut x, level_two()).await;
        join().await;
        x
    }

    let pool = BusyPool::new(workers);
    let err = catch_unwind(AssertUnwindSafe(|| sync_wait(&pool, level_one()))).unwrap_err();
    assert_eq!(err.downcast_ref::<&str>().copied(), Some("boom"));
}

/// With a single worker nothing can be stolen: `fork_sync` reports
/// synchronous completion.
#[test]
fn fork_sync_reports_synchronous_completion() {
    let pool = BusyPool::new(1);
    let got = sync_wait(&pool, async {
        let mut x = 0u32;
        let synchronous = fork_sync(&mut x, produce(9)).await.unwrap();
        assert!(synchronous);
        join().await;
        x
    });
    assert_eq!(got, 9);
}

/// `call_eager` with exclusive frame ownership re-raises the real payload
/// immediately, no join needed first.
#[test]
fn call_eager_rethrows_directly() {
    let pool = BusyPool::new(1);
    let err = catch_unwind(AssertUnwindSafe(|| {
        sync_wait(&pool, async {
            let mut x = 0u32;
            match call_eager(&mut x, faulty_leaf()).await {
                Ok(()) => x,
                Err(ExceptionBeforeJoin) => {
                    join().await;
                    unreachable!("join must rethrow");
                }
            }
        })
    }))
    .unwrap_err();
    assert_eq!(err.downcast_ref::<&str>().copied(), Some("boom"));
}

/// The sentinel discipline: a stolen-and-panicked sibling surfaces as
/// `Err(ExceptionBeforeJoin)` from `fork_sync`, and the following `join`
/// re-raises the real payload.
#[test]
fn sentinel_then_join_rethrows_real_payload() {
    async fn gated_panic(gate: Arc<AtomicBool>) -> u32 {
        while !gate.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }
        panic!("boom");
    }

    async fn scope(gate: Arc<AtomicBool>) -> u32 {
        let mut a = 0u32;
        fork(&mut a, gated_panic(Arc::clone(&gate))).await;

        // Only reachable via a thief: the forking worker spins inside the
        // leaf until the gate opens here.
        gate.store(true, Ordering::Release);

        let mut saw_sentinel = false;
        let mut t = 0u32;
        for _ in 0..10_000_000u64 {
            match fork_sync(&mut t, tiny()).await {
                Err(ExceptionBeforeJoin) => {
                    saw_sentinel = true;
                    break;
                }
                Ok(_) => {}
            }
        }
        assert!(saw_sentinel, "sibling panic never surfaced as the sentinel");

        join().await; // rethrows the real payload
        unreachable!("join must rethrow");
    }

    let pool = BusyPool::new(2);
    let gate = Arc::new(AtomicBool::new(false));
    let err = catch_unwind(AssertUnwindSafe(|| sync_wait(&pool, scope(gate)))).unwrap_err();
    assert_eq!(err.downcast_ref::<&str>().copied(), Some("boom"));
}

/// Two back-to-back `resume_on` hops with the ancestor continuation still
/// queued on the original worker: it gets self-stolen and everything runs.
#[test]
fn self_steal_after_context_switch() {
    async fn hopper(dest: Arc<BusyPool>, hops: Arc<AtomicUsize>) -> u32 {
        resume_on(&*dest).await;
        hops.fetch_add(1, Ordering::SeqCst);
        resume_on(&*dest).await;
        hops.fetch_add(1, Ordering::SeqCst);
        7
    }

    async fn scope(dest: Arc<BusyPool>, hops: Arc<AtomicUsize>) -> u32 {
        let mut x = 0u32;
        fork(&mut x, hopper(dest, hops)).await;
        join().await;
        x
    }

    let home = BusyPool::new(2);
    let away = Arc::new(BusyPool::new(2));
    let hops = Arc::new(AtomicUsize::new(0));

    assert_eq!(
        sync_wait(&home, scope(Arc::clone(&away), Arc::clone(&hops))),
        7
    );
    assert_eq!(hops.load(Ordering::SeqCst), 2);
}

/// `detach` work completes before the pool destructor returns
/// (join-all-on-destroy).
#[test]
fn detach_completes_before_pool_drop() {
    async fn bump(hits: Arc<AtomicUsize>) {
        hits.fetch_add(1, Ordering::SeqCst);
    }

    async fn fanout(hits: Arc<AtomicUsize>) {
        for _ in 0..1000 {
            fork(Discard, bump(Arc::clone(&hits))).await;
        }
        join().await;
    }

    let hits = Arc::new(AtomicUsize::new(0));
    {
        let pool = BusyPool::new(4);
        detach(&pool, fanout(Arc::clone(&hits)));
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1000);
}

/// Single submitter, paced submissions: every worker sleeps in between and
/// none misses its wake-up.
#[test]
fn lazy_wakes_for_every_submission() {
    let pool = LazyPool::new(16);
    for n in 0..30u64 {
        assert_eq!(sync_wait(&pool, fib(n % 8)), fib_reference(n % 8));
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// NUMA domains only change steal order and sleep bookkeeping, not results.
#[test]
fn lazy_pool_with_domains() {
    let pool = crate::Builder::new()
        .worker_threads(4)
        .numa(vec![vec![0, 1], vec![2, 3]])
        .lazy();
    assert_eq!(sync_wait(&pool, fib(16)), fib_reference(16));
}

/// Stack allocations survive forks and joins of the enclosing scope.
#[test]
fn stack_allocation_survives_forks() {
    let pool = BusyPool::new(2);
    let got = sync_wait(&pool, async {
        let mut span = co_new::<u64>(512);
        for (i, slot) in span.iter_mut().enumerate() {
            *slot = i as u64;
        }

        let mut extra = 0u64;
        fork(&mut extra, fib(12)).await;
        join().await;

        span.iter().sum::<u64>() + extra
    });
    assert_eq!(got, (0..512).sum::<u64>() + fib_reference(12));
}

#[test]
fn schedule_inside_worker_is_rejected() {
    let pool = Arc::new(BusyPool::new(1));
    let inner = Arc::clone(&pool);
    let rejected = sync_wait(&pool, async move {
        matches!(schedule(&inner, produce(1)), Err(Error::ScheduleInWorker))
    });
    assert!(rejected);
}

#[test]
fn custom_thread_names_apply() {
    let seen = Arc::new(AtomicUsize::new(0));
    let observer = Arc::clone(&seen);
    let pool = crate::Builder::new()
        .worker_threads(2)
        .thread_name("cactus")
        .on_thread_start(move |index| {
            let name = std::thread::current().name().unwrap_or("").to_string();
            assert_eq!(name, format!("cactus-{index}"));
            observer.fetch_add(1, Ordering::SeqCst);
        })
        .busy();

    assert_eq!(sync_wait(&pool, produce(5)), 5);
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}
