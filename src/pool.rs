use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rayon::ThreadPool;
use tracing::warn;

/// A pool that runs reaction bodies and scheduling decisions.
///
/// Thin contract over a [`rayon::ThreadPool`]: `submit` runs a task
/// asynchronously with no ordering or thread-affinity guarantee, `shutdown`
/// refuses further submissions and waits a bounded time for running tasks,
/// `is_inactive` reports the terminal state.
pub struct ReactionPool {
    name: String,
    pool: ThreadPool,
    shut_down: AtomicBool,
    in_flight: Mutex<usize>,
    drained: Condvar,
}

impl ReactionPool {
    /// If `None` is passed for the number of threads, one thread per
    /// hardware thread is used.
    pub fn new(name: &str, threads: Option<usize>) -> Arc<ReactionPool> {
        let threads = threads
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(4, |it| it.get()));
        let thread_prefix = name.to_owned();
        let panic_pool = name.to_owned();
        let pool = rayon::ThreadPoolBuilder::new()
            .thread_name(move |i| format!("{thread_prefix} worker {i}"))
            .num_threads(threads)
            .panic_handler(move |_| warn!(pool = %panic_pool, "task panicked"))
            .build()
            .expect("creating threadpool failed");
        Arc::new(ReactionPool {
            name: name.to_owned(),
            pool,
            shut_down: AtomicBool::new(false),
            in_flight: Mutex::new(0),
            drained: Condvar::new(),
        })
    }

    /// Runs `task` asynchronously. Returns `false` without running it when
    /// the pool is shut down.
    pub fn submit(self: &Arc<Self>, task: impl FnOnce() + Send + 'static) -> bool {
        if self.shut_down.load(Ordering::Acquire) {
            warn!(pool = %self.name, "task refused: pool is shut down");
            return false;
        }
        *self.in_flight.lock() += 1;
        let pool = self.clone();
        self.pool.spawn(move || {
            task();
            let mut in_flight = pool.in_flight.lock();
            *in_flight -= 1;
            if *in_flight == 0 {
                pool.drained.notify_all();
            }
        });
        true
    }

    /// Refuses further submissions and waits up to `grace` for in-flight
    /// tasks to finish. Running tasks are never interrupted.
    pub fn shutdown(&self, grace: Duration) {
        self.shut_down.store(true, Ordering::Release);
        let mut in_flight = self.in_flight.lock();
        if *in_flight > 0 {
            self.drained.wait_for(&mut in_flight, grace);
        }
    }

    pub fn is_inactive(&self) -> bool {
        self.shut_down.load(Ordering::Acquire) && *self.in_flight.lock() == 0
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn submitted_tasks_run() {
        let pool = ReactionPool::new("test", Some(2));
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let counter = counter.clone();
            assert!(pool.submit(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            }));
        }
        pool.shutdown(Duration::from_secs(2));
        assert_eq!(counter.load(Ordering::Relaxed), 16);
        assert!(pool.is_inactive());
    }

    #[test]
    fn shutdown_refuses_new_tasks() {
        let pool = ReactionPool::new("test", Some(1));
        pool.shutdown(Duration::from_millis(100));
        assert!(!pool.submit(|| panic!("must not run")));
        assert!(pool.is_inactive());
    }

    #[test]
    fn shutdown_waits_for_running_tasks() {
        let pool = ReactionPool::new("test", Some(1));
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        pool.submit(move || {
            std::thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::Release);
        });
        pool.shutdown(Duration::from_secs(2));
        assert!(done.load(Ordering::Acquire));
    }
}
