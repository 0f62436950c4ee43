//! Worker thread pool.
//!
//! A fixed set of workers pulling jobs from a single FIFO guarded by a
//! mutex and signalled through a binary semaphore. The pool is a uniform
//! executor: the priority nice on a job is carried for observability but
//! never consulted here — ordering between jobs is the scheduler's
//! responsibility.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::trace;

/// Binary semaphore: `wait` blocks until a post has been observed and
/// consumes it.
pub struct BinarySemaphore {
    state: Mutex<bool>,
    cond: Condvar,
}

impl BinarySemaphore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn post(&self) {
        *self.state.lock().unwrap() = true;
        self.cond.notify_one();
    }

    pub fn post_all(&self) {
        *self.state.lock().unwrap() = true;
        self.cond.notify_all();
    }

    pub fn wait(&self) {
        let mut signalled = self.state.lock().unwrap();
        while !*signalled {
            signalled = self.cond.wait(signalled).unwrap();
        }
        *signalled = false;
    }
}

impl Default for BinarySemaphore {
    fn default() -> Self {
        Self::new()
    }
}

struct Job<T> {
    payload: T,
    nice: i32,
}

struct PoolShared<T> {
    queue: Mutex<VecDeque<Job<T>>>,
    has_jobs: BinarySemaphore,
    keep_alive: AtomicBool,
    num_working: AtomicUsize,
    num_alive: AtomicUsize,
}

pub struct ThreadPool<T: Send + 'static> {
    shared: Arc<PoolShared<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> ThreadPool<T> {
    /// Spawn `num_threads` workers, each invoking `runner` on the jobs it
    /// pulls.
    pub fn new<F>(num_threads: usize, runner: F) -> io::Result<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            has_jobs: BinarySemaphore::new(),
            keep_alive: AtomicBool::new(true),
            num_working: AtomicUsize::new(0),
            num_alive: AtomicUsize::new(0),
        });
        let runner = Arc::new(runner);

        let mut workers = Vec::with_capacity(num_threads);
        for n in 0..num_threads {
            let shared = Arc::clone(&shared);
            let runner = Arc::clone(&runner);
            shared.num_alive.fetch_add(1, Ordering::SeqCst);
            let handle = thread::Builder::new()
                .name(format!("worker-{n}"))
                .spawn(move || worker_loop(shared, runner))?;
            workers.push(handle);
        }

        Ok(Self { shared, workers })
    }

    /// Link a job at the rear of the queue and wake a worker.
    pub fn add_work(&self, payload: T, nice: i32) {
        trace!("queueing job with nice {nice}");
        let mut queue = self.shared.queue.lock().unwrap();
        queue.push_back(Job { payload, nice });
        self.shared.has_jobs.post();
    }

    /// Number of workers currently inside a job.
    pub fn num_working(&self) -> usize {
        self.shared.num_working.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    /// Stop accepting work and join every worker.
    pub fn shutdown(self) {
        // Drop runs the teardown.
    }
}

impl<T: Send + 'static> Drop for ThreadPool<T> {
    fn drop(&mut self) {
        self.shared.keep_alive.store(false, Ordering::SeqCst);
        while self.shared.num_alive.load(Ordering::SeqCst) > 0 {
            self.shared.has_jobs.post_all();
            thread::sleep(Duration::from_millis(10));
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop<T, F>(shared: Arc<PoolShared<T>>, runner: Arc<F>)
where
    F: Fn(T) + Send + Sync,
{
    loop {
        shared.has_jobs.wait();
        if !shared.keep_alive.load(Ordering::SeqCst) {
            break;
        }

        let job = {
            let mut queue = shared.queue.lock().unwrap();
            let job = queue.pop_front();
            // Keep the semaphore posted while work remains so the next
            // waiter also wakes.
            if !queue.is_empty() {
                shared.has_jobs.post();
            }
            job
        };

        if let Some(job) = job {
            shared.num_working.fetch_add(1, Ordering::SeqCst);
            trace!("running job with nice {}", job.nice);
            runner(job.payload);
            shared.num_working.fetch_sub(1, Ordering::SeqCst);
        }
    }
    shared.num_alive.fetch_sub(1, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;

    fn wait_until(deadline_ms: u64, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn every_job_runs_exactly_once() {
        let seen: Arc<StdMutex<Vec<u32>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let pool = ThreadPool::new(4, move |n: u32| {
            sink.lock().unwrap().push(n);
        })
        .unwrap();

        for n in 0..100 {
            pool.add_work(n, 0);
        }
        assert!(wait_until(2_000, || seen.lock().unwrap().len() == 100));
        pool.shutdown();

        let mut executed = seen.lock().unwrap().clone();
        executed.sort_unstable();
        assert_eq!(executed, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn shutdown_joins_idle_workers() {
        let pool = ThreadPool::new(3, |_: ()| {}).unwrap();
        assert_eq!(pool.num_working(), 0);
        pool.shutdown();
    }

    #[test]
    fn queued_jobs_drain_after_single_burst() {
        let counter = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&counter);
        let pool = ThreadPool::new(1, move |_: ()| {
            sink.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(1));
        })
        .unwrap();

        for _ in 0..10 {
            pool.add_work((), 5);
        }
        assert!(wait_until(2_000, || counter.load(Ordering::SeqCst) == 10));
    }
}
