// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A fixed-size pool of worker threads.
//!
//! Jobs submitted with [`WorkPool::execute`] run on one of the pool's
//! threads in submission order.  [`WorkPool::wait`] blocks until the pool is
//! quiescent: the queue is empty *and* no worker is mid-job.  That second
//! half matters to callers that must know no submitted work is still
//! touching shared hardware (the SMBus retraining path relies on it).
//!
//! Dropping the pool closes the queue and joins every worker; jobs already
//! queued still run.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use log::trace;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    state: Mutex<State>,
    /// Signaled when a job is queued or the queue is closed.
    job_ready: Condvar,
    /// Signaled when a worker finishes a job or drains the queue.
    idle: Condvar,
}

struct State {
    queue: VecDeque<Job>,
    active: usize,
    closed: bool,
}

pub struct WorkPool {
    inner: Arc<Inner>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkPool {
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn new(size: usize) -> Self {
        assert!(size > 0);

        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                active: 0,
                closed: false,
            }),
            job_ready: Condvar::new(),
            idle: Condvar::new(),
        });

        let workers = (0..size)
            .map(|n| {
                let inner = Arc::clone(&inner);
                thread::Builder::new()
                    .name(format!("worker-{n}"))
                    .spawn(move || worker_loop(&inner))
                    .expect("spawning pool worker")
            })
            .collect();

        Self { inner, workers }
    }

    /// Queues a job.  Returns `false` if the pool has been stopped.
    pub fn execute<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return false;
        }
        state.queue.push_back(Box::new(job));
        drop(state);
        self.inner.job_ready.notify_one();
        true
    }

    /// Blocks until no job is queued or running.
    pub fn wait(&self) {
        let mut state = self.inner.state.lock().unwrap();
        while !state.queue.is_empty() || state.active > 0 {
            state = self.inner.idle.wait(state).unwrap();
        }
    }

    /// Closes the queue and joins the workers.  Queued jobs still run.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.closed = true;
        }
        self.inner.job_ready.notify_all();
        for handle in self.workers.drain(..) {
            // A worker that panicked already made noise; nothing to add.
            let _ = handle.join();
        }
    }
}

impl Drop for WorkPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.shutdown();
        }
    }
}

fn worker_loop(inner: &Inner) {
    loop {
        let job = {
            let mut state = inner.state.lock().unwrap();
            loop {
                if let Some(job) = state.queue.pop_front() {
                    state.active += 1;
                    break job;
                }
                if state.closed {
                    return;
                }
                state = inner.job_ready.wait(state).unwrap();
            }
        };

        trace!("worker picked up a job");
        job();

        let mut state = inner.state.lock().unwrap();
        state.active -= 1;
        let quiescent = state.active == 0 && state.queue.is_empty();
        drop(state);
        if quiescent {
            inner.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn runs_submitted_jobs() {
        let pool = WorkPool::new(4);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let count = Arc::clone(&count);
            assert!(pool.execute(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.wait();
        assert_eq!(count.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn wait_covers_running_jobs() {
        // wait() must not return while a slow job is still executing, even
        // when the queue itself is already empty.
        let pool = WorkPool::new(1);
        let done = Arc::new(AtomicUsize::new(0));
        let done2 = Arc::clone(&done);
        pool.execute(move || {
            thread::sleep(Duration::from_millis(100));
            done2.store(1, Ordering::SeqCst);
        });
        // Give the worker time to dequeue the job.
        thread::sleep(Duration::from_millis(20));
        pool.wait();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_drains_queue() {
        let pool = WorkPool::new(2);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let count = Arc::clone(&count);
            pool.execute(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.stop();
        assert_eq!(count.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn execute_after_stop_is_refused() {
        let mut pool = WorkPool::new(1);
        pool.shutdown();
        assert!(!pool.execute(|| {}));
    }
}
