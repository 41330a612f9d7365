//! Fixed-size executor for background jobs.
//!
//! The queue is unbounded so a running job can enqueue follow-up work
//! without blocking; concurrency is capped by the number of worker threads.
//! A job that panics is logged and does not take its worker down.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{mpsc, Arc, Mutex, PoisonError},
    thread::{self, JoinHandle},
};

use log::{debug, error};

use crate::app_bootstrap::services::panic_message;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool is shut down")]
    ShutDown,
}

/// Cloneable submission handle. Jobs submitted after shutdown are rejected.
#[derive(Clone)]
pub struct WorkerHandle {
    sender: Arc<Mutex<Option<mpsc::Sender<Job>>>>,
}

impl WorkerHandle {
    pub fn spawn<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = guard.as_ref().ok_or(PoolError::ShutDown)?;
        sender.send(Box::new(job)).map_err(|_| PoolError::ShutDown)
    }
}

pub struct WorkerPool {
    handle: WorkerHandle,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size)
            .filter_map(|index| {
                let receiver = Arc::clone(&receiver);
                thread::Builder::new()
                    .name(format!("worker-{index}"))
                    .spawn(move || Self::worker_loop(&receiver))
                    .map_err(|err| error!("WorkerPool: failed to start worker {}: {}", index, err))
                    .ok()
            })
            .collect();
        debug!("WorkerPool: started {} workers", size);

        Self {
            handle: WorkerHandle {
                sender: Arc::new(Mutex::new(Some(sender))),
            },
            workers,
        }
    }

    fn worker_loop(receiver: &Mutex<mpsc::Receiver<Job>>) {
        loop {
            let next = receiver
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .recv();
            let Ok(job) = next else {
                break;
            };
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                error!(
                    "WorkerPool: job panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    pub fn spawn<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.spawn(job)
    }

    /// Stops accepting jobs, lets queued jobs drain and joins the workers.
    pub fn shutdown(mut self) {
        self.handle
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_jobs_run_and_drain_on_shutdown() {
        let pool = WorkerPool::new(3);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            pool.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect("spawn");
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_concurrency_is_capped_by_worker_count() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pool.spawn(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
                running.fetch_sub(1, Ordering::SeqCst);
            })
            .expect("spawn");
        }
        pool.shutdown();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_job_can_enqueue_follow_up_on_single_worker() {
        let pool = WorkerPool::new(1);
        let handle = pool.handle();
        let (done_tx, done_rx) = mpsc::channel();
        pool.spawn(move || {
            let _ = handle.spawn(move || {
                let _ = done_tx.send(());
            });
        })
        .expect("spawn");
        assert!(done_rx.recv_timeout(Duration::from_secs(1)).is_ok());
        pool.shutdown();
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new(1);
        pool.spawn(|| panic!("boom")).expect("spawn");
        let (done_tx, done_rx) = mpsc::channel();
        pool.spawn(move || {
            let _ = done_tx.send(());
        })
        .expect("spawn");
        assert!(done_rx.recv_timeout(Duration::from_secs(1)).is_ok());
        pool.shutdown();
    }

    #[test]
    fn test_spawn_after_shutdown_is_rejected() {
        let pool = WorkerPool::new(1);
        let handle = pool.handle();
        pool.shutdown();
        assert_eq!(handle.spawn(|| {}), Err(PoolError::ShutDown));
    }
}
