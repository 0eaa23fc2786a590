//! Fixed-size pool of background threads for network I/O.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use log::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs submitted jobs on a fixed number of named threads.
///
/// Workers exit once every handle to the pool has been dropped and the queue
/// drains; dropping does not join them.
#[derive(Clone)]
pub struct WorkerPool {
    sender: Sender<Job>,
    name: Arc<str>,
}

impl WorkerPool {
    pub fn new(name: &str, workers: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = workers.max(1);
        for index in 0..workers {
            let receiver = Arc::clone(&receiver);
            let spawn_result = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || worker_loop(receiver));
            if let Err(err) = spawn_result {
                warn!("WorkerPool[{}]: failed to spawn worker {}: {}", name, index, err);
            }
        }
        debug!("WorkerPool[{}]: started {} workers", name, workers);
        Self {
            sender,
            name: Arc::from(name),
        }
    }

    /// Pool whose queue is already closed, so every `execute` fails.
    #[cfg(test)]
    pub(crate) fn without_workers(name: &str) -> Self {
        let (sender, _receiver) = mpsc::channel::<Job>();
        Self {
            sender,
            name: Arc::from(name),
        }
    }

    /// Queues `job`. Returns false if no worker can run it anymore.
    pub fn execute<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.sender.send(Box::new(job)).is_err() {
            warn!("WorkerPool[{}]: all workers are gone, job dropped", self.name);
            return false;
        }
        true
    }
}

/// Locks `mutex`, taking the data back from a poisoned lock.
pub fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn worker_loop(receiver: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let next = lock_or_recover(&receiver).recv();
        match next {
            Ok(job) => {
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
                    log::error!(
                        "WorkerPool: job panicked on thread '{}'",
                        thread::current().name().unwrap_or("unnamed")
                    );
                }
            }
            Err(_) => break,
        }
    }
}
