//! Foreground execution context.
//!
//! Background workers never touch UI-visible state directly: they post a job
//! here and the thread that owns the [`ForegroundQueue`] runs it.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use log::debug;

pub type ForegroundJob = Box<dyn FnOnce() + Send + 'static>;

/// Cloneable handle used by background code to schedule foreground work.
#[derive(Clone)]
pub struct ForegroundHandle {
    sender: Sender<ForegroundJob>,
}

impl ForegroundHandle {
    /// Queues `job` for the foreground thread. Returns false once the queue is gone.
    pub fn post<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let posted = self.sender.send(Box::new(job)).is_ok();
        if !posted {
            debug!("Foreground: queue closed, dropping job");
        }
        posted
    }
}

/// Job queue drained by the thread that owns UI-visible state.
pub struct ForegroundQueue {
    receiver: Receiver<ForegroundJob>,
    handle: ForegroundHandle,
}

impl ForegroundQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            receiver,
            handle: ForegroundHandle { sender },
        }
    }

    pub fn handle(&self) -> ForegroundHandle {
        self.handle.clone()
    }

    /// Runs every job already queued without waiting. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0usize;
        while let Ok(job) = self.receiver.try_recv() {
            job();
            ran += 1;
        }
        ran
    }

    /// Waits up to `timeout` for one job and runs it.
    pub fn run_next(&self, timeout: Duration) -> bool {
        match self.receiver.recv_timeout(timeout) {
            Ok(job) => {
                job();
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Runs jobs until `done` returns true or `timeout` elapses.
    pub fn run_until<F>(&self, timeout: Duration, mut done: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            self.run_pending();
            if done() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            self.run_next(remaining.min(Duration::from_millis(50)));
        }
    }
}

impl Default for ForegroundQueue {
    fn default() -> Self {
        Self::new()
    }
}
