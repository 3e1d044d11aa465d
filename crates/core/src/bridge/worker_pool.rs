//! Fixed-size thread pool for engine invocations.
//!
//! Workers are created once and reused for every offloaded call, so the
//! hosting loop never runs engine work itself. Results come back over a
//! oneshot channel and can be awaited from async code.

use std::future::Future;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender};
use tokio::sync::oneshot;

use super::BridgeError;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Resolves with the output of a job once a worker has run it.
pub(crate) struct ExecutionHandle<T> {
    result_receiver: oneshot::Receiver<T>,
}

impl<T> Future for ExecutionHandle<T> {
    type Output = Result<T, BridgeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.result_receiver)
            .poll(cx)
            .map(|res| res.map_err(|_| BridgeError::WorkerPanicked))
    }
}

pub(crate) struct WorkerPool {
    work_sender: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(size: NonZeroUsize) -> Result<Self, BridgeError> {
        let size: usize = size.into();
        // bounded to the pool size for backpressure
        let (work_sender, work_receiver) = bounded::<Job>(size);
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let receiver = work_receiver.clone();
            let shutdown = shutdown.clone();
            let handle = thread::Builder::new()
                .name(format!("engine-worker-{i}"))
                .spawn(move || worker_loop(receiver, shutdown))?;
            workers.push(handle);
        }

        tracing::info!(pool_size = size, "created engine worker pool");

        Ok(Self {
            work_sender,
            workers,
            shutdown,
        })
    }

    /// Runs `work` on a worker thread. Blocks while every worker is busy.
    pub fn execute<F, T>(&self, work: F) -> Result<ExecutionHandle<T>, BridgeError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (result_sender, result_receiver) = oneshot::channel();
        let job: Job = Box::new(move || {
            // receiver may be gone if the caller stopped waiting
            let _ = result_sender.send(work());
        });
        self.work_sender
            .send(job)
            .map_err(|_| BridgeError::NotRunning)?;
        Ok(ExecutionHandle { result_receiver })
    }

    #[cfg(test)]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // workers notice the flag on their next receive timeout
        self.workers.clear();
    }
}

fn worker_loop(receiver: Receiver<Job>, shutdown: Arc<AtomicBool>) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(job) => {
                // a panicking job drops its result sender, which the handle
                // reports as WorkerPanicked
                if let Err(panic_info) =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(job))
                {
                    let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = panic_info.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "Unknown panic".to_string()
                    };
                    tracing::error!(panic = %panic_msg, "engine worker caught panic");
                }
            }
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
        }
    }
}
