//! Fixed-size worker pool for dispatch tasks.
//!
//! Workers share one FIFO channel; an idle worker blocks on it. Shutdown
//! closes the channel, lets the workers drain what is already queued, and
//! joins them.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, error, info};

use crate::error::lock;
use crate::{Error, Result};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidConfig("worker pool needs at least one thread"));
        }
        let (tx, rx) = mpsc::channel::<Task>();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(size);
        for worker_id in 0..size {
            let rx = Arc::clone(&rx);
            let handle = thread::Builder::new()
                .name(format!("micromq-worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, rx))?;
            workers.push(handle);
        }
        info!("worker pool started with {size} threads");
        Ok(Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queues a task. Never blocks on execution.
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = lock(&self.sender, "worker pool")?;
        match sender.as_ref() {
            Some(tx) => tx.send(Box::new(task)).map_err(|_| Error::PoolShutdown),
            None => Err(Error::PoolShutdown),
        }
    }

    /// Stops accepting tasks, runs the ones already queued, joins every
    /// worker. Idempotent.
    pub fn shutdown(&self) {
        let sender = match self.sender.lock() {
            Ok(mut sender) => sender.take(),
            Err(_) => None,
        };
        drop(sender);
        let workers = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => Vec::new(),
        };
        if workers.is_empty() {
            return;
        }
        for handle in workers {
            if handle.join().is_err() {
                error!("worker thread panicked during shutdown");
            }
        }
        info!("worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(worker_id: usize, rx: Arc<Mutex<Receiver<Task>>>) {
    loop {
        // Hold the receiver lock only while waiting, never while running.
        let task = match rx.lock() {
            Ok(rx) => rx.recv(),
            Err(_) => break,
        };
        let task = match task {
            Ok(task) => task,
            Err(_) => break,
        };
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!("worker {worker_id}: task panicked");
        }
    }
    debug!("worker {worker_id} exiting");
}
