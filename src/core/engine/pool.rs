use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::error::{Error, Result};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of named worker threads sharing one task channel.
///
/// A panicking task is logged and does not take its worker down.
pub struct WorkerPool {
    name: String,
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(name: &str, size: usize) -> Result<Self> {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<Task>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = Arc::clone(&receiver);
            let pool = name.to_string();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || worker_loop(&pool, receiver))
                .map_err(|e| {
                    Error::internal_unexpected(format!("failed to spawn {} worker: {}", name, e))
                })?;
            workers.push(handle);
        }

        tracing::debug!(pool = %name, size, "Worker pool started");
        Ok(Self {
            name: name.to_string(),
            sender: Some(sender),
            workers,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn execute<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or_else(Error::executor_terminated)?;
        sender
            .send(Box::new(task))
            .map_err(|_| Error::executor_terminated())
    }

    /// Stop accepting tasks, drain the queue and join every worker.
    pub fn join(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!(pool = %self.name, "Worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.join();
    }
}

fn worker_loop(pool: &str, receiver: Arc<Mutex<Receiver<Task>>>) {
    loop {
        let task = match receiver.lock() {
            Ok(rx) => rx.recv(),
            Err(_) => break,
        };
        match task {
            Ok(task) => {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
                    tracing::error!(pool = %pool, "Task panicked: {}", panic_message(payload.as_ref()));
                }
            }
            Err(_) => break,
        }
    }
}

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
