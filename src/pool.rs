//! Bounded-concurrency worker pool.
//!
//! Fans one channel out across a fixed number of named threads. Each worker
//! calls the handler per message and exits once the channel disconnects.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;

use crate::error::{ViewError, ViewResult};

/// A pool that has not been started yet.
pub struct WorkerPool<T> {
    name: String,
    rx: Receiver<T>,
    handler: Arc<dyn Fn(T) + Send + Sync>,
    concurrency: usize,
}

impl<T: Send + 'static> WorkerPool<T> {
    #[must_use]
    pub fn new<F>(name: impl Into<String>, rx: Receiver<T>, handler: F, concurrency: usize) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            rx,
            handler: Arc::new(handler),
            concurrency: concurrency.max(1),
        }
    }

    /// Spawn the workers.
    pub fn start(self) -> ViewResult<WorkerPoolHandle> {
        let mut workers = Vec::with_capacity(self.concurrency);
        for i in 0..self.concurrency {
            let rx = self.rx.clone();
            let handler = Arc::clone(&self.handler);
            let join = thread::Builder::new()
                .name(format!("{}-{i}", self.name))
                .spawn(move || {
                    for item in rx.iter() {
                        handler(item);
                    }
                })
                .map_err(|e| ViewError::internal(format!("spawn worker {}: {e}", self.name)))?;
            workers.push(join);
        }
        Ok(WorkerPoolHandle {
            name: self.name,
            workers,
        })
    }
}

/// Running workers. Dropping the handle detaches them.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    name: String,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPoolHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wait for every worker to exit. Only returns once the input channel has
    /// disconnected, so never call it from inside a handler.
    pub fn join(self) {
        for w in self.workers {
            let _ = w.join();
        }
    }
}
