// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::future::Future;
use std::pin::Pin;

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Fixed-size pool of workers that execute go-active tasks.
///
/// Workers share a bounded queue, so a peer that generates transition edges
/// faster than the cloud can absorb them cannot queue unbounded work. The
/// reconcile loop runs elsewhere and re-asserts anything a full queue drops.
pub struct WorkerPool {
    queue: async_channel::Sender<Task>,
    workers: usize,
}

impl WorkerPool {
    /// Spawns `workers` consumers onto the current tokio runtime.
    pub fn new(workers: usize) -> WorkerPool {
        assert!(workers > 0, "worker pool requires at least one worker");

        let (queue, receiver) = async_channel::bounded::<Task>(workers * 4);
        for n in 0..workers {
            let receiver = receiver.clone();
            tokio::spawn(async move {
                while let Ok(task) = receiver.recv().await {
                    task.await;
                }
                log::debug!("pool worker {n} shutting down");
            });
        }

        WorkerPool { queue, workers }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Enqueues a task without waiting. Returns false when the queue is full
    /// and the task was dropped.
    pub fn submit(&self, task: impl Future<Output = ()> + Send + 'static) -> bool {
        self.queue.try_send(Box::pin(task)).is_ok()
    }
}
