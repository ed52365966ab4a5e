//! Bounded worker pool shared by the parse, OCR and upload stages.
//!
//! Jobs are submitted to a [`TaskBatch`]; `join_all` runs them on at most
//! `workers` threads and returns results in submission order, regardless of
//! completion order. A panicking job yields `Err(PoolError::Panicked)` for that
//! slot only.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker panicked: {0}")]
    Panicked(String),

    #[error("worker result lost")]
    Lost,
}

type Job<R> = Box<dyn FnOnce() -> R + Send + 'static>;

#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Start a new batch of jobs returning `R`.
    pub fn batch<R: Send + 'static>(&self) -> TaskBatch<R> {
        TaskBatch {
            workers: self.workers,
            jobs: Vec::new(),
        }
    }
}

pub struct TaskBatch<R> {
    workers: usize,
    jobs: Vec<Job<R>>,
}

impl<R: Send + 'static> TaskBatch<R> {
    /// Queue a job. Returns its index in the eventual result vector.
    pub fn submit<F>(&mut self, job: F) -> usize
    where
        F: FnOnce() -> R + Send + 'static,
    {
        self.jobs.push(Box::new(job));
        self.jobs.len() - 1
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Run every queued job and block until all complete.
    pub fn join_all(self) -> Vec<Result<R, PoolError>> {
        let total = self.jobs.len();
        if total == 0 {
            return Vec::new();
        }

        let queue: Arc<Mutex<VecDeque<(usize, Job<R>)>>> =
            Arc::new(Mutex::new(self.jobs.into_iter().enumerate().collect()));
        let (tx, rx) = mpsc::channel::<(usize, Result<R, PoolError>)>();

        let thread_count = self.workers.min(total);
        let mut handles = Vec::with_capacity(thread_count);
        for _ in 0..thread_count {
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            handles.push(std::thread::spawn(move || loop {
                let next = match queue.lock() {
                    Ok(mut q) => q.pop_front(),
                    Err(_) => None,
                };
                let Some((index, job)) = next else {
                    break;
                };
                let outcome = catch_unwind(AssertUnwindSafe(job))
                    .map_err(|payload| PoolError::Panicked(panic_message(&*payload)));
                if tx.send((index, outcome)).is_err() {
                    break;
                }
            }));
        }
        drop(tx);

        let mut slots: Vec<Option<Result<R, PoolError>>> = (0..total).map(|_| None).collect();
        for (index, outcome) in rx {
            slots[index] = Some(outcome);
        }
        for handle in handles {
            let _ = handle.join();
        }

        slots
            .into_iter()
            .map(|slot| slot.unwrap_or(Err(PoolError::Lost)))
            .collect()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
