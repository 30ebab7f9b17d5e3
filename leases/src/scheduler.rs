//! Work queue used to run lease callbacks and network continuations off the
//! registering thread.
//!
//! Abort notifiers are never invoked inline by the registry or the
//! invalidation engine; they are handed to a [`Scheduler`] instead. The
//! [`WorkerPool`] is the tokio-backed implementation used in production and
//! tests.

use crate::{Error, Result};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Zero-argument work item
pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub trait Scheduler: Send + Sync {
    /// Enqueue a closure to run on a worker.
    fn queue(&self, job: Job) -> Result<()>;

    /// Run an async continuation (typically a network call) to completion.
    fn spawn(&self, task: BoxFuture<'static, ()>) -> Result<()>;
}

enum Task {
    Run(Job),
    Await(BoxFuture<'static, ()>),
}

/// Counts queued and running work so that callers can wait for quiescence.
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

/// Decrements the in-flight count on drop, so a panicking job still settles.
struct Pending(Arc<InFlight>);

impl Drop for Pending {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Fixed set of tokio worker tasks draining one shared queue.
pub struct WorkerPool {
    tx: Mutex<Option<mpsc::UnboundedSender<(Task, Pending)>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    in_flight: Arc<InFlight>,
}

impl WorkerPool {
    /// Start `threads` workers on the current tokio runtime.
    pub fn start(threads: usize) -> Result<Arc<Self>> {
        if threads == 0 {
            return Err(Error::Config("scheduler needs at least one worker".to_string()));
        }
        let handle = tokio::runtime::Handle::try_current().map_err(|e| {
            Error::MissingCollaborator(format!("scheduler requires a tokio runtime: {e}"))
        })?;

        let (tx, rx) = mpsc::unbounded_channel::<(Task, Pending)>();
        let rx = Arc::new(AsyncMutex::new(rx));

        let workers = (0..threads)
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let handle_for_tasks = handle.clone();
                handle.spawn(async move {
                    loop {
                        let next = { rx.lock().await.recv().await };
                        let Some((task, pending)) = next else {
                            break;
                        };
                        match task {
                            Task::Run(job) => {
                                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                                    error!(worker, "Scheduled job panicked");
                                }
                                drop(pending);
                            }
                            Task::Await(future) => {
                                handle_for_tasks.spawn(async move {
                                    future.await;
                                    drop(pending);
                                });
                            }
                        }
                    }
                    debug!(worker, "Worker stopped");
                })
            })
            .collect();

        info!(threads, "Worker pool started");
        Ok(Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            in_flight: Arc::new(InFlight::default()),
        }))
    }

    fn submit(&self, task: Task) -> Result<()> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(Error::SchedulerShutdown)?;

        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        let pending = Pending(Arc::clone(&self.in_flight));
        // On a closed channel the returned tuple drops `pending`, undoing the count
        tx.send((task, pending)).map_err(|_| Error::SchedulerShutdown)
    }

    /// Number of jobs and continuations not yet finished
    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Wait until every queued job and spawned continuation has completed,
    /// including work enqueued by that work.
    pub async fn drain(&self) {
        loop {
            let idle = self.in_flight.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Drain, stop accepting work, then join the workers. Continuations
    /// still running after the join are awaited too, so a batched abort
    /// flush that is waiting out its window is not lost.
    pub async fn shutdown(&self) {
        self.drain().await;
        self.tx.lock().take();
        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Worker terminated abnormally");
            }
        }
        self.drain().await;
        info!("Worker pool shut down");
    }
}

impl Scheduler for WorkerPool {
    fn queue(&self, job: Job) -> Result<()> {
        self.submit(Task::Run(job))
    }

    fn spawn(&self, task: BoxFuture<'static, ()>) -> Result<()> {
        self.submit(Task::Await(task))
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.lock().len())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
