//! Shared bounded worker pool and retry chains
//!
//! Every asynchronous protocol task (share fan-out, deferred STORE handling,
//! shuffle hops) runs on the node's [`TaskPool`]. Waiting never blocks a
//! worker: a task that cannot make progress schedules a fresh continuation
//! after a delay. A retry chain only schedules its next attempt once the
//! current attempt has returned, so attempts of one chain never overlap.

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify, Semaphore};
use tracing::{debug, warn};

use crate::error::MixnetError;

struct TaskTracker {
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Decrements the in-flight count when a task finishes or is abandoned
struct InFlight(Arc<TaskTracker>);

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Bounded pool for immediate and delayed tasks
pub struct TaskPool {
    permits: Arc<Semaphore>,
    workers: usize,
    shutdown: watch::Sender<bool>,
    accepting: AtomicBool,
    tracker: Arc<TaskTracker>,
    self_ref: Weak<TaskPool>,
}

impl TaskPool {
    pub fn new(max_concurrent_tasks: usize) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let workers = max_concurrent_tasks.max(1);
        Arc::new_cyclic(|weak| Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            shutdown,
            accepting: AtomicBool::new(true),
            tracker: Arc::new(TaskTracker {
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
            self_ref: weak.clone(),
        })
    }

    /// Run a task as soon as a worker is free.
    pub fn execute<F>(&self, task: F) -> Result<(), MixnetError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn(None, task)
    }

    /// Run a task once `delay` has elapsed and a worker is free.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> Result<(), MixnetError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn(Some(delay), task)
    }

    fn spawn<F>(&self, delay: Option<Duration>, task: F) -> Result<(), MixnetError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(MixnetError::ShuttingDown);
        }

        self.tracker.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight(Arc::clone(&self.tracker));
        let permits = Arc::clone(&self.permits);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let _guard = guard;
            let ready = async {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                permits.acquire_owned().await
            };

            // Queued and delayed tasks are abandoned on shutdown; running ones finish.
            let permit = tokio::select! {
                _ = shutdown.wait_for(|stopped| *stopped) => {
                    debug!("abandoning queued task on shutdown");
                    return;
                }
                permit = ready => permit,
            };

            if let Ok(permit) = permit {
                task.await;
                drop(permit);
            }
        });
        Ok(())
    }

    /// Start a retry chain; the first attempt runs immediately.
    pub fn start_retry<T: RetryTask>(&self, task: T, policy: RetryPolicy) -> Result<(), MixnetError> {
        let chain = RetryChain {
            pool: self.self_ref.clone(),
            task: Arc::new(task),
            policy,
        };
        self.execute(chain.run(RetryState::Pending { attempts: 0 }))
    }

    /// Start a retry chain whose first attempt waits one interval.
    pub fn schedule_retry<T: RetryTask>(&self, task: T, policy: RetryPolicy) -> Result<(), MixnetError> {
        let chain = RetryChain {
            pool: self.self_ref.clone(),
            task: Arc::new(task),
            policy,
        };
        self.schedule(policy.interval, chain.run(RetryState::Pending { attempts: 0 }))
    }

    /// Number of tasks queued, delayed or running
    pub fn in_flight(&self) -> usize {
        self.tracker.in_flight.load(Ordering::SeqCst)
    }

    /// Number of tasks currently holding a worker
    pub fn running(&self) -> usize {
        self.workers.saturating_sub(self.permits.available_permits())
    }

    /// Tasks waiting for a worker or for their delay to elapse
    pub fn queued(&self) -> usize {
        self.in_flight().saturating_sub(self.running())
    }

    pub fn is_shutdown(&self) -> bool {
        !self.accepting.load(Ordering::SeqCst)
    }

    /// Stop accepting tasks, abandon queued and delayed ones and wait up to
    /// `timeout` for running tasks. Returns whether the pool drained in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.accepting.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(true);

        let tracker = Arc::clone(&self.tracker);
        let drained = async move {
            loop {
                let notified = tracker.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if tracker.in_flight.load(Ordering::SeqCst) == 0 {
                    break;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}

/// Position of a retry chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// `attempts` attempts have completed without success
    Pending { attempts: u32 },
    /// The attempt budget is spent; the chain stops
    Abandoned { attempts: u32 },
}

/// Outcome of one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Done,
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn unbounded(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }

    fn next_state(&self, attempts: u32) -> RetryState {
        match self.max_attempts {
            Some(max) if attempts >= max => RetryState::Abandoned { attempts },
            _ => RetryState::Pending { attempts },
        }
    }
}

/// A unit of work that may need several attempts
#[async_trait]
pub trait RetryTask: Send + Sync + 'static {
    /// Short description for logs
    fn describe(&self) -> String;

    /// Run attempt number `attempt` (1-based).
    async fn attempt(&self, attempt: u32) -> Attempt;

    fn on_abandoned(&self, attempts: u32) {
        warn!(task = %self.describe(), attempts, "retry chain abandoned");
    }
}

struct RetryChain<T: RetryTask> {
    pool: Weak<TaskPool>,
    task: Arc<T>,
    policy: RetryPolicy,
}

impl<T: RetryTask> RetryChain<T> {
    fn run(self, state: RetryState) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let attempts = match state {
                RetryState::Pending { attempts } => attempts,
                RetryState::Abandoned { attempts } => {
                    self.task.on_abandoned(attempts);
                    return;
                }
            };

            match self.task.attempt(attempts + 1).await {
                Attempt::Done => {
                    debug!(task = %self.task.describe(), attempts = attempts + 1, "task complete");
                }
                Attempt::Retry => {
                    let next = self.policy.next_state(attempts + 1);
                    if let RetryState::Abandoned { attempts } = next {
                        self.task.on_abandoned(attempts);
                        return;
                    }
                    let Some(pool) = self.pool.upgrade() else {
                        return;
                    };
                    let description = self.task.describe();
                    let interval = self.policy.interval;
                    if pool.schedule(interval, self.run(next)).is_err() {
                        debug!(task = %description, "retry dropped, pool is shutting down");
                    }
                }
            }
        })
    }
}
