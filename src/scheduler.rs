//! Bounded FIFO download scheduler.
//!
//! Admits up to `max_concurrent_downloads` active jobs, keeps the rest
//! queued in submission order, and promotes the head of the queue when a
//! worker reaches a terminal state. `snapshot` is synchronous so a
//! single-threaded render loop can poll it every frame.

use std::sync::{Arc, Mutex};

use reqwest::Client;
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::job::{GameDescriptor, JobShared, JobState, JobStatus};
use crate::notify::{JobEvent, NotificationSink};
use crate::process::ProcessRunner;
use crate::scrape::Scraper;
use crate::worker::Worker;

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("{0} is already downloading")]
    DuplicateKey(String),

    #[error("no tracked job named {0}")]
    NotFound(String),

    #[error("{0} is still active")]
    Active(String),
}

/// Public handle; cheap to clone and share with the UI thread.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    config: Arc<PipelineConfig>,
    client: Client,
    runner: Arc<dyn ProcessRunner>,
    scraper: Option<Arc<Scraper>>,
    sink: Arc<dyn NotificationSink>,
    handle: tokio::runtime::Handle,
    /// Tracked jobs in submission order.
    jobs: Mutex<Vec<Arc<JobShared>>>,
}

impl Scheduler {
    /// Must be called from within a tokio runtime; workers are spawned on
    /// the calling runtime.
    pub fn new(
        config: Arc<PipelineConfig>,
        client: Client,
        runner: Arc<dyn ProcessRunner>,
        scraper: Option<Arc<Scraper>>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                client,
                runner,
                scraper,
                sink,
                handle: tokio::runtime::Handle::current(),
                jobs: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Track a new job. Admits it immediately when a slot is free,
    /// otherwise leaves it queued with a position.
    pub fn submit(&self, game: GameDescriptor) -> Result<Arc<JobShared>, SchedulerError> {
        let mut jobs = self.inner.jobs.lock().unwrap();

        if jobs
            .iter()
            .any(|j| j.key() == game.name && !j.state().is_terminal())
        {
            return Err(SchedulerError::DuplicateKey(game.name));
        }
        // Resubmitting over a finished job implies the UI is done with it.
        jobs.retain(|j| !(j.key() == game.name && j.state().is_terminal()));

        debug!("Submitted job {}", game.name);
        let job = Arc::new(JobShared::new(game));
        jobs.push(Arc::clone(&job));
        self.inner.rebalance(&mut jobs);
        Ok(job)
    }

    /// Request cancellation. A queued job is removed on the spot; an
    /// active one is signalled and unwinds through its worker. Repeat
    /// calls on a cancelling job are a no-op.
    pub fn cancel(&self, key: &str) -> Result<(), SchedulerError> {
        // Collected while locked, delivered after: sinks may call back
        // into the scheduler.
        let mut event = None;
        {
            let mut jobs = self.inner.jobs.lock().unwrap();
            let Some(index) = jobs.iter().position(|j| j.key() == key) else {
                return Err(SchedulerError::NotFound(key.to_string()));
            };

            let job = Arc::clone(&jobs[index]);
            match job.state() {
                JobState::Queued => {
                    job.set_state(JobState::Cancelled);
                    jobs.remove(index);
                    self.inner.rebalance(&mut jobs);
                    info!("Removed queued job {}", key);
                    event = Some(JobEvent::Cancelled {
                        key: key.to_string(),
                    });
                }
                state if state.is_active() => {
                    job.set_state(JobState::Cancelling);
                    job.cancel.cancel();
                }
                _ => {}
            }
        }
        if let Some(event) = event {
            self.inner.sink.notify(&event);
        }
        Ok(())
    }

    /// Drop a terminal job from the tracked set.
    pub fn acknowledge(&self, key: &str) -> Result<(), SchedulerError> {
        let mut jobs = self.inner.jobs.lock().unwrap();
        let Some(index) = jobs.iter().position(|j| j.key() == key) else {
            return Err(SchedulerError::NotFound(key.to_string()));
        };
        if !jobs[index].state().is_terminal() {
            return Err(SchedulerError::Active(key.to_string()));
        }
        jobs.remove(index);
        Ok(())
    }

    /// Point-in-time view of every tracked job, in submission order.
    /// Safe to call from the render thread while workers run.
    pub fn snapshot(&self) -> Vec<JobStatus> {
        let jobs = self.inner.jobs.lock().unwrap();
        jobs.iter().map(|j| j.status()).collect()
    }

    /// True while any tracked job is not yet terminal.
    pub fn has_active_jobs(&self) -> bool {
        let jobs = self.inner.jobs.lock().unwrap();
        jobs.iter().any(|j| !j.state().is_terminal())
    }
}

impl SchedulerInner {
    /// Promote queued jobs into free slots and renumber the rest. Caller
    /// holds the jobs lock.
    fn rebalance(self: &Arc<Self>, jobs: &mut [Arc<JobShared>]) {
        let mut active = jobs.iter().filter(|j| j.state().is_active()).count();
        let mut position = 0;

        for job in jobs.iter() {
            if job.state() != JobState::Queued {
                continue;
            }
            if active < self.config.max_concurrent_downloads {
                active += 1;
                // Claim the slot before the worker task starts so a
                // second rebalance cannot double-admit it.
                job.set_state(JobState::Downloading);
                self.spawn_worker(Arc::clone(job));
            } else {
                position += 1;
                job.set_queue_position(Some(position));
            }
        }
    }

    fn spawn_worker(self: &Arc<Self>, job: Arc<JobShared>) {
        debug!("Admitting job {}", job.key());
        let inner = Arc::clone(self);
        let worker = Worker::new(
            Arc::clone(&job),
            Arc::clone(&self.config),
            self.client.clone(),
            Arc::clone(&self.runner),
            self.scraper.clone(),
        );

        self.handle.spawn(async move {
            let state = worker.run().await;
            inner.on_job_finished(&job, state);
        });
    }

    fn on_job_finished(self: &Arc<Self>, job: &Arc<JobShared>, state: JobState) {
        let event = match state {
            JobState::Completed => JobEvent::Completed {
                key: job.key().to_string(),
            },
            JobState::Cancelled => JobEvent::Cancelled {
                key: job.key().to_string(),
            },
            _ => JobEvent::Failed {
                key: job.key().to_string(),
                message: job
                    .status()
                    .error_message
                    .unwrap_or_else(|| "unknown error".to_string()),
            },
        };
        self.sink.notify(&event);

        let mut jobs = self.jobs.lock().unwrap();
        self.rebalance(&mut jobs);
    }
}
