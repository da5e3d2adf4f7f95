use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Semaphore, broadcast, mpsc};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::types::*;

/// Everything a handler sees for one invocation: the job record plus, for a
/// released parent, each child's terminal outcome in registration order.
pub struct JobContext {
    pub job: Job,
    children: Vec<ChildOutcome>,
}

impl JobContext {
    pub fn new(job: Job, children: Vec<ChildOutcome>) -> Self {
        Self { job, children }
    }

    pub fn data(&self) -> &serde_json::Value {
        &self.job.data
    }

    /// Required string field from the job payload.
    pub fn str_field(&self, key: &str) -> Result<&str> {
        self.job
            .data
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("Job '{}' is missing data field '{}'", self.job.name, key))
    }

    /// Terminal outcomes of this job's children. Empty for leaf jobs. The
    /// orchestrator only invokes a parent once every child is terminal, so
    /// there are never partial views here.
    pub fn children_values(&self) -> &[ChildOutcome] {
        &self.children
    }
}

/// Unit-of-work handler consumed by the orchestrator. A returned error marks
/// the attempt failed and triggers retry/backoff per the job's opts.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Job name this handler executes (e.g. "annotate-session").
    fn job_name(&self) -> &str;

    fn description(&self) -> &str;

    async fn run(&self, ctx: JobContext) -> Result<serde_json::Value>;
}

/// Registry of job handlers, keyed by job name.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers
            .insert(handler.job_name().to_string(), handler);
    }

    pub fn get(&self, job_name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_name).cloned()
    }

    pub fn list(&self) -> Vec<(&str, &str)> {
        let mut entries: Vec<(&str, &str)> = self
            .handlers
            .values()
            .map(|h| (h.job_name(), h.description()))
            .collect();
        entries.sort_by_key(|(name, _)| *name);
        entries
    }
}

/// In-process job queue with flow support: retryable unit-of-work scheduling,
/// parent jobs held in `waiting-children` until every child is terminal, and
/// at-least-once handler execution on a bounded worker pool.
pub struct JobQueue {
    jobs: Mutex<HashMap<String, Job>>,
    ready_tx: mpsc::UnboundedSender<String>,
    ready_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    events: broadcast::Sender<JobEvent>,
}

impl JobQueue {
    pub fn new() -> Arc<Self> {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            jobs: Mutex::new(HashMap::new()),
            ready_tx,
            ready_rx: Mutex::new(Some(ready_rx)),
            events,
        })
    }

    /// Schedule a single job.
    pub fn add_job(&self, spec: JobSpec) -> Result<String> {
        self.add_flow(spec)
    }

    /// Schedule a job tree. A spec with children inserts the parent in
    /// `waiting-children` immediately; only leaves are made ready. Returns the
    /// root job id.
    pub fn add_flow(&self, spec: JobSpec) -> Result<String> {
        let mut records = Vec::new();
        let mut leaves = Vec::new();
        let root_id = build_jobs(spec, None, &mut records, &mut leaves);

        {
            let mut jobs = self.jobs.lock().unwrap();
            for job in records {
                jobs.insert(job.id.clone(), job);
            }
        }

        for leaf in leaves {
            self.ready_tx
                .send(leaf)
                .map_err(|_| anyhow!("Job queue is not accepting work"))?;
        }

        Ok(root_id)
    }

    pub fn get_job(&self, job_id: &str) -> Option<Job> {
        self.jobs.lock().unwrap().get(job_id).cloned()
    }

    /// Await a job's terminal state. Used by callers that must observe the
    /// result (CLI, tests); request handlers enqueue and return instead.
    pub async fn wait_until_terminal(&self, job_id: &str) -> Result<Job> {
        let mut rx = self.events.subscribe();
        loop {
            match self.get_job(job_id) {
                Some(job) if job.state.is_terminal() => return Ok(job),
                Some(_) => {}
                None => anyhow::bail!("Unknown job: {}", job_id),
            }
            match rx.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    anyhow::bail!("Job queue shut down")
                }
            }
        }
    }

    /// Start the worker pool. Concurrency defaults to the CPU count, with an
    /// `ANNOPIPE_MAX_CONCURRENT_JOBS` env override.
    pub fn start_workers(
        self: &Arc<Self>,
        handlers: Arc<HandlerRegistry>,
        concurrency: Option<usize>,
    ) {
        let max_concurrent = concurrency
            .or_else(|| {
                std::env::var("ANNOPIPE_MAX_CONCURRENT_JOBS")
                    .ok()
                    .and_then(|v| v.parse().ok())
            })
            .unwrap_or_else(num_cpus::get);

        let mut ready_rx = self
            .ready_rx
            .lock()
            .unwrap()
            .take()
            .expect("Workers already started");

        let queue = self.clone();
        tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(max_concurrent));
            while let Some(job_id) = ready_rx.recv().await {
                let permit = semaphore.clone().acquire_owned().await.unwrap();
                let queue = queue.clone();
                let handlers = handlers.clone();
                tokio::spawn(async move {
                    execute_job(queue, handlers, job_id).await;
                    drop(permit);
                });
            }
        });
    }

    fn emit(&self, job_id: &str, state: JobState) {
        let _ = self.events.send(JobEvent {
            job_id: job_id.to_string(),
            state,
        });
    }

    /// Mark the job active and snapshot it together with its children's
    /// terminal outcomes.
    fn begin_attempt(&self, job_id: &str) -> Option<(Job, Vec<ChildOutcome>)> {
        let mut jobs = self.jobs.lock().unwrap();
        let outcomes = {
            let job = jobs.get(job_id)?;
            job.children
                .iter()
                .map(|child_id| match jobs.get(child_id) {
                    Some(child) if child.state == JobState::Completed => ChildOutcome::Ok {
                        value: child
                            .return_value
                            .clone()
                            .unwrap_or(serde_json::Value::Null),
                    },
                    Some(child) if child.state == JobState::Failed => ChildOutcome::Errored {
                        reason: child
                            .failure_reason
                            .clone()
                            .unwrap_or_else(|| "unknown failure".to_string()),
                    },
                    _ => ChildOutcome::Errored {
                        reason: format!("Child job '{}' is not terminal", child_id),
                    },
                })
                .collect()
        };

        let job = jobs.get_mut(job_id)?;
        job.state = JobState::Active;
        job.attempts_made += 1;
        Some((job.clone(), outcomes))
    }

    fn complete(&self, job_id: &str, value: serde_json::Value) {
        let parent = {
            let mut jobs = self.jobs.lock().unwrap();
            let Some(job) = jobs.get_mut(job_id) else {
                return;
            };
            job.state = JobState::Completed;
            job.return_value = Some(value);
            job.finished = Some(Utc::now());
            job.parent.clone()
        };
        self.emit(job_id, JobState::Completed);
        if let Some(parent_id) = parent {
            self.release_parent_if_ready(&parent_id);
        }
    }

    fn fail(&self, job_id: &str, reason: String) {
        let parent = {
            let mut jobs = self.jobs.lock().unwrap();
            let Some(job) = jobs.get_mut(job_id) else {
                return;
            };
            job.state = JobState::Failed;
            job.failure_reason = Some(reason);
            job.finished = Some(Utc::now());
            job.parent.clone()
        };
        self.emit(job_id, JobState::Failed);
        if let Some(parent_id) = parent {
            self.release_parent_if_ready(&parent_id);
        }
    }

    fn set_state(&self, job_id: &str, state: JobState) {
        {
            let mut jobs = self.jobs.lock().unwrap();
            let Some(job) = jobs.get_mut(job_id) else {
                return;
            };
            job.state = state.clone();
        }
        self.emit(job_id, state);
    }

    fn requeue(&self, job_id: &str) {
        self.set_state(job_id, JobState::Waiting);
        let _ = self.ready_tx.send(job_id.to_string());
    }

    /// Release a parent to `waiting` once its last child reaches a terminal
    /// state. Called after every child transition; only the final one fires.
    fn release_parent_if_ready(&self, parent_id: &str) {
        let release = {
            let mut jobs = self.jobs.lock().unwrap();
            let all_terminal = match jobs.get(parent_id) {
                Some(parent) if parent.state == JobState::WaitingChildren => parent
                    .children
                    .iter()
                    .all(|child_id| {
                        jobs.get(child_id)
                            .map(|c| c.state.is_terminal())
                            .unwrap_or(false)
                    }),
                _ => false,
            };
            if all_terminal {
                if let Some(parent) = jobs.get_mut(parent_id) {
                    parent.state = JobState::Waiting;
                }
            }
            all_terminal
        };

        if release {
            self.emit(parent_id, JobState::Waiting);
            let _ = self.ready_tx.send(parent_id.to_string());
        }
    }
}

fn build_jobs(
    spec: JobSpec,
    parent: Option<String>,
    records: &mut Vec<Job>,
    leaves: &mut Vec<String>,
) -> String {
    let JobSpec {
        name,
        queue,
        data,
        opts,
        children,
    } = spec;

    let id = Uuid::new_v4().to_string();
    let state = if children.is_empty() {
        leaves.push(id.clone());
        JobState::Waiting
    } else {
        JobState::WaitingChildren
    };

    let child_ids: Vec<String> = children
        .into_iter()
        .map(|child| build_jobs(child, Some(id.clone()), records, leaves))
        .collect();

    records.push(Job {
        id: id.clone(),
        name,
        queue,
        data,
        opts,
        state,
        parent,
        children: child_ids,
        attempts_made: 0,
        return_value: None,
        failure_reason: None,
        created: Utc::now(),
        finished: None,
    });

    id
}

/// Run one attempt of a job: invoke its handler, then complete, retry with
/// backoff, or fail permanently per the job's retry policy.
async fn execute_job(queue: Arc<JobQueue>, handlers: Arc<HandlerRegistry>, job_id: String) {
    let Some((job, children)) = queue.begin_attempt(&job_id) else {
        return;
    };
    queue.emit(&job_id, JobState::Active);
    info!(
        job_id = %job_id,
        job = %job.name,
        attempt = job.attempts_made,
        max = job.opts.attempts,
        "Running job"
    );

    let result = match handlers.get(&job.name) {
        Some(handler) => handler.run(JobContext::new(job.clone(), children)).await,
        None => Err(anyhow!("No handler registered for job '{}'", job.name)),
    };

    match result {
        Ok(value) => {
            info!(job_id = %job_id, job = %job.name, "Job completed");
            queue.complete(&job_id, value);
        }
        Err(e) => {
            let reason = format!("{:#}", e);
            warn!(
                job_id = %job_id,
                job = %job.name,
                attempt = job.attempts_made,
                error = %reason,
                "Job attempt failed"
            );

            if job.attempts_made < job.opts.attempts {
                let delay = job.opts.delay_before(job.attempts_made + 1);
                queue.set_state(&job_id, JobState::Delayed);
                let queue = queue.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    queue.requeue(&job_id);
                });
            } else {
                error!(
                    job_id = %job_id,
                    job = %job.name,
                    attempts = job.attempts_made,
                    "Job failed permanently"
                );
                queue.fail(&job_id, reason);
            }
        }
    }
}
