use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a job. Monotonic except for the retry transition
/// (`failed → waiting` while attempts remain).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
    WaitingChildren,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Waiting => write!(f, "waiting"),
            JobState::Active => write!(f, "active"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
            JobState::Delayed => write!(f, "delayed"),
            JobState::WaitingChildren => write!(f, "waiting-children"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Base delay doubles on each failed attempt.
    Exponential { delay_ms: u64 },
}

/// Retry policy for one job. `attempts` is the maximum execution count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Option<Backoff>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 1,
            backoff: None,
        }
    }
}

impl RetryPolicy {
    pub fn exponential(attempts: u32, delay_ms: u64) -> Self {
        Self {
            attempts,
            backoff: Some(Backoff::Exponential { delay_ms }),
        }
    }

    /// Delay before attempt `next_attempt` (1-based), or zero without backoff.
    pub fn delay_before(&self, next_attempt: u32) -> std::time::Duration {
        match self.backoff {
            Some(Backoff::Exponential { delay_ms }) => std::time::Duration::from_millis(
                delay_ms.saturating_mul(1u64 << next_attempt.saturating_sub(2).min(32)),
            ),
            None => std::time::Duration::ZERO,
        }
    }
}

/// Producer-side description of a job, optionally with dependent children.
/// A spec with children schedules as a flow: the parent enters
/// `waiting-children` and runs only after every child is terminal.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub queue: String,
    pub data: serde_json::Value,
    pub opts: RetryPolicy,
    pub children: Vec<JobSpec>,
}

impl JobSpec {
    pub fn new(name: &str, queue: &str, data: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            queue: queue.to_string(),
            data,
            opts: RetryPolicy::default(),
            children: Vec::new(),
        }
    }

    pub fn with_opts(mut self, opts: RetryPolicy) -> Self {
        self.opts = opts;
        self
    }

    pub fn child(mut self, spec: JobSpec) -> Self {
        self.children.push(spec);
        self
    }
}

/// A scheduled job record. Children are stored in registration order, which is
/// also the order their outcomes are observed in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub queue: String,
    pub data: serde_json::Value,
    pub opts: RetryPolicy,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub children: Vec<String>,
    pub attempts_made: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
}

/// Terminal result of one child job, observed by its parent's handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum ChildOutcome {
    Ok { value: serde_json::Value },
    Errored { reason: String },
}

impl ChildOutcome {
    pub fn is_errored(&self) -> bool {
        matches!(self, ChildOutcome::Errored { .. })
    }
}

/// State-transition event emitted on the queue's broadcast channel.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job_id: String,
    pub state: JobState,
}
