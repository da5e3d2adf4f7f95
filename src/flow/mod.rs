pub mod queue;
pub mod types;

pub use queue::{HandlerRegistry, JobContext, JobHandler, JobQueue};
pub use types::{Backoff, ChildOutcome, Job, JobEvent, JobSpec, JobState, RetryPolicy};
