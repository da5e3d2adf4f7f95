//! Run-annotation controller: starts a Run, fans one child job out per
//! session, aggregates their outcomes, and closes the run out.

use std::sync::Arc;

use anyhow::{Context as _, Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::adapters::{Collection, Document, DocumentQuery, id_match};
use crate::flow::{JobContext, JobHandler, JobQueue, JobSpec, RetryPolicy};
use crate::notify::{STATUS_ERRORED, STATUS_FINISHED, envelope};

use super::PipelineDeps;

pub const JOB_ANNOTATE_RUN: &str = "annotate-run";
pub const JOB_ANNOTATE_SESSION: &str = "annotate-session";
pub const QUEUE_RUN_ANNOTATION: &str = "runAnnotation";

pub const EVENT_ANNOTATE_RUN_SESSIONS: &str = "ANNOTATE_RUN_SESSIONS";
pub const TASK_FINISH_RUN_ANNOTATION: &str = "FINISH_RUN_ANNOTATION";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Complete,
    Errored,
}

/// Return value of one annotate-session child job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResult {
    pub status: SessionStatus,
    pub session_id: String,
}

fn fields(value: serde_json::Value) -> Document {
    value.as_object().cloned().unwrap_or_default()
}

fn now_value() -> serde_json::Value {
    serde_json::Value::String(Utc::now().to_rfc3339())
}

fn flag(doc: &Document, field: &str) -> bool {
    doc.get(field).and_then(|v| v.as_bool()).unwrap_or(false)
}

/// A run that completed or errored admits no further transitions.
fn is_terminal_run(run: &Document) -> bool {
    flag(run, "isComplete") || flag(run, "hasErrored")
}

/// Transition a Run out of idle and fan one child job out per session.
/// Returns the parent job id.
pub async fn start_run_annotation(
    deps: &PipelineDeps,
    queue: &JobQueue,
    run_id: &str,
) -> Result<String> {
    let docs = deps.adapters.documents();

    let run = docs
        .get_document(&DocumentQuery::by_id(Collection::Runs, run_id))
        .await?
        .ok_or_else(|| anyhow!("Run '{}' not found", run_id))?;

    if is_terminal_run(&run) {
        return Err(anyhow!("Run '{}' already finished and cannot restart", run_id));
    }

    let session_ids = run_session_ids(&run);

    docs.update_document(
        Collection::Runs,
        &id_match(run_id),
        fields(serde_json::json!({
            "isRunning": true,
            "startedAt": now_value(),
        })),
    )
    .await?;

    let mut spec = JobSpec::new(
        JOB_ANNOTATE_RUN,
        QUEUE_RUN_ANNOTATION,
        serde_json::json!({
            "runId": run_id,
            "props": {
                "event": EVENT_ANNOTATE_RUN_SESSIONS,
                "task": TASK_FINISH_RUN_ANNOTATION,
            },
        }),
    );
    for session_id in &session_ids {
        spec = spec.child(
            JobSpec::new(
                JOB_ANNOTATE_SESSION,
                QUEUE_RUN_ANNOTATION,
                serde_json::json!({ "runId": run_id, "sessionId": session_id }),
            )
            .with_opts(RetryPolicy::exponential(2, 500)),
        );
    }

    info!(run_id = %run_id, sessions = session_ids.len(), "Starting run annotation");
    queue
        .add_flow(spec)
        .context("Failed to enqueue run annotation flow")
}

/// Mark the Run complete and publish the terminal FINISHED notification.
pub async fn finish_run_annotation(deps: &PipelineDeps, run_id: &str) -> Result<()> {
    let docs = deps.adapters.documents();

    let run = docs
        .get_document(&DocumentQuery::by_id(Collection::Runs, run_id))
        .await?
        .ok_or_else(|| anyhow!("Run '{}' not found", run_id))?;
    if is_terminal_run(&run) {
        return Err(anyhow!("Run '{}' already finished and cannot be overwritten", run_id));
    }

    docs.update_document(
        Collection::Runs,
        &id_match(run_id),
        fields(serde_json::json!({
            "isRunning": false,
            "isComplete": true,
            "hasErrored": false,
            "finishedAt": now_value(),
        })),
    )
    .await?;

    deps.bridge.publish(
        EVENT_ANNOTATE_RUN_SESSIONS,
        envelope("runId", run_id, TASK_FINISH_RUN_ANNOTATION, STATUS_FINISHED),
    );

    info!(run_id = %run_id, "Run annotation finished");
    Ok(())
}

/// Session ids in the order the run registered them.
fn run_session_ids(run: &Document) -> Vec<String> {
    run.get("sessions")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    serde_json::Value::String(s) => Some(s.clone()),
                    serde_json::Value::Object(o) => o
                        .get("sessionId")
                        .and_then(|v| v.as_str())
                        .map(ToString::to_string),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Child job: annotate one session through the external capability and record
/// its terminal status on the session record.
pub struct AnnotateSessionHandler {
    pub deps: Arc<PipelineDeps>,
}

#[async_trait]
impl JobHandler for AnnotateSessionHandler {
    fn job_name(&self) -> &str {
        JOB_ANNOTATE_SESSION
    }

    fn description(&self) -> &str {
        "Annotate one run session through the configured provider"
    }

    async fn run(&self, ctx: JobContext) -> Result<serde_json::Value> {
        let run_id = ctx.str_field("runId")?;
        let session_id = ctx.str_field("sessionId")?;
        let docs = self.deps.adapters.documents();

        docs.update_document(
            Collection::Sessions,
            &id_match(session_id),
            fields(serde_json::json!({
                "status": "RUNNING",
                "startedAt": now_value(),
            })),
        )
        .await?;

        match self.deps.annotator.annotate(run_id, session_id).await {
            Ok(_) => {
                docs.update_document(
                    Collection::Sessions,
                    &id_match(session_id),
                    fields(serde_json::json!({
                        "status": "COMPLETE",
                        "finishedAt": now_value(),
                    })),
                )
                .await?;

                let result = SessionResult {
                    status: SessionStatus::Complete,
                    session_id: session_id.to_string(),
                };
                Ok(serde_json::to_value(result)?)
            }
            Err(e) => {
                docs.update_document(
                    Collection::Sessions,
                    &id_match(session_id),
                    fields(serde_json::json!({
                        "status": "ERRORED",
                        "finishedAt": now_value(),
                    })),
                )
                .await?;

                Err(e.context(format!("Annotation failed for session '{}'", session_id)))
            }
        }
    }
}

/// Parent job: released once every session child is terminal. Folds the typed
/// child outcomes; failures are recorded on the Run record, never re-thrown.
pub struct AnnotateRunHandler {
    pub deps: Arc<PipelineDeps>,
}

#[async_trait]
impl JobHandler for AnnotateRunHandler {
    fn job_name(&self) -> &str {
        JOB_ANNOTATE_RUN
    }

    fn description(&self) -> &str {
        "Aggregate session outcomes and close out the run"
    }

    async fn run(&self, ctx: JobContext) -> Result<serde_json::Value> {
        let run_id = ctx.str_field("runId")?;

        let failed = ctx
            .children_values()
            .iter()
            .filter(|outcome| outcome.is_errored())
            .count();

        if failed > 0 {
            warn!(
                run_id = %run_id,
                failed = failed,
                total = ctx.children_values().len(),
                "Run annotation finished with failed sessions"
            );

            let docs = self.deps.adapters.documents();
            docs.update_document(
                Collection::Runs,
                &id_match(run_id),
                fields(serde_json::json!({
                    "isRunning": false,
                    "hasErrored": true,
                    "finishedAt": now_value(),
                })),
            )
            .await?;

            self.deps.bridge.publish(
                EVENT_ANNOTATE_RUN_SESSIONS,
                envelope("runId", run_id, TASK_FINISH_RUN_ANNOTATION, STATUS_ERRORED),
            );

            return Ok(serde_json::json!({
                "status": STATUS_ERRORED,
                "failedSessions": failed,
            }));
        }

        finish_run_annotation(&self.deps, run_id).await?;
        Ok(serde_json::json!({ "status": STATUS_FINISHED }))
    }
}
