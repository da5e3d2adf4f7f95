//! Cascade-delete controller: fans a single "delete this resource" request
//! into ordered cleanup of dependent collections and stored artifacts.
//!
//! The parent resource is tombstoned synchronously before any job is
//! enqueued, so it disappears from listings immediately even though cleanup
//! is asynchronous. If the enqueue itself fails the tombstone is kept and the
//! orphaned data waits for a re-trigger.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::adapters::{Collection, Document, DocumentQuery, id_match};
use crate::flow::{JobContext, JobHandler, JobQueue, JobSpec, RetryPolicy};
use crate::notify::{STATUS_ERRORED, STATUS_FINISHED, envelope};

use super::PipelineDeps;

pub const JOB_CLEANUP_COLLECTION: &str = "cleanup-collection";
pub const JOB_FINISH_DELETE: &str = "finish-delete";
pub const QUEUE_CASCADE_DELETE: &str = "cascadeDelete";

pub const EVENT_DELETE_PROJECT: &str = "DELETE_PROJECT";
pub const EVENT_DELETE_COLLECTION: &str = "DELETE_COLLECTION";
pub const TASK_FINISH_DELETE: &str = "FINISH_DELETE";

/// Document fields whose string values name exported artifacts in object
/// storage, removed alongside the document.
const ARTIFACT_FIELDS: [&str; 2] = ["storagePath", "exportPath"];

fn fields(value: serde_json::Value) -> Document {
    value.as_object().cloned().unwrap_or_default()
}

fn now_value() -> serde_json::Value {
    serde_json::Value::String(Utc::now().to_rfc3339())
}

/// Soft-delete a project and enqueue cleanup of its files, sessions and runs.
/// Returns the finish job id, or `None` when the enqueue failed (the project
/// stays tombstoned either way).
pub async fn delete_project(
    deps: &PipelineDeps,
    queue: &JobQueue,
    project_id: &str,
) -> Result<Option<String>> {
    cascade_delete(
        deps,
        queue,
        CascadeTarget {
            parent: Collection::Projects,
            id: project_id,
            id_field: "projectId",
            event: EVENT_DELETE_PROJECT,
            dependents: &[
                (Collection::Files, "projectId"),
                (Collection::Sessions, "projectId"),
                (Collection::Runs, "projectId"),
            ],
        },
    )
    .await
}

/// Soft-delete a collection and enqueue cleanup of its prompts and versions.
pub async fn delete_collection(
    deps: &PipelineDeps,
    queue: &JobQueue,
    collection_id: &str,
) -> Result<Option<String>> {
    cascade_delete(
        deps,
        queue,
        CascadeTarget {
            parent: Collection::Collections,
            id: collection_id,
            id_field: "collectionId",
            event: EVENT_DELETE_COLLECTION,
            dependents: &[
                (Collection::Prompts, "collectionId"),
                (Collection::PromptVersions, "collectionId"),
            ],
        },
    )
    .await
}

struct CascadeTarget<'a> {
    parent: Collection,
    id: &'a str,
    id_field: &'a str,
    event: &'a str,
    dependents: &'a [(Collection, &'a str)],
}

async fn cascade_delete(
    deps: &PipelineDeps,
    queue: &JobQueue,
    target: CascadeTarget<'_>,
) -> Result<Option<String>> {
    let docs = deps.adapters.documents();

    // Tombstone before enqueuing so the resource vanishes from listings now.
    let updated = docs
        .update_document(
            target.parent,
            &id_match(target.id),
            fields(serde_json::json!({
                "deleted": true,
                "deletedAt": now_value(),
            })),
        )
        .await?;
    if updated.is_none() {
        return Err(anyhow!("{} '{}' not found", target.parent, target.id));
    }

    let mut spec = JobSpec::new(
        JOB_FINISH_DELETE,
        QUEUE_CASCADE_DELETE,
        serde_json::json!({
            "resource": target.parent.as_str(),
            "resourceId": target.id,
            "idField": target.id_field,
            "props": { "event": target.event, "task": TASK_FINISH_DELETE },
        }),
    );
    for (dependent, field) in target.dependents {
        spec = spec.child(
            JobSpec::new(
                JOB_CLEANUP_COLLECTION,
                QUEUE_CASCADE_DELETE,
                serde_json::json!({
                    "collection": dependent.as_str(),
                    "field": field,
                    "value": target.id,
                }),
            )
            .with_opts(RetryPolicy::exponential(3, 1000)),
        );
    }

    match queue.add_flow(spec) {
        Ok(flow_id) => {
            info!(
                resource = %target.parent,
                id = %target.id,
                flow_id = %flow_id,
                "Cascade delete enqueued"
            );
            Ok(Some(flow_id))
        }
        Err(e) => {
            // The soft delete stays in place; orphaned data waits for a
            // manual or scheduled re-trigger.
            error!(
                resource = %target.parent,
                id = %target.id,
                error = %format!("{:#}", e),
                "Failed to enqueue cascade delete, resource remains soft-deleted"
            );
            Ok(None)
        }
    }
}

/// Child job: delete every record of one dependent collection that references
/// the deleted parent, removing exported artifacts along the way. Running
/// against already-deleted sub-resources is a no-op.
pub struct CleanupCollectionHandler {
    pub deps: Arc<PipelineDeps>,
}

#[async_trait]
impl JobHandler for CleanupCollectionHandler {
    fn job_name(&self) -> &str {
        JOB_CLEANUP_COLLECTION
    }

    fn description(&self) -> &str {
        "Delete one dependent collection's records for a removed resource"
    }

    async fn run(&self, ctx: JobContext) -> Result<serde_json::Value> {
        let collection = Collection::parse(ctx.str_field("collection")?)?;
        let field = ctx.str_field("field")?;
        let value = ctx.str_field("value")?;

        let docs = self.deps.adapters.documents();
        let objects = self.deps.adapters.objects();
        let matcher = serde_json::json!({ field: value });

        let page = docs
            .get_documents(&DocumentQuery::new(collection).matching(matcher.clone()))
            .await?;
        let mut deleted = 0usize;

        for doc in &page.data {
            for artifact_field in ARTIFACT_FIELDS {
                if let Some(path) = doc.get(artifact_field).and_then(|v| v.as_str()) {
                    objects.remove(path).await?;
                }
            }

            let id = doc
                .get("id")
                .cloned()
                .ok_or_else(|| anyhow!("Record in '{}' has no id", collection))?;
            docs.delete_document(collection, &serde_json::json!({ "id": id }))
                .await?;
            deleted += 1;
        }

        info!(
            collection = %collection,
            field = field,
            value = value,
            deleted = deleted,
            "Cleanup job finished"
        );

        Ok(serde_json::json!({
            "collection": collection.as_str(),
            "deleted": deleted,
        }))
    }
}

/// Parent job: final bookkeeping once every cleanup child resolved. When all
/// children are clean the tombstoned record is hard-deleted; any failure keeps
/// the tombstone for a later re-trigger. Child failures are reported through
/// domain state and notification, never re-thrown.
pub struct FinishDeleteHandler {
    pub deps: Arc<PipelineDeps>,
}

#[async_trait]
impl JobHandler for FinishDeleteHandler {
    fn job_name(&self) -> &str {
        JOB_FINISH_DELETE
    }

    fn description(&self) -> &str {
        "Finalize a cascade delete after its cleanup jobs resolve"
    }

    async fn run(&self, ctx: JobContext) -> Result<serde_json::Value> {
        let resource = Collection::parse(ctx.str_field("resource")?)?;
        let resource_id = ctx.str_field("resourceId")?;
        let id_field = ctx.str_field("idField")?;
        let event = ctx
            .data()
            .pointer("/props/event")
            .and_then(|v| v.as_str())
            .unwrap_or(EVENT_DELETE_PROJECT)
            .to_string();

        let failed = ctx
            .children_values()
            .iter()
            .filter(|outcome| outcome.is_errored())
            .count();

        if failed > 0 {
            warn!(
                resource = %resource,
                id = %resource_id,
                failed = failed,
                "Cascade delete finished with failed cleanup jobs, keeping tombstone"
            );
            self.deps.bridge.publish(
                &event,
                envelope(id_field, resource_id, TASK_FINISH_DELETE, STATUS_ERRORED),
            );
            return Ok(serde_json::json!({
                "status": STATUS_ERRORED,
                "failedCleanups": failed,
            }));
        }

        let docs = self.deps.adapters.documents();
        docs.delete_document(resource, &id_match(resource_id)).await?;

        self.deps.bridge.publish(
            &event,
            envelope(id_field, resource_id, TASK_FINISH_DELETE, STATUS_FINISHED),
        );

        info!(resource = %resource, id = %resource_id, "Cascade delete finished");
        Ok(serde_json::json!({ "status": STATUS_FINISHED }))
    }
}
