//! Tests for the DocumentStore backends: LocalDocumentStore and DbDocumentStore.

use annopipe::adapters::db_docs::DbDocumentStore;
use annopipe::adapters::local_docs::LocalDocumentStore;
use annopipe::adapters::{Collection, Document, DocumentQuery, DocumentStore, StoreError, id_match};

fn doc(value: serde_json::Value) -> Document {
    value.as_object().cloned().unwrap()
}

// ===== LocalDocumentStore =====

#[tokio::test]
async fn local_first_read_returns_collection_default() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalDocumentStore::new(dir.path());

    for collection in Collection::ALL {
        let page = store
            .get_documents(&DocumentQuery::new(collection))
            .await
            .unwrap();
        if collection.is_singleton() {
            assert_eq!(page.total, 1, "config is a singleton");
            assert_eq!(page.data[0]["id"], serde_json::json!(0));
        } else {
            assert_eq!(page.total, 0, "{} defaults to empty", collection);
        }
    }
}

#[tokio::test]
async fn local_create_and_get() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalDocumentStore::new(dir.path());

    let created = store
        .create_document(
            Collection::Projects,
            doc(serde_json::json!({ "name": "alpha" })),
        )
        .await
        .unwrap();
    let id = created["id"].as_str().unwrap().to_string();

    let fetched = store
        .get_document(&DocumentQuery::by_id(Collection::Projects, &id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched["name"], serde_json::json!("alpha"));
}

#[tokio::test]
async fn local_update_merges_fields() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalDocumentStore::new(dir.path());

    store
        .create_document(
            Collection::Runs,
            doc(serde_json::json!({ "id": "r1", "name": "run one", "isRunning": false })),
        )
        .await
        .unwrap();

    let updated = store
        .update_document(
            Collection::Runs,
            &id_match("r1"),
            doc(serde_json::json!({ "isRunning": true })),
        )
        .await
        .unwrap()
        .unwrap();

    // Merged field changed, unspecified fields untouched.
    assert_eq!(updated["isRunning"], serde_json::json!(true));
    assert_eq!(updated["name"], serde_json::json!("run one"));

    let fetched = store
        .get_document(&DocumentQuery::by_id(Collection::Runs, "r1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched["isRunning"], serde_json::json!(true));
    assert_eq!(fetched["name"], serde_json::json!("run one"));
}

#[tokio::test]
async fn local_update_without_match_returns_none() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalDocumentStore::new(dir.path());

    let updated = store
        .update_document(
            Collection::Runs,
            &id_match("missing"),
            doc(serde_json::json!({ "isRunning": true })),
        )
        .await
        .unwrap();
    assert!(updated.is_none());
}

#[tokio::test]
async fn local_delete_removes_at_most_one() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalDocumentStore::new(dir.path());

    for name in ["a", "b"] {
        store
            .create_document(
                Collection::Files,
                doc(serde_json::json!({ "name": name, "projectId": "p1" })),
            )
            .await
            .unwrap();
    }

    store
        .delete_document(Collection::Files, &serde_json::json!({ "projectId": "p1" }))
        .await
        .unwrap();

    let page = store
        .get_documents(&DocumentQuery::new(Collection::Files))
        .await
        .unwrap();
    assert_eq!(page.total, 1);

    // Deleting with no match is not an error.
    store
        .delete_document(Collection::Files, &id_match("missing"))
        .await
        .unwrap();
}

#[tokio::test]
async fn local_match_operators() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalDocumentStore::new(dir.path());

    for (id, status) in [("s1", "COMPLETE"), ("s2", "ERRORED"), ("s3", "COMPLETE")] {
        store
            .create_document(
                Collection::Sessions,
                doc(serde_json::json!({ "id": id, "status": status })),
            )
            .await
            .unwrap();
    }

    let ne = store
        .get_documents(
            &DocumentQuery::new(Collection::Sessions)
                .matching(serde_json::json!({ "status": { "$ne": "ERRORED" } })),
        )
        .await
        .unwrap();
    assert_eq!(ne.total, 2);

    let within = store
        .get_documents(
            &DocumentQuery::new(Collection::Sessions)
                .matching(serde_json::json!({ "id": { "$in": ["s1", "s2"] } })),
        )
        .await
        .unwrap();
    assert_eq!(within.total, 2);

    let exists = store
        .get_documents(
            &DocumentQuery::new(Collection::Sessions)
                .matching(serde_json::json!({ "finishedAt": { "$exists": false } })),
        )
        .await
        .unwrap();
    assert_eq!(exists.total, 3);
}

#[tokio::test]
async fn local_sort_and_pagination() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalDocumentStore::new(dir.path());

    for n in [3, 1, 2, 5, 4] {
        store
            .create_document(Collection::Prompts, doc(serde_json::json!({ "order": n })))
            .await
            .unwrap();
    }

    let page = store
        .get_documents(
            &DocumentQuery::new(Collection::Prompts)
                .sorted_by("order", false)
                .paginated(1, 2),
        )
        .await
        .unwrap();

    // Total counts matches before pagination.
    assert_eq!(page.total, 5);
    let orders: Vec<i64> = page
        .data
        .iter()
        .map(|d| d["order"].as_i64().unwrap())
        .collect();
    assert_eq!(orders, vec![2, 3]);
}

#[tokio::test]
async fn unknown_collection_name_is_rejected() {
    let err = Collection::parse("widgets").unwrap_err();
    assert!(matches!(err, StoreError::CollectionNotFound(_)));
    assert!(err.to_string().contains("widgets"));
}

#[tokio::test]
async fn local_config_singleton_merges_on_create() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalDocumentStore::new(dir.path());

    store
        .create_document(
            Collection::Config,
            doc(serde_json::json!({ "theme": "dark" })),
        )
        .await
        .unwrap();

    let config = store
        .get_document(&DocumentQuery::new(Collection::Config))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(config["id"], serde_json::json!(0));
    assert_eq!(config["theme"], serde_json::json!("dark"));
}

// ===== DbDocumentStore =====

async fn db_store(dir: &tempfile::TempDir) -> DbDocumentStore {
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("docs.db").display());
    DbDocumentStore::connect(&url).await.unwrap()
}

#[tokio::test]
async fn db_first_read_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let store = db_store(&dir).await;

    let projects = store
        .get_documents(&DocumentQuery::new(Collection::Projects))
        .await
        .unwrap();
    assert_eq!(projects.total, 0);

    let config = store
        .get_document(&DocumentQuery::new(Collection::Config))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(config["id"], serde_json::json!(0));
}

#[tokio::test]
async fn db_crud_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = db_store(&dir).await;

    let created = store
        .create_document(
            Collection::Runs,
            doc(serde_json::json!({ "id": "r1", "name": "run" })),
        )
        .await
        .unwrap();
    assert_eq!(created["id"], serde_json::json!("r1"));

    let updated = store
        .update_document(
            Collection::Runs,
            &id_match("r1"),
            doc(serde_json::json!({ "isComplete": true })),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated["name"], serde_json::json!("run"));
    assert_eq!(updated["isComplete"], serde_json::json!(true));

    store
        .delete_document(Collection::Runs, &id_match("r1"))
        .await
        .unwrap();
    let gone = store
        .get_document(&DocumentQuery::by_id(Collection::Runs, "r1"))
        .await
        .unwrap();
    assert!(gone.is_none());
}

#[tokio::test]
async fn db_match_and_sort() {
    let dir = tempfile::tempdir().unwrap();
    let store = db_store(&dir).await;

    for (id, n) in [("a", 2), ("b", 1), ("c", 3)] {
        store
            .create_document(
                Collection::Sessions,
                doc(serde_json::json!({ "id": id, "runId": "r1", "order": n })),
            )
            .await
            .unwrap();
    }
    store
        .create_document(
            Collection::Sessions,
            doc(serde_json::json!({ "id": "d", "runId": "r2", "order": 0 })),
        )
        .await
        .unwrap();

    let page = store
        .get_documents(
            &DocumentQuery::new(Collection::Sessions)
                .matching(serde_json::json!({ "runId": "r1" }))
                .sorted_by("order", true),
        )
        .await
        .unwrap();

    assert_eq!(page.total, 3);
    let ids: Vec<&str> = page.data.iter().map(|d| d["id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["c", "a", "b"]);
}
