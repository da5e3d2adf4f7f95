//! Tests for the adapter registry: registration, resolution, and fallback.

use std::sync::Arc;

use async_trait::async_trait;

use annopipe::adapters::{
    AdapterRegistry, AdapterSelection, Collection, Document, DocumentPage, DocumentQuery,
    DocumentStore, StoreError,
};

/// Minimal document adapter with a distinguishable name and marker.
struct FakeDocs {
    name: &'static str,
    marker: &'static str,
}

#[async_trait]
impl DocumentStore for FakeDocs {
    fn name(&self) -> &str {
        self.name
    }

    async fn get_document(&self, _query: &DocumentQuery) -> Result<Option<Document>, StoreError> {
        let mut doc = Document::new();
        doc.insert(
            "marker".to_string(),
            serde_json::Value::String(self.marker.to_string()),
        );
        Ok(Some(doc))
    }

    async fn get_documents(&self, _query: &DocumentQuery) -> Result<DocumentPage, StoreError> {
        Ok(DocumentPage {
            data: Vec::new(),
            total: 0,
        })
    }

    async fn create_document(
        &self,
        _collection: Collection,
        payload: Document,
    ) -> Result<Document, StoreError> {
        Ok(payload)
    }

    async fn update_document(
        &self,
        _collection: Collection,
        _matcher: &serde_json::Value,
        _update: Document,
    ) -> Result<Option<Document>, StoreError> {
        Ok(None)
    }

    async fn delete_document(
        &self,
        _collection: Collection,
        _matcher: &serde_json::Value,
    ) -> Result<(), StoreError> {
        Ok(())
    }
}

#[tokio::test]
async fn bootstrap_registers_local_adapters() {
    let dir = tempfile::tempdir().unwrap();
    let registry = AdapterRegistry::bootstrap(dir.path(), AdapterSelection::default());

    assert_eq!(registry.document_adapters(), vec!["LOCAL".to_string()]);
    assert_eq!(registry.object_adapters(), vec!["LOCAL".to_string()]);
    assert_eq!(registry.documents().name(), "LOCAL");
    assert_eq!(registry.objects().name(), "LOCAL");
}

#[tokio::test]
async fn unmatched_selection_falls_back_to_local() {
    let dir = tempfile::tempdir().unwrap();
    let registry = AdapterRegistry::bootstrap(
        dir.path(),
        AdapterSelection {
            documents: Some("MONGO".to_string()),
            objects: Some("GCS".to_string()),
        },
    );

    assert_eq!(registry.documents().name(), "LOCAL");
    assert_eq!(registry.objects().name(), "LOCAL");
}

#[tokio::test]
async fn selection_is_re_read_on_every_resolve() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = AdapterRegistry::bootstrap(dir.path(), AdapterSelection::default());
    registry.register_documents(Arc::new(FakeDocs {
        name: "FAKE",
        marker: "first",
    }));

    assert_eq!(registry.documents().name(), "LOCAL");

    registry.set_selection(AdapterSelection {
        documents: Some("FAKE".to_string()),
        objects: None,
    });
    assert_eq!(registry.documents().name(), "FAKE");

    registry.set_selection(AdapterSelection::default());
    assert_eq!(registry.documents().name(), "LOCAL");
}

#[tokio::test]
async fn duplicate_registration_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = AdapterRegistry::bootstrap(dir.path(), AdapterSelection::default());

    registry.register_documents(Arc::new(FakeDocs {
        name: "FAKE",
        marker: "first",
    }));
    registry.register_documents(Arc::new(FakeDocs {
        name: "FAKE",
        marker: "second",
    }));

    assert_eq!(
        registry.document_adapters(),
        vec!["FAKE".to_string(), "LOCAL".to_string()]
    );

    registry.set_selection(AdapterSelection {
        documents: Some("FAKE".to_string()),
        objects: None,
    });
    let doc = registry
        .documents()
        .get_document(&DocumentQuery::new(Collection::Projects))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc["marker"], serde_json::json!("first"));
}

#[tokio::test]
async fn registering_a_second_local_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = AdapterRegistry::bootstrap(dir.path(), AdapterSelection::default());

    registry.register_documents(Arc::new(FakeDocs {
        name: "LOCAL",
        marker: "impostor",
    }));

    assert_eq!(registry.document_adapters(), vec!["LOCAL".to_string()]);
    // The bootstrap LOCAL adapter, not the fake, still answers.
    let page = registry
        .documents()
        .get_documents(&DocumentQuery::new(Collection::Projects))
        .await
        .unwrap();
    assert_eq!(page.total, 0);
}
