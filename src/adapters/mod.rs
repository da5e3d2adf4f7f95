pub mod db_docs;
pub mod local_docs;
pub mod local_objects;
pub mod matching;
pub mod s3_objects;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// A stored record — a mapping of fields carrying an opaque `id`.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Name of the mandatory baseline adapter, registered for every kind at bootstrap.
pub const LOCAL_ADAPTER: &str = "LOCAL";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown collection: {0}")]
    CollectionNotFound(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// The closed set of logical collections the orchestration layer touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Collection {
    Projects,
    Runs,
    Sessions,
    Files,
    Collections,
    Teams,
    Prompts,
    PromptVersions,
    Config,
}

impl Collection {
    pub const ALL: [Collection; 9] = [
        Collection::Projects,
        Collection::Runs,
        Collection::Sessions,
        Collection::Files,
        Collection::Collections,
        Collection::Teams,
        Collection::Prompts,
        Collection::PromptVersions,
        Collection::Config,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Projects => "projects",
            Collection::Runs => "runs",
            Collection::Sessions => "sessions",
            Collection::Files => "files",
            Collection::Collections => "collections",
            Collection::Teams => "teams",
            Collection::Prompts => "prompts",
            Collection::PromptVersions => "promptVersions",
            Collection::Config => "config",
        }
    }

    pub fn parse(name: &str) -> Result<Collection, StoreError> {
        Collection::ALL
            .iter()
            .find(|c| c.as_str() == name)
            .copied()
            .ok_or_else(|| StoreError::CollectionNotFound(name.to_string()))
    }

    /// The `config` collection is a single record, not an ordered sequence.
    pub fn is_singleton(&self) -> bool {
        matches!(self, Collection::Config)
    }

    /// Content written on first access to a collection that does not exist yet.
    pub fn default_content(&self) -> serde_json::Value {
        if self.is_singleton() {
            serde_json::json!({ "id": 0 })
        } else {
            serde_json::json!([])
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SortSpec {
    pub field: String,
    pub descending: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Pagination {
    pub skip: usize,
    pub limit: usize,
}

/// Query over one collection: equality/operator match plus optional sort and paging.
#[derive(Debug, Clone)]
pub struct DocumentQuery {
    pub collection: Collection,
    pub matcher: serde_json::Value,
    pub sort: Option<SortSpec>,
    pub pagination: Option<Pagination>,
}

impl DocumentQuery {
    pub fn new(collection: Collection) -> Self {
        Self {
            collection,
            matcher: serde_json::json!({}),
            sort: None,
            pagination: None,
        }
    }

    pub fn by_id(collection: Collection, id: &str) -> Self {
        Self::new(collection).matching(id_match(id))
    }

    pub fn matching(mut self, matcher: serde_json::Value) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn sorted_by(mut self, field: &str, descending: bool) -> Self {
        self.sort = Some(SortSpec {
            field: field.to_string(),
            descending,
        });
        self
    }

    pub fn paginated(mut self, skip: usize, limit: usize) -> Self {
        self.pagination = Some(Pagination { skip, limit });
        self
    }
}

/// Shorthand for the most common match shape.
pub fn id_match(id: &str) -> serde_json::Value {
    serde_json::json!({ "id": id })
}

#[derive(Debug, Clone)]
pub struct DocumentPage {
    pub data: Vec<Document>,
    pub total: usize,
}

/// Uniform CRUD + query surface over a backing document collection.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Adapter name used for registry lookup (e.g. "LOCAL", "DATABASE").
    fn name(&self) -> &str;

    /// Fetch the first record matching the query, or `None`.
    async fn get_document(&self, query: &DocumentQuery) -> Result<Option<Document>, StoreError>;

    /// Fetch all matching records, sorted and paginated; `total` counts matches
    /// before pagination.
    async fn get_documents(&self, query: &DocumentQuery) -> Result<DocumentPage, StoreError>;

    /// Insert a record, assigning an id when the payload carries none.
    async fn create_document(
        &self,
        collection: Collection,
        payload: Document,
    ) -> Result<Document, StoreError>;

    /// Merge the given fields into the first matching record. Partial-field
    /// merge, not full replace. Returns the updated record, or `None` when
    /// nothing matched.
    async fn update_document(
        &self,
        collection: Collection,
        matcher: &serde_json::Value,
        update: Document,
    ) -> Result<Option<Document>, StoreError>;

    /// Remove at most one matching record. Removing nothing is not an error.
    async fn delete_document(
        &self,
        collection: Collection,
        matcher: &serde_json::Value,
    ) -> Result<(), StoreError>;
}

/// Uniform surface over binary payload storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn name(&self) -> &str;

    /// Store the file at `source` under `upload_path`.
    async fn upload(&self, source: &Path, upload_path: &str) -> anyhow::Result<()>;

    /// Fetch `download_path` into a local temp file and return its path.
    async fn download(&self, download_path: &str) -> anyhow::Result<PathBuf>;

    /// Remove a stored object. Removing a missing object is a no-op.
    async fn remove(&self, source_path: &str) -> anyhow::Result<()>;

    /// Resolve a reference to a fetchable URL (e.g. a signed URL). The local
    /// backend returns the input unchanged.
    async fn request_url(&self, url: &str, expires_in_s: Option<u64>) -> anyhow::Result<String>;
}

/// Which adapter name is active per kind. `None` selects LOCAL without warning.
#[derive(Debug, Clone, Default)]
pub struct AdapterSelection {
    pub documents: Option<String>,
    pub objects: Option<String>,
}

/// Explicit registration table for adapters, constructed at startup and passed
/// to the components that need resolution. The baseline LOCAL adapters are
/// registered by [`AdapterRegistry::bootstrap`] before any resolution call, so
/// `documents()`/`objects()` never fail.
pub struct AdapterRegistry {
    documents: HashMap<String, Arc<dyn DocumentStore>>,
    objects: HashMap<String, Arc<dyn ObjectStore>>,
    selection: RwLock<AdapterSelection>,
}

impl AdapterRegistry {
    /// Build a registry with the LOCAL document and object adapters rooted at
    /// `data_dir`.
    pub fn bootstrap(data_dir: impl AsRef<Path>, selection: AdapterSelection) -> Self {
        let data_dir = data_dir.as_ref();
        let mut registry = Self {
            documents: HashMap::new(),
            objects: HashMap::new(),
            selection: RwLock::new(selection),
        };
        registry.register_documents(Arc::new(local_docs::LocalDocumentStore::new(
            data_dir.join("collections"),
        )));
        registry.register_objects(Arc::new(local_objects::LocalObjectStore::new(
            data_dir.join("objects"),
            local_objects::FailureMode::BestEffort,
        )));
        registry
    }

    /// Register a document adapter. A duplicate name is discarded with a warning.
    pub fn register_documents(&mut self, store: Arc<dyn DocumentStore>) {
        let name = store.name().to_string();
        if self.documents.contains_key(&name) {
            warn!(adapter = %name, "Document adapter already registered, ignoring");
            return;
        }
        self.documents.insert(name, store);
    }

    /// Register an object-storage adapter. A duplicate name is discarded with a warning.
    pub fn register_objects(&mut self, store: Arc<dyn ObjectStore>) {
        let name = store.name().to_string();
        if self.objects.contains_key(&name) {
            warn!(adapter = %name, "Object adapter already registered, ignoring");
            return;
        }
        self.objects.insert(name, store);
    }

    /// Swap the active selection. Resolution re-reads it on every call, so the
    /// change is observable immediately (used by tests).
    pub fn set_selection(&self, selection: AdapterSelection) {
        *self.selection.write().unwrap_or_else(|e| e.into_inner()) = selection;
    }

    /// Resolve the active document adapter.
    pub fn documents(&self) -> Arc<dyn DocumentStore> {
        let configured = self
            .selection
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .documents
            .clone();
        resolve(&self.documents, configured.as_deref(), "documents")
    }

    /// Resolve the active object-storage adapter.
    pub fn objects(&self) -> Arc<dyn ObjectStore> {
        let configured = self
            .selection
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .objects
            .clone();
        resolve(&self.objects, configured.as_deref(), "objects")
    }

    /// Registered document adapter names, sorted.
    pub fn document_adapters(&self) -> Vec<String> {
        let mut names: Vec<String> = self.documents.keys().cloned().collect();
        names.sort();
        names
    }

    /// Registered object adapter names, sorted.
    pub fn object_adapters(&self) -> Vec<String> {
        let mut names: Vec<String> = self.objects.keys().cloned().collect();
        names.sort();
        names
    }
}

fn resolve<T: ?Sized>(
    table: &HashMap<String, Arc<T>>,
    configured: Option<&str>,
    kind: &str,
) -> Arc<T> {
    if let Some(name) = configured {
        if let Some(adapter) = table.get(name) {
            return adapter.clone();
        }
        warn!(
            kind = kind,
            adapter = name,
            "Configured adapter not registered, falling back to LOCAL"
        );
    }
    table
        .get(LOCAL_ADAPTER)
        .cloned()
        .expect("LOCAL adapter is registered at bootstrap")
}
