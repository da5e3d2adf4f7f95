use std::path::{Path, PathBuf};

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::matching::{matches, merge_fields, paginate, sort_documents};
use super::{
    Collection, Document, DocumentPage, DocumentQuery, DocumentStore, LOCAL_ADAPTER, StoreError,
};

/// Flat-file document store. Each collection is one JSON file under the data
/// directory; every mutation reads the whole file, mutates in memory, and
/// writes the whole file back, so a crash never leaves a partially appended
/// file. There is no cross-record transaction; cascades must run as
/// independent, retryable job steps.
pub struct LocalDocumentStore {
    data_dir: PathBuf,
    lock: RwLock<()>,
}

impl LocalDocumentStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            lock: RwLock::new(()),
        }
    }

    fn collection_path(&self, collection: Collection) -> PathBuf {
        self.data_dir.join(format!("{}.json", collection))
    }

    /// Read a collection file, creating it with the collection's default
    /// content on first access.
    async fn read_collection(&self, collection: Collection) -> Result<Vec<Document>, StoreError> {
        let path = self.collection_path(collection);

        if !path.exists() {
            let default = collection.default_content();
            self.write_raw(collection, &default).await?;
            return Ok(value_to_documents(collection, default));
        }

        let data = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read collection file: {}", path.display()))
            .map_err(StoreError::Backend)?;
        let value: serde_json::Value = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse collection '{}'", collection))
            .map_err(StoreError::Backend)?;

        Ok(value_to_documents(collection, value))
    }

    async fn write_collection(
        &self,
        collection: Collection,
        docs: Vec<Document>,
    ) -> Result<(), StoreError> {
        let value = if collection.is_singleton() {
            docs.into_iter()
                .next()
                .map(serde_json::Value::Object)
                .unwrap_or_else(|| collection.default_content())
        } else {
            serde_json::Value::Array(docs.into_iter().map(serde_json::Value::Object).collect())
        };
        self.write_raw(collection, &value).await
    }

    /// Whole-file replace via a unique temp file and rename.
    async fn write_raw(
        &self,
        collection: Collection,
        value: &serde_json::Value,
    ) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;

        let path = self.collection_path(collection);
        let tmp_path = self
            .data_dir
            .join(format!("{}.{}.tmp", collection, Uuid::new_v4()));

        let data =
            serde_json::to_string_pretty(value).map_err(|e| StoreError::Backend(e.into()))?;
        tokio::fs::write(&tmp_path, &data)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;

        Ok(())
    }
}

fn value_to_documents(collection: Collection, value: serde_json::Value) -> Vec<Document> {
    match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                serde_json::Value::Object(doc) => Some(doc),
                _ => None,
            })
            .collect(),
        serde_json::Value::Object(doc) => vec![doc],
        _ => value_to_documents(collection, collection.default_content()),
    }
}

#[async_trait]
impl DocumentStore for LocalDocumentStore {
    fn name(&self) -> &str {
        LOCAL_ADAPTER
    }

    async fn get_document(&self, query: &DocumentQuery) -> Result<Option<Document>, StoreError> {
        let _guard = self.lock.read().await;
        let docs = self.read_collection(query.collection).await?;
        Ok(docs.into_iter().find(|doc| matches(doc, &query.matcher)))
    }

    async fn get_documents(&self, query: &DocumentQuery) -> Result<DocumentPage, StoreError> {
        let _guard = self.lock.read().await;
        let docs = self.read_collection(query.collection).await?;

        let mut selected: Vec<Document> = docs
            .into_iter()
            .filter(|doc| matches(doc, &query.matcher))
            .collect();
        let total = selected.len();

        if let Some(ref sort) = query.sort {
            sort_documents(&mut selected, sort);
        }
        if let Some(ref pagination) = query.pagination {
            selected = paginate(selected, pagination);
        }

        Ok(DocumentPage {
            data: selected,
            total,
        })
    }

    async fn create_document(
        &self,
        collection: Collection,
        mut payload: Document,
    ) -> Result<Document, StoreError> {
        let _guard = self.lock.write().await;
        let mut docs = self.read_collection(collection).await?;

        if collection.is_singleton() {
            // The config record is a singleton; creation merges into it.
            let doc = docs.first_mut().expect("singleton default exists");
            merge_fields(doc, &payload);
            let created = doc.clone();
            self.write_collection(collection, docs).await?;
            return Ok(created);
        }

        if !payload.contains_key("id") {
            payload.insert(
                "id".to_string(),
                serde_json::Value::String(Uuid::new_v4().to_string()),
            );
        }

        docs.push(payload.clone());
        self.write_collection(collection, docs).await?;
        Ok(payload)
    }

    async fn update_document(
        &self,
        collection: Collection,
        matcher: &serde_json::Value,
        update: Document,
    ) -> Result<Option<Document>, StoreError> {
        let _guard = self.lock.write().await;
        let mut docs = self.read_collection(collection).await?;

        let Some(doc) = docs.iter_mut().find(|doc| matches(doc, matcher)) else {
            return Ok(None);
        };

        merge_fields(doc, &update);
        let updated = doc.clone();
        self.write_collection(collection, docs).await?;
        Ok(Some(updated))
    }

    async fn delete_document(
        &self,
        collection: Collection,
        matcher: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let _guard = self.lock.write().await;

        if collection.is_singleton() {
            // Deleting the config singleton resets it to its default.
            self.write_raw(collection, &collection.default_content())
                .await?;
            return Ok(());
        }

        let mut docs = self.read_collection(collection).await?;
        if let Some(index) = docs.iter().position(|doc| matches(doc, matcher)) {
            docs.remove(index);
            self.write_collection(collection, docs).await?;
        }
        Ok(())
    }
}
