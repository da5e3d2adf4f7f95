use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use sqlx::{AnyPool, Row};
use uuid::Uuid;

use super::matching::{matches, merge_fields, paginate, sort_documents};
use super::{Collection, Document, DocumentPage, DocumentQuery, DocumentStore, StoreError};

pub const DATABASE_ADAPTER: &str = "DATABASE";

/// Networked document store backed by any sqlx-supported database. Documents
/// live in one table keyed by (collection, doc_id) with the body stored as
/// JSON text; per-document write atomicity comes from single-row statements.
pub struct DbDocumentStore {
    pool: AnyPool,
}

impl DbDocumentStore {
    /// Connect and ensure the schema exists.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        sqlx::any::install_default_drivers();

        let pool = AnyPool::connect(url)
            .await
            .with_context(|| format!("Failed to connect to database '{}'", url))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                doc_id TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (collection, doc_id)
            )",
        )
        .execute(&pool)
        .await
        .context("Failed to create documents table")?;

        Ok(Self { pool })
    }

    async fn fetch_collection(&self, collection: Collection) -> Result<Vec<Document>, StoreError> {
        let rows = sqlx::query("SELECT body FROM documents WHERE collection = ?")
            .bind(collection.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(anyhow!("Failed to query '{}': {}", collection, e)))?;

        let mut docs = Vec::with_capacity(rows.len());
        for row in &rows {
            let body: String = row
                .try_get("body")
                .map_err(|e| StoreError::Backend(e.into()))?;
            let doc: Document = serde_json::from_str(&body)
                .with_context(|| format!("Corrupt document body in '{}'", collection))
                .map_err(StoreError::Backend)?;
            docs.push(doc);
        }

        // First access to a singleton collection seeds its default record.
        if docs.is_empty() && collection.is_singleton() {
            let default = collection
                .default_content()
                .as_object()
                .cloned()
                .unwrap_or_default();
            self.insert_row(collection, &default).await?;
            docs.push(default);
        }

        Ok(docs)
    }

    async fn insert_row(&self, collection: Collection, doc: &Document) -> Result<(), StoreError> {
        let body = serde_json::to_string(&doc).map_err(|e| StoreError::Backend(e.into()))?;
        sqlx::query("INSERT INTO documents (collection, doc_id, body) VALUES (?, ?, ?)")
            .bind(collection.as_str())
            .bind(doc_key(doc))
            .bind(body)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                StoreError::Backend(anyhow!("Failed to insert into '{}': {}", collection, e))
            })?;
        Ok(())
    }

    async fn update_row(&self, collection: Collection, doc: &Document) -> Result<(), StoreError> {
        let body = serde_json::to_string(&doc).map_err(|e| StoreError::Backend(e.into()))?;
        sqlx::query("UPDATE documents SET body = ? WHERE collection = ? AND doc_id = ?")
            .bind(body)
            .bind(collection.as_str())
            .bind(doc_key(doc))
            .execute(&self.pool)
            .await
            .map_err(|e| {
                StoreError::Backend(anyhow!("Failed to update in '{}': {}", collection, e))
            })?;
        Ok(())
    }
}

/// Row key for a document: its id field rendered as text.
fn doc_key(doc: &Document) -> String {
    match doc.get("id") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

#[async_trait]
impl DocumentStore for DbDocumentStore {
    fn name(&self) -> &str {
        DATABASE_ADAPTER
    }

    async fn get_document(&self, query: &DocumentQuery) -> Result<Option<Document>, StoreError> {
        let docs = self.fetch_collection(query.collection).await?;
        Ok(docs.into_iter().find(|doc| matches(doc, &query.matcher)))
    }

    async fn get_documents(&self, query: &DocumentQuery) -> Result<DocumentPage, StoreError> {
        let docs = self.fetch_collection(query.collection).await?;

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
        if collection.is_singleton() {
            let mut docs = self.fetch_collection(collection).await?;
            let doc = docs.first_mut().expect("singleton default seeded");
            merge_fields(doc, &payload);
            self.update_row(collection, doc).await?;
            return Ok(doc.clone());
        }

        if !payload.contains_key("id") {
            payload.insert(
                "id".to_string(),
                serde_json::Value::String(Uuid::new_v4().to_string()),
            );
        }

        self.insert_row(collection, &payload).await?;
        Ok(payload)
    }

    async fn update_document(
        &self,
        collection: Collection,
        matcher: &serde_json::Value,
        update: Document,
    ) -> Result<Option<Document>, StoreError> {
        let docs = self.fetch_collection(collection).await?;

        let Some(mut doc) = docs.into_iter().find(|doc| matches(doc, matcher)) else {
            return Ok(None);
        };

        merge_fields(&mut doc, &update);
        self.update_row(collection, &doc).await?;
        Ok(Some(doc))
    }

    async fn delete_document(
        &self,
        collection: Collection,
        matcher: &serde_json::Value,
    ) -> Result<(), StoreError> {
        if collection.is_singleton() {
            let default = collection
                .default_content()
                .as_object()
                .cloned()
                .unwrap_or_default();
            self.update_row(collection, &default).await?;
            return Ok(());
        }

        let docs = self.fetch_collection(collection).await?;
        let Some(doc) = docs.into_iter().find(|doc| matches(doc, matcher)) else {
            return Ok(());
        };

        sqlx::query("DELETE FROM documents WHERE collection = ? AND doc_id = ?")
            .bind(collection.as_str())
            .bind(doc_key(&doc))
            .execute(&self.pool)
            .await
            .map_err(|e| {
                StoreError::Backend(anyhow!("Failed to delete from '{}': {}", collection, e))
            })?;
        Ok(())
    }
}
