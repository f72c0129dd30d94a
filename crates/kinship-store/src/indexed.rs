use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use kinship_core::{ExternalId, FieldChanges, Issue, IssueField, SearchField, SimilarIssue};
use kinship_infer::{
    EmbeddingProviderOverrides, LoadedEmbeddingProvider, load_embedding_provider_from_config,
};

use crate::vector::{VectorRecord, VectorStore, open_vector_store};
use crate::{IssueStore, SimilaritySearch, SqliteStore, StoreError};

/// Issue table plus per-field vector index, kept in step on every write.
pub struct IndexedIssueStore {
    store: Arc<SqliteStore>,
    vectors: Arc<dyn VectorStore>,
    embedder: LoadedEmbeddingProvider,
}

impl IndexedIssueStore {
    pub fn new(
        store: Arc<SqliteStore>,
        vectors: Arc<dyn VectorStore>,
        embedder: LoadedEmbeddingProvider,
    ) -> Self {
        Self {
            store,
            vectors,
            embedder,
        }
    }

    pub async fn open(workspace_root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let workspace_root = workspace_root.as_ref();
        let store = Arc::new(SqliteStore::open(workspace_root)?);
        let vectors = open_vector_store(workspace_root, store.clone()).await?;
        let embedder = load_embedding_provider_from_config(
            workspace_root,
            EmbeddingProviderOverrides::default(),
        )?;

        tracing::debug!(
            provider = %embedder.provider_name,
            model = %embedder.model_name,
            "opened indexed issue store"
        );
        Ok(Self::new(store, vectors, embedder))
    }

    pub fn sqlite(&self) -> &SqliteStore {
        &self.store
    }

    /// `None` for blank text or a vector with no direction.
    async fn embed(&self, text: Option<&str>) -> Result<Option<Vec<f32>>, StoreError> {
        let Some(text) = text.filter(|value| !value.trim().is_empty()) else {
            return Ok(None);
        };

        let embedding = self.embedder.provider.embed_text(text).await?;
        if embedding.iter().all(|value| *value == 0.0) {
            return Ok(None);
        }
        Ok(Some(embedding))
    }

    async fn write_vector(
        &self,
        issue: &Issue,
        field: SearchField,
        embedding: Option<Vec<f32>>,
    ) -> Result<(), StoreError> {
        match embedding {
            Some(embedding) => {
                self.vectors
                    .upsert_vector(VectorRecord {
                        external_id: issue.external_id,
                        field,
                        provider: self.embedder.provider_name.clone(),
                        model: self.embedder.model_name.clone(),
                        embedding,
                        updated_at: issue.updated_at.timestamp(),
                    })
                    .await
            }
            None => self.vectors.delete_vector(issue.external_id, field).await,
        }
    }

    async fn write_vectors(
        &self,
        issue: &Issue,
        embeddings: Vec<(SearchField, Option<Vec<f32>>)>,
    ) -> Result<(), StoreError> {
        for (field, embedding) in embeddings {
            self.write_vector(issue, field, embedding).await?;
        }
        Ok(())
    }

    async fn current_vector(
        &self,
        external_id: ExternalId,
        field: SearchField,
    ) -> Result<Option<Vec<f32>>, StoreError> {
        self.vectors
            .get_vector(
                external_id,
                field,
                &self.embedder.provider_name,
                &self.embedder.model_name,
            )
            .await
    }

    /// Removes a row whose vectors could not be written, so a retry inserts it again.
    async fn rollback_insert(&self, external_id: ExternalId) {
        for field in SearchField::ALL {
            if let Err(err) = self.vectors.delete_vector(external_id, field).await {
                tracing::warn!(external_id, field = field.as_str(), error = %err, "failed to drop partial vector");
            }
        }
        if let Err(err) = self.store.delete_issue(external_id) {
            tracing::error!(external_id, error = %err, "failed to roll back issue insert");
        }
    }

    /// Restores the changed columns and vectors, so a retry sees the same diff again.
    async fn rollback_update(
        &self,
        existing: &Issue,
        changes: &FieldChanges,
        previous_vectors: Vec<(SearchField, Option<Vec<f32>>)>,
    ) {
        let external_id = existing.external_id;
        let restore = changes
            .keys()
            .map(|field| (*field, existing.field(*field)))
            .collect::<FieldChanges>();
        if let Err(err) = self.store.update_issue(&restore, external_id) {
            tracing::error!(external_id, error = %err, "failed to roll back issue update");
        }
        for (field, vector) in previous_vectors {
            if let Err(err) = self.write_vector(existing, field, vector).await {
                tracing::warn!(external_id, field = field.as_str(), error = %err, "failed to restore vector");
            }
        }
    }
}

#[async_trait]
impl IssueStore for IndexedIssueStore {
    async fn has_table(&self, name: &str) -> Result<bool, StoreError> {
        self.store.has_table(name)
    }

    async fn create_table(&self, name: &str) -> Result<(), StoreError> {
        self.store.create_table(name)
    }

    async fn get(&self, external_id: ExternalId) -> Result<Option<Issue>, StoreError> {
        let Some(mut issue) = self.store.get_issue(external_id)? else {
            return Ok(None);
        };

        for field in SearchField::ALL {
            let vector = self
                .vectors
                .get_vector(
                    external_id,
                    field,
                    &self.embedder.provider_name,
                    &self.embedder.model_name,
                )
                .await?;
            match field {
                SearchField::Title => issue.title_vec = vector,
                SearchField::Body => issue.body_vec = vector,
            }
        }

        Ok(Some(issue))
    }

    async fn insert(&self, issue: Issue) -> Result<(), StoreError> {
        let mut embeddings = Vec::with_capacity(SearchField::ALL.len());
        for field in SearchField::ALL {
            embeddings.push((field, self.embed(issue.searchable_text(field)).await?));
        }

        self.store.insert_issue(&issue)?;
        if let Err(err) = self.write_vectors(&issue, embeddings).await {
            self.rollback_insert(issue.external_id).await;
            return Err(err);
        }

        tracing::debug!(
            external_id = issue.external_id,
            number = issue.number,
            "inserted issue"
        );
        Ok(())
    }

    async fn update(
        &self,
        changes: &FieldChanges,
        external_id: ExternalId,
    ) -> Result<(), StoreError> {
        if let Some(field) = changes
            .keys()
            .find(|field| field.is_derived() || **field == IssueField::ExternalId)
        {
            return Err(StoreError::ProtectedField(*field));
        }

        let existing = self
            .store
            .get_issue(external_id)?
            .ok_or(StoreError::NotFound(external_id))?;
        let mut updated = existing.clone();
        updated.apply_changes(changes)?;

        let mut embeddings = Vec::new();
        let mut previous_vectors = Vec::new();
        for field in SearchField::ALL {
            if changes.contains_key(&field.source_field()) {
                embeddings.push((field, self.embed(updated.searchable_text(field)).await?));
                previous_vectors.push((field, self.current_vector(external_id, field).await?));
            }
        }

        self.store.update_issue(changes, external_id)?;
        if let Err(err) = self.write_vectors(&updated, embeddings).await {
            self.rollback_update(&existing, changes, previous_vectors).await;
            return Err(err);
        }

        tracing::debug!(external_id, fields = changes.len(), "updated issue");
        Ok(())
    }
}

#[async_trait]
impl SimilaritySearch for IndexedIssueStore {
    async fn search(
        &self,
        query_text: &str,
        field: SearchField,
        limit: u32,
        distance_threshold: f32,
    ) -> Result<Vec<SimilarIssue>, StoreError> {
        let Some(query_embedding) = self.embed(Some(query_text)).await? else {
            return Ok(Vec::new());
        };

        let candidates = self
            .vectors
            .search_nearest(
                &query_embedding,
                field,
                &self.embedder.provider_name,
                &self.embedder.model_name,
                limit,
            )
            .await?;

        let mut results = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if candidate.distance > distance_threshold {
                continue;
            }
            let Some(issue) = self.store.get_issue(candidate.external_id)? else {
                tracing::debug!(
                    external_id = candidate.external_id,
                    field = field.as_str(),
                    "skipping vector without stored issue"
                );
                continue;
            };
            results.push(SimilarIssue {
                issue,
                distance: candidate.distance,
                matched_field: field,
            });
        }

        Ok(results)
    }
}
