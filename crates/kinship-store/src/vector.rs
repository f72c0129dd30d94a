use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::types::Float32Type;
use arrow_array::{
    Array, ArrayRef, FixedSizeListArray, Float32Array, Float64Array, Int64Array, RecordBatch,
    RecordBatchIterator, StringArray,
};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use async_trait::async_trait;
use futures::TryStreamExt;
use kinship_config::{EmbeddingVectorBackend, kinship_dir, load_workspace_config};
use kinship_core::{ExternalId, SearchField};
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::{Connection as LanceConnection, DistanceType, Error as LanceError, connect};
use rusqlite::{OptionalExtension, params};

use crate::{SqliteStore, StoreError};

const VECTOR_TABLE_PREFIX: &str = "issue_";
const MAX_SEARCH_LIMIT: u32 = 100;

/// One embedding of one searchable field of one issue.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub external_id: ExternalId,
    pub field: SearchField,
    pub provider: String,
    pub model: String,
    pub embedding: Vec<f32>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorSearchResult {
    pub external_id: ExternalId,
    pub distance: f32,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert_vector(&self, record: VectorRecord) -> Result<(), StoreError>;
    async fn get_vector(
        &self,
        external_id: ExternalId,
        field: SearchField,
        provider: &str,
        model: &str,
    ) -> Result<Option<Vec<f32>>, StoreError>;
    async fn delete_vector(
        &self,
        external_id: ExternalId,
        field: SearchField,
    ) -> Result<(), StoreError>;
    /// Nearest stored vectors by cosine distance, ascending.
    async fn search_nearest(
        &self,
        query_embedding: &[f32],
        field: SearchField,
        provider: &str,
        model: &str,
        limit: u32,
    ) -> Result<Vec<VectorSearchResult>, StoreError>;
}

pub async fn open_vector_store(
    workspace_root: impl AsRef<Path>,
    sqlite: Arc<SqliteStore>,
) -> Result<Arc<dyn VectorStore>, StoreError> {
    let workspace_root = workspace_root.as_ref();
    let config = load_workspace_config(workspace_root)?;

    match config.embeddings.vector_backend {
        EmbeddingVectorBackend::Sqlite => Ok(Arc::new(SqliteVectorStore::new(sqlite))),
        EmbeddingVectorBackend::Lancedb => {
            Ok(Arc::new(LanceVectorStore::open(workspace_root).await?))
        }
    }
}

/// Cosine distance in `[0, 2]`; `None` when the vectors cannot be compared.
pub fn cosine_distance(left: &[f32], right: &[f32]) -> Option<f32> {
    if left.len() != right.len() || left.is_empty() {
        return None;
    }

    let mut dot = 0.0f32;
    let mut left_norm_sq = 0.0f32;
    let mut right_norm_sq = 0.0f32;
    for (left_value, right_value) in left.iter().zip(right.iter()) {
        dot += left_value * right_value;
        left_norm_sq += left_value * left_value;
        right_norm_sq += right_value * right_value;
    }

    if left_norm_sq <= f32::EPSILON || right_norm_sq <= f32::EPSILON {
        return None;
    }

    let similarity = dot / (left_norm_sq.sqrt() * right_norm_sq.sqrt());
    Some((1.0 - similarity).clamp(0.0, 2.0))
}

impl SqliteStore {
    pub fn upsert_issue_embedding(&self, record: &VectorRecord) -> Result<(), StoreError> {
        let embedding_json = serde_json::to_string(&record.embedding)?;
        self.conn()?.execute(
            r#"
            INSERT INTO issue_embeddings (
                external_id, field, provider, model, embedding_json, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(external_id, field) DO UPDATE SET
                provider = excluded.provider,
                model = excluded.model,
                embedding_json = excluded.embedding_json,
                updated_at = excluded.updated_at
            "#,
            params![
                record.external_id,
                record.field.as_str(),
                record.provider,
                record.model,
                embedding_json,
                record.updated_at,
            ],
        )?;

        Ok(())
    }

    pub fn get_issue_embedding(
        &self,
        external_id: ExternalId,
        field: SearchField,
        provider: &str,
        model: &str,
    ) -> Result<Option<Vec<f32>>, StoreError> {
        let raw = self
            .conn()?
            .query_row(
                r#"
                SELECT embedding_json
                FROM issue_embeddings
                WHERE external_id = ?1 AND field = ?2 AND provider = ?3 AND model = ?4
                "#,
                params![external_id, field.as_str(), provider, model],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        raw.map(|raw| serde_json::from_str(&raw).map_err(StoreError::from))
            .transpose()
    }

    pub fn delete_issue_embedding(
        &self,
        external_id: ExternalId,
        field: SearchField,
    ) -> Result<(), StoreError> {
        self.conn()?.execute(
            "DELETE FROM issue_embeddings WHERE external_id = ?1 AND field = ?2",
            params![external_id, field.as_str()],
        )?;
        Ok(())
    }

    /// Brute-force scan of stored embeddings for one field and model.
    pub fn search_issue_embeddings(
        &self,
        query_embedding: &[f32],
        field: SearchField,
        provider: &str,
        model: &str,
        limit: u32,
    ) -> Result<Vec<VectorSearchResult>, StoreError> {
        if query_embedding.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let rows = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                r#"
                SELECT external_id, embedding_json
                FROM issue_embeddings
                WHERE field = ?1 AND provider = ?2 AND model = ?3
                "#,
            )?;
            let rows = stmt
                .query_map(params![field.as_str(), provider, model], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut results = Vec::new();
        for (external_id, embedding_json) in rows {
            let embedding: Vec<f32> = serde_json::from_str(&embedding_json)?;
            let Some(distance) = cosine_distance(query_embedding, &embedding) else {
                continue;
            };
            results.push(VectorSearchResult {
                external_id,
                distance,
            });
        }

        sort_by_distance(&mut results);
        results.truncate(limit.min(MAX_SEARCH_LIMIT) as usize);
        Ok(results)
    }
}

pub struct SqliteVectorStore {
    store: Arc<SqliteStore>,
}

impl SqliteVectorStore {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn upsert_vector(&self, record: VectorRecord) -> Result<(), StoreError> {
        self.store.upsert_issue_embedding(&record)
    }

    async fn get_vector(
        &self,
        external_id: ExternalId,
        field: SearchField,
        provider: &str,
        model: &str,
    ) -> Result<Option<Vec<f32>>, StoreError> {
        self.store
            .get_issue_embedding(external_id, field, provider, model)
    }

    async fn delete_vector(
        &self,
        external_id: ExternalId,
        field: SearchField,
    ) -> Result<(), StoreError> {
        self.store.delete_issue_embedding(external_id, field)
    }

    async fn search_nearest(
        &self,
        query_embedding: &[f32],
        field: SearchField,
        provider: &str,
        model: &str,
        limit: u32,
    ) -> Result<Vec<VectorSearchResult>, StoreError> {
        self.store
            .search_issue_embeddings(query_embedding, field, provider, model, limit)
    }
}

pub struct LanceVectorStore {
    vectors_dir: PathBuf,
}

impl LanceVectorStore {
    pub async fn open(workspace_root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let vectors_dir = kinship_dir(workspace_root).join("vectors");
        fs::create_dir_all(&vectors_dir)?;

        let store = Self { vectors_dir };
        store.connect().await?;
        Ok(store)
    }

    async fn connect(&self) -> Result<LanceConnection, StoreError> {
        connect(self.vectors_dir.to_string_lossy().as_ref())
            .execute()
            .await
            .map_err(map_lancedb_err)
    }

    async fn field_table_names(
        &self,
        connection: &LanceConnection,
        field: SearchField,
    ) -> Result<Vec<String>, StoreError> {
        let prefix = table_prefix(field);
        Ok(connection
            .table_names()
            .execute()
            .await
            .map_err(map_lancedb_err)?
            .into_iter()
            .filter(|name| name.starts_with(&prefix))
            .collect())
    }
}

#[async_trait]
impl VectorStore for LanceVectorStore {
    async fn upsert_vector(&self, record: VectorRecord) -> Result<(), StoreError> {
        let embedding_dim = record.embedding.len() as i32;
        if embedding_dim <= 0 {
            return Ok(());
        }

        let connection = self.connect().await?;
        let table_name = table_name_for(
            record.field,
            record.provider.as_str(),
            record.model.as_str(),
            embedding_dim,
        );

        let (schema, batch) = record_batch(&record)?;
        let reader = RecordBatchIterator::new(vec![Ok(batch)].into_iter(), schema);

        let table = match connection.open_table(&table_name).execute().await {
            Ok(table) => table,
            Err(LanceError::TableNotFound { .. }) => {
                connection
                    .create_table(&table_name, Box::new(reader))
                    .execute()
                    .await
                    .map_err(map_lancedb_err)?;
                return Ok(());
            }
            Err(err) => return Err(map_lancedb_err(err)),
        };

        let mut merge = table.merge_insert(&["external_id"]);
        merge
            .when_matched_update_all(None)
            .when_not_matched_insert_all();
        merge
            .execute(Box::new(reader))
            .await
            .map_err(map_lancedb_err)?;
        Ok(())
    }

    async fn get_vector(
        &self,
        external_id: ExternalId,
        field: SearchField,
        provider: &str,
        model: &str,
    ) -> Result<Option<Vec<f32>>, StoreError> {
        let connection = self.connect().await?;
        let predicate = format!(
            "external_id = {external_id} AND provider = '{}' AND model = '{}'",
            escape_sql_string(provider),
            escape_sql_string(model)
        );

        for name in self.field_table_names(&connection, field).await? {
            let Ok(table) = connection.open_table(&name).execute().await else {
                continue;
            };

            let batches = table
                .query()
                .select(Select::columns(&["external_id", "embedding"]))
                .only_if(predicate.as_str())
                .limit(1)
                .execute()
                .await
                .map_err(map_lancedb_err)?
                .try_collect::<Vec<_>>()
                .await
                .map_err(map_lancedb_err)?;

            if let Some(batch) = batches.iter().find(|batch| batch.num_rows() > 0) {
                return Ok(Some(embedding_at(batch, "embedding", 0)?));
            }
        }

        Ok(None)
    }

    async fn delete_vector(
        &self,
        external_id: ExternalId,
        field: SearchField,
    ) -> Result<(), StoreError> {
        let connection = self.connect().await?;
        let predicate = format!("external_id = {external_id}");

        for name in self.field_table_names(&connection, field).await? {
            let Ok(table) = connection.open_table(&name).execute().await else {
                continue;
            };
            table
                .delete(predicate.as_str())
                .await
                .map_err(map_lancedb_err)?;
        }

        Ok(())
    }

    async fn search_nearest(
        &self,
        query_embedding: &[f32],
        field: SearchField,
        provider: &str,
        model: &str,
        limit: u32,
    ) -> Result<Vec<VectorSearchResult>, StoreError> {
        let provider = provider.trim();
        let model = model.trim();
        if query_embedding.is_empty() || provider.is_empty() || model.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let limit = limit.min(MAX_SEARCH_LIMIT) as usize;
        let table_name = table_name_for(field, provider, model, query_embedding.len() as i32);
        let connection = self.connect().await?;
        let table = match connection.open_table(&table_name).execute().await {
            Ok(table) => table,
            Err(LanceError::TableNotFound { .. }) => return Ok(Vec::new()),
            Err(err) => return Err(map_lancedb_err(err)),
        };

        let batches = table
            .query()
            .select(Select::columns(&["external_id", "_distance"]))
            .nearest_to(query_embedding)
            .map_err(map_lancedb_err)?
            .distance_type(DistanceType::Cosine)
            .limit(limit)
            .execute()
            .await
            .map_err(map_lancedb_err)?
            .try_collect::<Vec<_>>()
            .await
            .map_err(map_lancedb_err)?;

        let mut rows = Vec::new();
        for batch in batches {
            let distances = batch
                .column_by_name("_distance")
                .ok_or_else(|| StoreError::LanceDb("missing _distance column".to_owned()))?;

            for idx in 0..batch.num_rows() {
                let distance = distance_at(distances, idx)?;
                if !distance.is_finite() {
                    continue;
                }
                rows.push(VectorSearchResult {
                    external_id: int64_at(&batch, "external_id", idx)?,
                    distance,
                });
            }
        }

        sort_by_distance(&mut rows);
        rows.truncate(limit);
        Ok(rows)
    }
}

fn sort_by_distance(rows: &mut [VectorSearchResult]) {
    rows.sort_by(|left, right| {
        left.distance
            .partial_cmp(&right.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| left.external_id.cmp(&right.external_id))
    });
}

fn map_lancedb_err(err: LanceError) -> StoreError {
    StoreError::LanceDb(err.to_string())
}

fn vector_schema(embedding_dim: i32) -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("external_id", DataType::Int64, false),
        Field::new("provider", DataType::Utf8, false),
        Field::new("model", DataType::Utf8, false),
        Field::new(
            "embedding",
            DataType::FixedSizeList(
                Arc::new(Field::new("item", DataType::Float32, true)),
                embedding_dim,
            ),
            true,
        ),
        Field::new("updated_at", DataType::Int64, false),
    ]))
}

fn record_batch(record: &VectorRecord) -> Result<(SchemaRef, RecordBatch), StoreError> {
    let embedding_dim = record.embedding.len() as i32;
    if embedding_dim <= 0 {
        return Err(StoreError::LanceDb(
            "embedding cannot be empty for LanceDB upsert".to_owned(),
        ));
    }

    let schema = vector_schema(embedding_dim);
    let embedding = FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(
        std::iter::once(Some(
            record
                .embedding
                .iter()
                .copied()
                .map(Some)
                .collect::<Vec<Option<f32>>>(),
        )),
        embedding_dim,
    );

    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(vec![record.external_id])),
        Arc::new(StringArray::from(vec![record.provider.clone()])),
        Arc::new(StringArray::from(vec![record.model.clone()])),
        Arc::new(embedding),
        Arc::new(Int64Array::from(vec![record.updated_at])),
    ];
    let batch = RecordBatch::try_new(schema.clone(), columns)
        .map_err(|err| StoreError::LanceDb(err.to_string()))?;
    Ok((schema, batch))
}

fn table_prefix(field: SearchField) -> String {
    format!("{VECTOR_TABLE_PREFIX}{}_", field.as_str())
}

fn table_name_for(field: SearchField, provider: &str, model: &str, embedding_dim: i32) -> String {
    let provider = sanitize_for_table_name(provider);
    let model = sanitize_for_table_name(model);
    format!("{}{embedding_dim}_{provider}_{model}", table_prefix(field))
}

fn sanitize_for_table_name(value: &str) -> String {
    let mut output = String::with_capacity(value.len().min(48));
    for ch in value.chars() {
        let next = if ch.is_ascii_alphanumeric() {
            ch.to_ascii_lowercase()
        } else {
            '_'
        };
        if next == '_' && output.ends_with('_') {
            continue;
        }
        output.push(next);
        if output.len() >= 48 {
            break;
        }
    }
    output.trim_matches('_').to_owned()
}

fn distance_at(column: &ArrayRef, index: usize) -> Result<f32, StoreError> {
    if let Some(values) = column.as_any().downcast_ref::<Float32Array>() {
        if values.is_null(index) {
            return Err(StoreError::LanceDb("null distance value".to_owned()));
        }
        return Ok(values.value(index));
    }
    if let Some(values) = column.as_any().downcast_ref::<Float64Array>() {
        if values.is_null(index) {
            return Err(StoreError::LanceDb("null distance value".to_owned()));
        }
        return Ok(values.value(index) as f32);
    }

    Err(StoreError::LanceDb(format!(
        "unsupported _distance type: {:?}",
        column.data_type()
    )))
}

fn int64_at(batch: &RecordBatch, column_name: &str, row: usize) -> Result<i64, StoreError> {
    let array = batch
        .column_by_name(column_name)
        .ok_or_else(|| StoreError::LanceDb(format!("missing column {column_name}")))?
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| StoreError::LanceDb(format!("column {column_name} is not Int64")))?;
    if array.is_null(row) {
        return Err(StoreError::LanceDb(format!(
            "column {column_name} has null at row {row}"
        )));
    }
    Ok(array.value(row))
}

fn embedding_at(
    batch: &RecordBatch,
    column_name: &str,
    row: usize,
) -> Result<Vec<f32>, StoreError> {
    let array = batch
        .column_by_name(column_name)
        .ok_or_else(|| StoreError::LanceDb(format!("missing column {column_name}")))?
        .as_any()
        .downcast_ref::<FixedSizeListArray>()
        .ok_or_else(|| StoreError::LanceDb(format!("column {column_name} is not FixedSizeList")))?;

    if array.is_null(row) {
        return Ok(Vec::new());
    }

    let values = array.value(row);
    let values = values
        .as_any()
        .downcast_ref::<Float32Array>()
        .ok_or_else(|| {
            StoreError::LanceDb(format!("column {column_name} values are not Float32"))
        })?;

    let mut embedding = Vec::with_capacity(values.len());
    for idx in 0..values.len() {
        if values.is_null(idx) {
            return Err(StoreError::LanceDb(format!(
                "column {column_name} has null embedding value"
            )));
        }
        embedding.push(values.value(idx));
    }
    Ok(embedding)
}

fn escape_sql_string(value: &str) -> String {
    value.replace('\'', "''")
}
