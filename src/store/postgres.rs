//! PostgreSQL + pgvector [`VectorStore`].
//!
//! ## Insert or update?
//!
//! `INSERT ... ON CONFLICT (chunk_id) DO UPDATE ... RETURNING (xmax = 0)`
//! reports per row whether the statement inserted it (`xmax` is zero for a
//! freshly inserted tuple) or overwrote an existing one, so a re-run of the
//! same document reports updates instead of growing the table.
//!
//! ## Stale rows
//!
//! A re-run may split a page into fewer chunks than before. Before the
//! inserts, the transaction deletes rows of every page being written whose
//! `chunk_id` is not part of the new set. Pages that produced nothing this
//! run keep their rows.
//!
//! ## Transactions
//!
//! One transaction per document. If any statement fails, the transaction is
//! dropped without commit and sqlx rolls it back, so rows from earlier,
//! committed runs stay intact and no partial document becomes visible.

use super::{check_dimensions, page_set, SearchHit, StoredChunk, UpsertOutcome, VectorStore};
use crate::error::StoreError;
use crate::model::EmbeddedChunk;
use async_trait::async_trait;
use pgvector::Vector;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use tracing::{debug, info};

const UPSERT_SQL: &str = r#"
INSERT INTO document_chunks
    (chunk_id, file_id, page_index, chunk_index, char_offset, text, metadata, embedding)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
ON CONFLICT (chunk_id) DO UPDATE SET
    file_id     = EXCLUDED.file_id,
    page_index  = EXCLUDED.page_index,
    chunk_index = EXCLUDED.chunk_index,
    char_offset = EXCLUDED.char_offset,
    text        = EXCLUDED.text,
    metadata    = EXCLUDED.metadata,
    embedding   = EXCLUDED.embedding,
    updated_at  = now()
RETURNING (xmax = 0) AS inserted
"#;

const DELETE_STALE_SQL: &str = r#"
DELETE FROM document_chunks
WHERE file_id = $1
  AND page_index = ANY($2)
  AND NOT (chunk_id = ANY($3))
"#;

const SEARCH_SQL: &str = r#"
SELECT chunk_id, file_id, page_index, char_offset, text, metadata,
       (1 - (embedding <=> $1))::float8 AS score
FROM document_chunks
ORDER BY embedding <=> $1
LIMIT $2
"#;

const FILE_SQL: &str = r#"
SELECT chunk_id, file_id, page_index, char_offset, text, metadata
FROM document_chunks
WHERE file_id = $1
ORDER BY page_index, char_offset
"#;

/// pgvector-backed store over a pooled connection.
#[derive(Debug, Clone)]
pub struct PgVectorStore {
    pool: PgPool,
    dimension: usize,
}

impl PgVectorStore {
    /// Open a connection pool.
    pub async fn connect(url: &str, max_connections: u32, dimension: usize) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        info!("Connected to Postgres (pool size {})", max_connections.max(1));
        Ok(Self::from_pool(pool, dimension))
    }

    pub fn from_pool(pool: PgPool, dimension: usize) -> Self {
        Self { pool, dimension }
    }

    fn schema_statements(&self) -> Vec<String> {
        vec![
            "CREATE EXTENSION IF NOT EXISTS vector".to_string(),
            format!(
                "CREATE TABLE IF NOT EXISTS document_chunks (
                    chunk_id    TEXT PRIMARY KEY,
                    file_id     TEXT NOT NULL,
                    page_index  INTEGER NOT NULL,
                    chunk_index INTEGER NOT NULL,
                    char_offset INTEGER NOT NULL,
                    text        TEXT NOT NULL,
                    metadata    JSONB NOT NULL,
                    embedding   vector({}) NOT NULL,
                    created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
                    updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
                )",
                self.dimension
            ),
            "CREATE INDEX IF NOT EXISTS document_chunks_file_idx ON document_chunks (file_id)"
                .to_string(),
            "CREATE INDEX IF NOT EXISTS document_chunks_embedding_idx \
             ON document_chunks USING hnsw (embedding vector_cosine_ops)"
                .to_string(),
        ]
    }
}

fn stored_chunk(row: &PgRow) -> Result<StoredChunk, sqlx::Error> {
    Ok(StoredChunk {
        chunk_id: row.try_get("chunk_id")?,
        file_id: row.try_get("file_id")?,
        page_index: row.try_get::<i32, _>("page_index")? as usize,
        char_offset: row.try_get::<i32, _>("char_offset")? as usize,
        text: row.try_get("text")?,
        metadata: row.try_get("metadata")?,
    })
}

#[async_trait]
impl VectorStore for PgVectorStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in self.schema_statements() {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Schema(e.to_string()))?;
        }
        info!("Schema ready: document_chunks (vector({}))", self.dimension);
        Ok(())
    }

    async fn upsert_document(
        &self,
        file_id: &str,
        chunks: &[EmbeddedChunk],
    ) -> Result<UpsertOutcome, StoreError> {
        check_dimensions(chunks, self.dimension)?;

        let (pages, ids) = page_set(chunks);
        let pages: Vec<i32> = pages.into_iter().map(|p| p as i32).collect();
        let ids: Vec<String> = ids.into_iter().map(str::to_string).collect();

        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Connection(e.to_string()))?;
        let mut outcome = UpsertOutcome::default();

        let deleted = sqlx::query(DELETE_STALE_SQL)
            .bind(file_id)
            .bind(&pages)
            .bind(&ids)
            .execute(&mut *tx)
            .await?;
        outcome.removed = deleted.rows_affected() as usize;

        for c in chunks {
            let chunk = c.chunk();
            let inserted: bool = sqlx::query_scalar(UPSERT_SQL)
                .bind(&chunk.chunk_id)
                .bind(file_id)
                .bind(chunk.page_index as i32)
                .bind(chunk.chunk_index as i32)
                .bind(chunk.char_offset as i32)
                .bind(&chunk.text)
                .bind(&chunk.metadata)
                .bind(Vector::from(c.embedding().to_vec()))
                .fetch_one(&mut *tx)
                .await?;
            if inserted {
                outcome.inserted += 1;
            } else {
                outcome.updated += 1;
            }
        }

        tx.commit().await?;
        debug!(
            "Stored {} chunks for {} ({} new, {} updated, {} stale removed)",
            chunks.len(),
            file_id,
            outcome.inserted,
            outcome.updated,
            outcome.removed
        );
        Ok(outcome)
    }

    async fn search(&self, embedding: &[f32], k: usize) -> Result<Vec<SearchHit>, StoreError> {
        let rows = sqlx::query(SEARCH_SQL)
            .bind(Vector::from(embedding.to_vec()))
            .bind(k as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(SearchHit {
                    chunk: stored_chunk(row)?,
                    score: row.try_get::<f64, _>("score")? as f32,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM document_chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    async fn chunks_for_file(&self, file_id: &str) -> Result<Vec<StoredChunk>, StoreError> {
        let rows = sqlx::query(FILE_SQL).bind(file_id).fetch_all(&self.pool).await?;
        rows.iter()
            .map(stored_chunk)
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StoreError::from)
    }
}
