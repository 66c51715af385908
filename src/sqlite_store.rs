//! SQLite-backed [`Store`].
//!
//! Chunks live in `chunks`, vectors in `chunk_vectors` as little-endian
//! f32 BLOBs. Vector search loads every stored vector and computes cosine
//! similarity in Rust; keyword search narrows candidates with `LIKE` and
//! rescores with the shared [`keyword_score`] so results rank exactly as
//! they do in the in-memory store.
//!
//! Writers take the per-document lock from [`DocumentLocks`] and run in a
//! transaction; readers go straight to the pool and see the last committed
//! state (WAL mode).

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use docqa_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use docqa_core::models::{CharRange, Chunk, ChunkFilter, ChunkMetadata, DocumentFormat, StoreStats};
use docqa_core::store::{
    check_dims, keyword_score, paginate, rank, ChunkCandidate, DocumentLocks, Store,
};
use docqa_core::StoreError;

use crate::db;
use crate::migrate;

pub struct SqliteStore {
    pool: SqlitePool,
    dims: usize,
    locks: DocumentLocks,
}

fn read_err(e: sqlx::Error) -> StoreError {
    StoreError::Read(e.to_string())
}

fn write_err(e: sqlx::Error) -> StoreError {
    StoreError::Write(e.to_string())
}

const CHUNK_COLUMNS: &str = "c.id, c.document_id, c.sequence_index, c.text, c.char_start, \
     c.char_end, c.hash, c.format, c.source, c.created_at, cv.embedding";

impl SqliteStore {
    /// Wrap an already migrated pool.
    pub fn new(pool: SqlitePool, dims: usize) -> Self {
        Self {
            pool,
            dims,
            locks: DocumentLocks::new(),
        }
    }

    /// Open the database at `path`, running migrations first.
    pub async fn open(path: &Path, dims: usize) -> anyhow::Result<Self> {
        let pool = db::connect_path(path).await?;
        migrate::migrate(&pool).await?;
        Ok(Self::new(pool, dims))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn document_of(&self, chunk_id: &str) -> Result<Option<String>, StoreError> {
        sqlx::query_scalar("SELECT document_id FROM chunks WHERE id = ?")
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(read_err)
    }
}

fn row_to_chunk(row: &SqliteRow) -> Result<Chunk, StoreError> {
    let format: String = row.get("format");
    let format = DocumentFormat::from_str(&format).map_err(StoreError::Read)?;
    let created_ms: i64 = row.get("created_at");
    let created_at: DateTime<Utc> = DateTime::from_timestamp_millis(created_ms)
        .ok_or_else(|| StoreError::Read(format!("invalid timestamp: {}", created_ms)))?;
    let sequence_index: i64 = row.get("sequence_index");
    let char_start: i64 = row.get("char_start");
    let char_end: i64 = row.get("char_end");
    let embedding: Option<Vec<u8>> = row.get("embedding");

    Ok(Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        sequence_index: sequence_index as u32,
        text: row.get("text"),
        char_range: CharRange::new(char_start as usize, char_end as usize),
        hash: row.get("hash"),
        metadata: ChunkMetadata {
            format,
            source: row.get("source"),
            created_at,
        },
        embedding: embedding.map(|b| blob_to_vec(&b)),
    })
}

fn row_to_candidate(row: &SqliteRow, raw_score: f64) -> ChunkCandidate {
    let sequence_index: i64 = row.get("sequence_index");
    ChunkCandidate {
        chunk_id: row.get("id"),
        document_id: row.get("document_id"),
        sequence_index: sequence_index as u32,
        text: row.get("text"),
        raw_score,
    }
}

async fn upsert_document_row(
    tx: &mut sqlx::SqliteConnection,
    document_id: &str,
    chunk: &Chunk,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO documents (id, source, format, ingested_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            source = excluded.source,
            format = excluded.format
        "#,
    )
    .bind(document_id)
    .bind(&chunk.metadata.source)
    .bind(chunk.metadata.format.as_str())
    .bind(chunk.metadata.created_at.timestamp_millis())
    .execute(&mut *tx)
    .await
    .map_err(write_err)?;
    Ok(())
}

async fn upsert_chunk_row(
    tx: &mut sqlx::SqliteConnection,
    chunk: &Chunk,
    embedding: Option<&[f32]>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO chunks (id, document_id, sequence_index, text, char_start, char_end,
                            hash, format, source, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            text = excluded.text,
            char_start = excluded.char_start,
            char_end = excluded.char_end,
            hash = excluded.hash,
            format = excluded.format,
            source = excluded.source,
            created_at = excluded.created_at
        "#,
    )
    .bind(&chunk.id)
    .bind(&chunk.document_id)
    .bind(chunk.sequence_index)
    .bind(&chunk.text)
    .bind(chunk.char_range.start as i64)
    .bind(chunk.char_range.end as i64)
    .bind(&chunk.hash)
    .bind(chunk.metadata.format.as_str())
    .bind(&chunk.metadata.source)
    .bind(chunk.metadata.created_at.timestamp_millis())
    .execute(&mut *tx)
    .await
    .map_err(write_err)?;

    sqlx::query("DELETE FROM chunk_vectors WHERE chunk_id = ?")
        .bind(&chunk.id)
        .execute(&mut *tx)
        .await
        .map_err(write_err)?;

    if let Some(v) = embedding {
        insert_vector(tx, &chunk.id, &chunk.document_id, v).await?;
    }
    Ok(())
}

async fn insert_vector(
    tx: &mut sqlx::SqliteConnection,
    chunk_id: &str,
    document_id: &str,
    vector: &[f32],
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO chunk_vectors (chunk_id, document_id, dims, embedding)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            dims = excluded.dims,
            embedding = excluded.embedding
        "#,
    )
    .bind(chunk_id)
    .bind(document_id)
    .bind(vector.len() as i64)
    .bind(vec_to_blob(vector))
    .execute(&mut *tx)
    .await
    .map_err(write_err)?;
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    fn dims(&self) -> usize {
        self.dims
    }

    async fn put(&self, chunk: &Chunk, embedding: Option<&[f32]>) -> Result<(), StoreError> {
        if let Some(v) = embedding {
            check_dims(self.dims, v)?;
        }
        let _guard = self.locks.lock(&chunk.document_id).await;

        let mut tx = self.pool.begin().await.map_err(write_err)?;
        upsert_document_row(&mut tx, &chunk.document_id, chunk).await?;
        upsert_chunk_row(&mut tx, chunk, embedding).await?;
        tx.commit().await.map_err(write_err)?;
        Ok(())
    }

    async fn put_document(
        &self,
        document_id: &str,
        chunks: &[Chunk],
        embeddings: Option<&[Vec<f32>]>,
    ) -> Result<(), StoreError> {
        if let Some(vecs) = embeddings {
            if vecs.len() != chunks.len() {
                return Err(StoreError::Write(format!(
                    "{} embeddings for {} chunks",
                    vecs.len(),
                    chunks.len()
                )));
            }
            for v in vecs {
                check_dims(self.dims, v)?;
            }
        }
        if let Some(c) = chunks.iter().find(|c| c.document_id != document_id) {
            return Err(StoreError::Write(format!(
                "chunk {} does not belong to document {}",
                c.id, document_id
            )));
        }

        let _guard = self.locks.lock(document_id).await;
        let mut tx = self.pool.begin().await.map_err(write_err)?;

        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(write_err)?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(write_err)?;

        match chunks.first() {
            Some(first) => upsert_document_row(&mut tx, document_id, first).await?,
            None => {
                sqlx::query("DELETE FROM documents WHERE id = ?")
                    .bind(document_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(write_err)?;
            }
        }

        for (i, chunk) in chunks.iter().enumerate() {
            let vector = embeddings.map(|vecs| vecs[i].as_slice());
            upsert_chunk_row(&mut tx, chunk, vector).await?;
        }

        tx.commit().await.map_err(write_err)?;
        Ok(())
    }

    async fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<ChunkCandidate>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.document_id, c.sequence_index, c.text, cv.embedding
            FROM chunk_vectors cv
            JOIN chunks c ON c.id = cv.chunk_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(read_err)?;

        let candidates = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let similarity = cosine_similarity(query, &blob_to_vec(&blob)) as f64;
                row_to_candidate(row, similarity)
            })
            .collect();
        Ok(rank(candidates, k))
    }

    async fn keyword_search(
        &self,
        terms: &[String],
        k: usize,
    ) -> Result<Vec<ChunkCandidate>, StoreError> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        // SQLite's LIKE only folds ASCII case, so the prefilter is skipped
        // when any term needs Unicode folding.
        let rows = if terms.iter().all(|t| t.is_ascii()) {
            let clauses = vec!["c.text LIKE ? ESCAPE '\\'"; terms.len()].join(" OR ");
            let sql = format!(
                "SELECT c.id, c.document_id, c.sequence_index, c.text FROM chunks c WHERE {}",
                clauses
            );
            let mut q = sqlx::query(&sql);
            for term in terms {
                q = q.bind(format!("%{}%", escape_like(term)));
            }
            q.fetch_all(&self.pool).await.map_err(read_err)?
        } else {
            sqlx::query("SELECT c.id, c.document_id, c.sequence_index, c.text FROM chunks c")
                .fetch_all(&self.pool)
                .await
                .map_err(read_err)?
        };

        let candidates = rows
            .iter()
            .filter_map(|row| {
                let text: String = row.get("text");
                let score = keyword_score(terms, &text);
                (score > 0.0).then(|| row_to_candidate(row, score))
            })
            .collect();
        Ok(rank(candidates, k))
    }

    async fn chunks(&self, filter: &ChunkFilter) -> Result<Vec<Chunk>, StoreError> {
        let mut sql = format!(
            "SELECT {} FROM chunks c LEFT JOIN chunk_vectors cv ON cv.chunk_id = c.id WHERE 1 = 1",
            CHUNK_COLUMNS
        );
        if filter.document_id.is_some() {
            sql.push_str(" AND c.document_id = ?");
        }
        if filter.source.is_some() {
            sql.push_str(" AND c.source = ?");
        }
        sql.push_str(" ORDER BY c.document_id, c.sequence_index");

        let mut q = sqlx::query(&sql);
        if let Some(ref id) = filter.document_id {
            q = q.bind(id);
        }
        if let Some(ref src) = filter.source {
            q = q.bind(src);
        }
        let rows = q.fetch_all(&self.pool).await.map_err(read_err)?;

        let mut matching = Vec::with_capacity(rows.len());
        for row in &rows {
            let chunk = row_to_chunk(row)?;
            if filter.matches(&chunk) {
                matching.push(chunk);
            }
        }
        Ok(paginate(matching, filter))
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize, StoreError> {
        let _guard = self.locks.lock(document_id).await;
        let mut tx = self.pool.begin().await.map_err(write_err)?;

        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(write_err)?;
        let removed = sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(write_err)?
            .rows_affected();
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(write_err)?;

        tx.commit().await.map_err(write_err)?;
        Ok(removed as usize)
    }

    async fn documents_for_source(&self, source: &str) -> Result<Vec<String>, StoreError> {
        sqlx::query_scalar("SELECT DISTINCT document_id FROM chunks WHERE source = ? ORDER BY document_id")
            .bind(source)
            .fetch_all(&self.pool)
            .await
            .map_err(read_err)
    }

    async fn has_embeddings(&self) -> Result<bool, StoreError> {
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM chunk_vectors)")
            .fetch_one(&self.pool)
            .await
            .map_err(read_err)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let documents: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT document_id) FROM chunks")
            .fetch_one(&self.pool)
            .await
            .map_err(read_err)?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await
            .map_err(read_err)?;
        let embedded: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
            .fetch_one(&self.pool)
            .await
            .map_err(read_err)?;
        Ok(StoreStats {
            documents: documents as usize,
            chunks: chunks as usize,
            embedded_chunks: embedded as usize,
        })
    }

    async fn set_embedding(&self, chunk_id: &str, vector: &[f32]) -> Result<(), StoreError> {
        check_dims(self.dims, vector)?;
        let document_id = self
            .document_of(chunk_id)
            .await?
            .ok_or_else(|| StoreError::Write(format!("unknown chunk: {}", chunk_id)))?;

        let _guard = self.locks.lock(&document_id).await;
        if self.document_of(chunk_id).await?.is_none() {
            return Err(StoreError::Write(format!("unknown chunk: {}", chunk_id)));
        }
        let mut conn = self.pool.acquire().await.map_err(write_err)?;
        insert_vector(&mut conn, chunk_id, &document_id, vector).await
    }

    async fn chunks_without_embeddings(&self, limit: usize) -> Result<Vec<Chunk>, StoreError> {
        let sql = format!(
            "SELECT {} FROM chunks c LEFT JOIN chunk_vectors cv ON cv.chunk_id = c.id \
             WHERE cv.chunk_id IS NULL ORDER BY c.document_id, c.sequence_index LIMIT ?",
            CHUNK_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(read_err)?;
        rows.iter().map(row_to_chunk).collect()
    }
}

fn escape_like(term: &str) -> String {
    term.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
