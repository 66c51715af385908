//! In-memory [`Store`] implementation for tests and embedded use.
//!
//! Chunks live in a `BTreeMap` keyed by `(document_id, sequence_index)`
//! behind a `std::sync::RwLock`, so scans come out in reading order for
//! free. Vector search is brute-force cosine similarity; keyword search
//! tokenizes every chunk on each query. Locks are never held across an
//! `.await`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::StoreError;
use crate::models::{Chunk, ChunkFilter, StoreStats};

use super::{
    check_dims, keyword_score, paginate, rank, ChunkCandidate, DocumentLocks, Store,
};

type ChunkKey = (String, u32);

/// In-memory store.
pub struct InMemoryStore {
    dims: usize,
    chunks: RwLock<BTreeMap<ChunkKey, Chunk>>,
    locks: DocumentLocks,
}

impl InMemoryStore {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            chunks: RwLock::new(BTreeMap::new()),
            locks: DocumentLocks::new(),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<ChunkKey, Chunk>>, StoreError> {
        self.chunks
            .read()
            .map_err(|_| StoreError::Read("chunk map lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<ChunkKey, Chunk>>, StoreError> {
        self.chunks
            .write()
            .map_err(|_| StoreError::Write("chunk map lock poisoned".into()))
    }
}

fn key(chunk: &Chunk) -> ChunkKey {
    (chunk.document_id.clone(), chunk.sequence_index)
}

#[async_trait]
impl Store for InMemoryStore {
    fn dims(&self) -> usize {
        self.dims
    }

    async fn put(&self, chunk: &Chunk, embedding: Option<&[f32]>) -> Result<(), StoreError> {
        if let Some(v) = embedding {
            check_dims(self.dims, v)?;
        }
        let _guard = self.locks.lock(&chunk.document_id).await;
        let mut stored = chunk.clone();
        stored.embedding = embedding.map(|v| v.to_vec());
        self.write()?.insert(key(chunk), stored);
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
        let mut map = self.write()?;
        map.retain(|(doc, _), _| doc != document_id);
        for (i, chunk) in chunks.iter().enumerate() {
            let mut stored = chunk.clone();
            stored.embedding = embeddings.map(|vecs| vecs[i].clone());
            map.insert(key(chunk), stored);
        }
        Ok(())
    }

    async fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<ChunkCandidate>, StoreError> {
        let map = self.read()?;
        let candidates = map
            .values()
            .filter_map(|c| {
                c.embedding
                    .as_ref()
                    .map(|v| ChunkCandidate::from_chunk(c, cosine_similarity(query, v) as f64))
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
        let map = self.read()?;
        let candidates = map
            .values()
            .filter_map(|c| {
                let score = keyword_score(terms, &c.text);
                (score > 0.0).then(|| ChunkCandidate::from_chunk(c, score))
            })
            .collect();
        Ok(rank(candidates, k))
    }

    async fn chunks(&self, filter: &ChunkFilter) -> Result<Vec<Chunk>, StoreError> {
        let map = self.read()?;
        let matching = map.values().filter(|c| filter.matches(c)).cloned().collect();
        Ok(paginate(matching, filter))
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize, StoreError> {
        let _guard = self.locks.lock(document_id).await;
        let mut map = self.write()?;
        let before = map.len();
        map.retain(|(doc, _), _| doc != document_id);
        Ok(before - map.len())
    }

    async fn documents_for_source(&self, source: &str) -> Result<Vec<String>, StoreError> {
        let map = self.read()?;
        let ids: BTreeSet<&str> = map
            .values()
            .filter(|c| c.metadata.source == source)
            .map(|c| c.document_id.as_str())
            .collect();
        Ok(ids.into_iter().map(String::from).collect())
    }

    async fn has_embeddings(&self) -> Result<bool, StoreError> {
        Ok(self.read()?.values().any(|c| c.embedding.is_some()))
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let map = self.read()?;
        let documents: BTreeSet<&str> = map.keys().map(|(doc, _)| doc.as_str()).collect();
        Ok(StoreStats {
            documents: documents.len(),
            chunks: map.len(),
            embedded_chunks: map.values().filter(|c| c.embedding.is_some()).count(),
        })
    }

    async fn set_embedding(&self, chunk_id: &str, vector: &[f32]) -> Result<(), StoreError> {
        check_dims(self.dims, vector)?;
        let document_id = {
            let map = self.read()?;
            map.values()
                .find(|c| c.id == chunk_id)
                .map(|c| c.document_id.clone())
                .ok_or_else(|| StoreError::Write(format!("unknown chunk: {}", chunk_id)))?
        };

        let _guard = self.locks.lock(&document_id).await;
        let mut map = self.write()?;
        match map.values_mut().find(|c| c.id == chunk_id) {
            Some(chunk) => {
                chunk.embedding = Some(vector.to_vec());
                Ok(())
            }
            // Deleted while we waited for the lock.
            None => Err(StoreError::Write(format!("unknown chunk: {}", chunk_id))),
        }
    }

    async fn chunks_without_embeddings(&self, limit: usize) -> Result<Vec<Chunk>, StoreError> {
        let map = self.read()?;
        Ok(map
            .values()
            .filter(|c| c.embedding.is_none())
            .take(limit)
            .cloned()
            .collect())
    }
}
