use std::sync::Arc;

use docqa::sqlite_store::SqliteStore;
use docqa_core::models::{CharRange, Chunk, ChunkFilter, ChunkMetadata, DocumentFormat};
use docqa_core::store::Store;
use docqa_core::StoreError;
use tempfile::TempDir;

fn chunk(doc: &str, seq: u32, text: &str) -> Chunk {
    Chunk {
        id: Chunk::make_id(doc, seq),
        document_id: doc.into(),
        sequence_index: seq,
        text: text.into(),
        char_range: CharRange::new(seq as usize * 100, seq as usize * 100 + text.chars().count()),
        hash: format!("hash-{}-{}", doc, seq),
        metadata: ChunkMetadata {
            format: DocumentFormat::Markdown,
            source: format!("{}.md", doc),
            created_at: chrono::Utc::now(),
        },
        embedding: None,
    }
}

async fn open_store(tmp: &TempDir, dims: usize) -> SqliteStore {
    SqliteStore::open(&tmp.path().join("data/docqa.sqlite"), dims)
        .await
        .unwrap()
}

#[tokio::test]
async fn put_document_roundtrips_chunks_in_order() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp, 2).await;

    let chunks = vec![
        chunk("doc-a", 0, "Knee surgery is covered."),
        chunk("doc-a", 1, "Dental work is excluded."),
    ];
    store
        .put_document("doc-a", &chunks, Some(&[vec![1.0, 0.0], vec![0.0, 1.0]]))
        .await
        .unwrap();

    let stored = store.chunks(&ChunkFilter::for_document("doc-a")).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].id, "doc-a:0");
    assert_eq!(stored[1].text, "Dental work is excluded.");
    assert_eq!(stored[1].char_range, CharRange::new(100, 124));
    assert_eq!(stored[1].metadata.format, DocumentFormat::Markdown);
    assert_eq!(stored[0].embedding.as_deref(), Some(&[1.0f32, 0.0][..]));

    let stats = store.stats().await.unwrap();
    assert_eq!((stats.documents, stats.chunks, stats.embedded_chunks), (1, 2, 2));
}

#[tokio::test]
async fn nearest_orders_by_similarity() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp, 2).await;
    store
        .put_document(
            "d",
            &[chunk("d", 0, "x"), chunk("d", 1, "y"), chunk("d", 2, "z")],
            Some(&[vec![0.0, 1.0], vec![1.0, 0.0], vec![0.7, 0.7]]),
        )
        .await
        .unwrap();

    let hits = store.nearest(&[1.0, 0.0], 2).await.unwrap();
    let ids: Vec<_> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
    assert_eq!(ids, ["d:1", "d:2"]);
    assert!(hits[0].raw_score > hits[1].raw_score);
}

#[tokio::test]
async fn keyword_search_scores_and_breaks_ties_by_sequence() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp, 0).await;
    store
        .put_document(
            "d",
            &[
                chunk("d", 0, "Surgery waiting period applies."),
                chunk("d", 1, "Knee surgery, knee replacement."),
                chunk("d", 2, "Surgery limits are listed below."),
                chunk("d", 3, "Dental is excluded."),
            ],
            None,
        )
        .await
        .unwrap();

    let terms = vec!["knee".to_string(), "surgery".to_string()];
    let hits = store.keyword_search(&terms, 10).await.unwrap();
    let ids: Vec<_> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
    assert_eq!(ids, ["d:1", "d:0", "d:2"]);

    let again = store.keyword_search(&terms, 10).await.unwrap();
    assert_eq!(hits, again);
}

#[tokio::test]
async fn keyword_search_treats_like_wildcards_literally() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp, 0).await;
    store
        .put_document("d", &[chunk("d", 0, "copay is 100 percent")], None)
        .await
        .unwrap();

    let hits = store.keyword_search(&["%".to_string()], 10).await.unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn delete_removes_chunks_and_vectors() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp, 2).await;
    store
        .put_document("d", &[chunk("d", 0, "knee")], Some(&[vec![1.0, 0.0]]))
        .await
        .unwrap();

    assert_eq!(store.delete_document("d").await.unwrap(), 1);
    assert_eq!(store.delete_document("d").await.unwrap(), 0);
    assert!(store.nearest(&[1.0, 0.0], 5).await.unwrap().is_empty());
    assert!(store
        .keyword_search(&["knee".to_string()], 5)
        .await
        .unwrap()
        .is_empty());
    assert!(!store.has_embeddings().await.unwrap());
}

#[tokio::test]
async fn dimension_mismatch_is_rejected_without_writing() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp, 3).await;
    let err = store
        .put_document("d", &[chunk("d", 0, "knee")], Some(&[vec![1.0, 0.0]]))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Write(_)));
    assert_eq!(store.stats().await.unwrap().chunks, 0);
}

#[tokio::test]
async fn backfill_helpers_track_missing_vectors() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp, 2).await;
    store
        .put_document("d", &[chunk("d", 0, "a"), chunk("d", 1, "b")], None)
        .await
        .unwrap();

    let pending = store.chunks_without_embeddings(10).await.unwrap();
    assert_eq!(pending.len(), 2);

    store.set_embedding("d:0", &[0.5, 0.5]).await.unwrap();
    let pending = store.chunks_without_embeddings(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, "d:1");
    assert!(store.set_embedding("missing:0", &[0.5, 0.5]).await.is_err());
}

#[tokio::test]
async fn filters_by_source_and_text() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp, 0).await;
    store
        .put_document("a", &[chunk("a", 0, "Knee surgery"), chunk("a", 1, "Dental")], None)
        .await
        .unwrap();
    store
        .put_document("b", &[chunk("b", 0, "Knee brace")], None)
        .await
        .unwrap();

    let by_source = store
        .chunks(&ChunkFilter {
            source: Some("b.md".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_source.len(), 1);

    let by_text = store
        .chunks(&ChunkFilter {
            text_contains: Some("KNEE".into()),
            limit: Some(1),
            offset: 1,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_text.len(), 1);
    assert_eq!(by_text[0].id, "b:0");

    assert_eq!(store.documents_for_source("a.md").await.unwrap(), ["a"]);
}

#[tokio::test]
async fn store_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    {
        let store = open_store(&tmp, 0).await;
        store
            .put_document("d", &[chunk("d", 0, "persisted text")], None)
            .await
            .unwrap();
    }
    let store = open_store(&tmp, 0).await;
    assert_eq!(store.stats().await.unwrap().chunks, 1);
}

#[tokio::test]
async fn concurrent_writers_on_distinct_documents() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(open_store(&tmp, 0).await);

    let mut handles = Vec::new();
    for i in 0..6 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let doc = format!("doc-{}", i);
            store
                .put_document(&doc, &[chunk(&doc, 0, "alpha"), chunk(&doc, 1, "beta")], None)
                .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    let stats = store.stats().await.unwrap();
    assert_eq!((stats.documents, stats.chunks), (6, 12));
}
