//! Retrieval manager and remote store against a fake PostgREST service.

mod support;

use serde_json::json;

use llm_relay::config::Config;
use llm_relay::error::StoreError;
use llm_relay::remote_store::{NewRecord, RemoteStore, SearchMode};
use llm_relay::retrieval::{Backend, RetrievalManager};
use llm_relay::router::StaticCredentials;

use support::{hash_embedding, FakeGateway, FakeStore, Reply};

const DIMS: usize = support::EMBED_DIMS;

fn creds() -> StaticCredentials {
    StaticCredentials::new().with("TEST_STORE_KEY", "service-key")
}

async fn config_with(dir: &std::path::Path, store: Option<&FakeStore>) -> Config {
    let gw = FakeGateway::start(Reply::text("unused")).await;
    let mut cfg = support::test_config(dir, &gw);
    cfg.remote_store = store.map(|s| s.config(DIMS));
    cfg
}

fn seed_corpus(store: &FakeStore) {
    let docs = [
        ("rust.md", "rust ownership borrowing lifetimes"),
        ("rust.md", "cargo crates and rust modules"),
        ("cooking.md", "pasta sauce tomato basil"),
        ("garden.md", "tomato plants need sun and water"),
        ("travel.md", "train tickets and hotel booking"),
    ];
    let mut next = std::collections::HashMap::new();
    for (doc, text) in docs {
        let idx = next.entry(doc).or_insert(0i64);
        store.seed(doc, *idx, text, &hash_embedding(text, DIMS));
        *idx += 1;
    }
}

#[tokio::test]
async fn server_and_client_ranking_agree() {
    let with_rpc = FakeStore::start(true).await;
    let without_rpc = FakeStore::start(false).await;
    seed_corpus(&with_rpc);
    seed_corpus(&without_rpc);

    let server = RemoteStore::connect(&with_rpc.config(DIMS), "service-key".into())
        .await
        .unwrap();
    let client = RemoteStore::connect(&without_rpc.config(DIMS), "service-key".into())
        .await
        .unwrap();
    assert_eq!(server.mode(), SearchMode::ServerRanked);
    assert_eq!(client.mode(), SearchMode::ClientRanked);

    for query in ["rust borrowing", "tomato", "hotel train"] {
        let q = hash_embedding(query, DIMS);
        let a = server.similarity_search(&q, 3, Some(0.0)).await.unwrap();
        let b = client.similarity_search(&q, 3, Some(0.0)).await.unwrap();

        let key = |m: &llm_relay::remote_store::RemoteMatch| (m.content.clone(), m.similarity);
        assert_eq!(
            a.iter().map(key).collect::<Vec<_>>(),
            b.iter().map(key).collect::<Vec<_>>(),
            "query {:?}",
            query
        );
        assert!(a.len() <= 3);
        assert!(a.windows(2).all(|w| w[0].similarity >= w[1].similarity));
    }
}

#[tokio::test]
async fn threshold_filters_results() {
    let store = FakeStore::start(false).await;
    seed_corpus(&store);
    let remote = RemoteStore::connect(&store.config(DIMS), "service-key".into())
        .await
        .unwrap();

    let q = hash_embedding("rust ownership borrowing lifetimes", DIMS);
    let strict = remote.similarity_search(&q, 10, Some(0.99)).await.unwrap();
    assert_eq!(strict.len(), 1);
    assert_eq!(strict[0].document_id.as_deref(), Some("rust.md"));
    assert_eq!(strict[0].chunk_index, Some(0));
}

#[tokio::test]
async fn wrong_dimension_is_rejected() {
    let store = FakeStore::start(true).await;
    let remote = RemoteStore::connect(&store.config(DIMS), "service-key".into())
        .await
        .unwrap();

    let err = remote
        .store(NewRecord {
            content: "short",
            embedding: &[0.1, 0.2, 0.3],
            metadata: json!({}),
            document_id: Some("x"),
            chunk_index: 0,
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::DimensionMismatch {
            expected: 64,
            actual: 3
        }
    ));

    let err = remote.similarity_search(&[1.0], 3, None).await.unwrap_err();
    assert!(matches!(err, StoreError::DimensionMismatch { .. }));
    assert!(store.rows().is_empty());
}

#[tokio::test]
async fn document_lookup_and_delete() {
    let store = FakeStore::start(false).await;
    seed_corpus(&store);
    let remote = RemoteStore::connect(&store.config(DIMS), "service-key".into())
        .await
        .unwrap();

    assert!(remote.test_connection().await);

    let chunks = remote.document_chunks("rust.md").await.unwrap();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].chunk_index, Some(0));
    assert_eq!(chunks[1].content, "cargo crates and rust modules");

    assert_eq!(remote.delete_document("rust.md").await.unwrap(), 2);
    assert!(remote.document_chunks("rust.md").await.unwrap().is_empty());
    assert_eq!(store.rows().len(), 3);

    let stats = remote.stats().await.unwrap();
    assert_eq!(stats.total_embeddings, 3);
    assert_eq!(stats.unique_documents, 3);
    assert_eq!(stats.file_types.get("text"), Some(&3));
}

// ─── Manager ────────────────────────────────────────────────────────

#[tokio::test]
async fn remote_first_write() {
    let dir = tempfile::tempdir().unwrap();
    let store = FakeStore::start(true).await;
    let cfg = config_with(dir.path(), Some(&store)).await;
    let m = RetrievalManager::from_config(&cfg, &creds()).await.unwrap();
    assert!(m.remote().is_some());

    let text = "alpha beta gamma. ".repeat(30);
    let outcome = m
        .embed_and_store(&text, "notes.txt", json!({"file_type": "text"}))
        .await;
    assert_eq!(outcome.backend, Some(Backend::Remote));
    assert!(outcome.chunks > 1);
    assert!(m.local().is_empty());

    let rows = store.rows();
    assert_eq!(rows.len(), outcome.chunks);
    assert_eq!(rows[0]["document_id"], "notes.txt");
    assert_eq!(rows[0]["metadata"]["filename"], "notes.txt");
    assert_eq!(rows[0]["metadata"]["file_type"], "text");
    assert_eq!(rows[0]["metadata"]["total_chunks"], outcome.chunks);
    assert_eq!(rows[1]["chunk_index"], 1);
}

#[tokio::test]
async fn failed_remote_write_falls_back_to_local() {
    let dir = tempfile::tempdir().unwrap();
    let store = FakeStore::start(true).await;
    store.fail_inserts(true);
    let cfg = config_with(dir.path(), Some(&store)).await;
    let m = RetrievalManager::from_config(&cfg, &creds()).await.unwrap();

    let outcome = m
        .embed_and_store("the quick brown fox", "fox.txt", json!({}))
        .await;
    assert_eq!(outcome.backend, Some(Backend::Local));
    assert_eq!(outcome.chunks, 1);
    assert!(outcome.remote_error.is_some());
    assert_eq!(m.local().len(), 1);
    assert!(store.rows().is_empty());

    // the local index was saved
    assert!(dir.path().join("index").join("chunks.json").exists());
}

#[tokio::test]
async fn remote_dimension_mismatch_falls_back_to_local() {
    let dir = tempfile::tempdir().unwrap();
    let store = FakeStore::start(true).await;
    let mut cfg = config_with(dir.path(), None).await;
    cfg.remote_store = Some(store.config(DIMS * 2));
    let m = RetrievalManager::from_config(&cfg, &creds()).await.unwrap();

    let outcome = m.embed_and_store("some text", "a.txt", json!({})).await;
    assert_eq!(outcome.backend, Some(Backend::Local));
    let reason = outcome.remote_error.unwrap();
    assert!(reason.contains("dimension"), "{}", reason);
    assert!(outcome.local_error.is_none());
    assert_eq!(m.local().len(), 1);
    assert!(store.rows().is_empty());
}

#[tokio::test]
async fn reingest_continues_remote_chunk_index() {
    let dir = tempfile::tempdir().unwrap();
    let store = FakeStore::start(true).await;
    let cfg = config_with(dir.path(), Some(&store)).await;
    let m = RetrievalManager::from_config(&cfg, &creds()).await.unwrap();

    for _ in 0..2 {
        let outcome = m.embed_and_store("hello there", "doc1", json!({})).await;
        assert_eq!(outcome.backend, Some(Backend::Remote));
        assert_eq!(outcome.chunks, 1);
    }
    m.embed_and_store("another document", "doc2", json!({})).await;

    let mut keys: Vec<(String, i64)> = store
        .rows()
        .iter()
        .map(|r| {
            (
                r["document_id"].as_str().unwrap().to_string(),
                r["chunk_index"].as_i64().unwrap(),
            )
        })
        .collect();
    keys.sort();
    assert_eq!(
        keys,
        vec![
            ("doc1".to_string(), 0),
            ("doc1".to_string(), 1),
            ("doc2".to_string(), 0),
        ]
    );
    let second = store
        .rows()
        .into_iter()
        .find(|r| r["document_id"] == "doc1" && r["chunk_index"] == 1)
        .unwrap();
    assert_eq!(second["metadata"]["chunk_index"], 1);
}

#[tokio::test]
async fn unreachable_remote_runs_local_only() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config_with(dir.path(), None).await;
    let mut remote_cfg = FakeStore::start(true).await.config(DIMS);
    remote_cfg.url = support::dead_url("");
    remote_cfg.timeout_secs = 2;
    cfg.remote_store = Some(remote_cfg);

    let m = RetrievalManager::from_config(&cfg, &creds()).await.unwrap();
    assert!(m.remote().is_none());

    m.embed_and_store("local text only", "l.txt", json!({})).await;
    let stats = m.stats().await;
    assert_eq!(stats.local_chunks, 1);
    assert_eq!(stats.remote_chunks, 0);
    assert_eq!(stats.total_chunks, 1);
    assert!(stats.remote.is_none());
    assert!(stats.remote_error.is_some());
}

#[tokio::test]
async fn missing_store_key_runs_local_only() {
    let dir = tempfile::tempdir().unwrap();
    let store = FakeStore::start(true).await;
    let cfg = config_with(dir.path(), Some(&store)).await;
    let m = RetrievalManager::from_config(&cfg, &StaticCredentials::new())
        .await
        .unwrap();
    assert!(m.remote().is_none());
    let stats = m.stats().await;
    assert_eq!(stats.remote_error.as_deref(), Some("TEST_STORE_KEY is not set"));
}

#[tokio::test]
async fn stats_add_local_and_remote() {
    let dir = tempfile::tempdir().unwrap();
    let store = FakeStore::start(false).await;
    seed_corpus(&store);

    // write one document locally first, with no remote configured
    let cfg = config_with(dir.path(), None).await;
    let local_only = RetrievalManager::from_config(&cfg, &creds()).await.unwrap();
    local_only
        .embed_and_store("local notes about rust", "local.md", json!({}))
        .await;
    drop(local_only);

    // reopen with the remote; the saved index is loaded
    let mut cfg = cfg;
    cfg.remote_store = Some(store.config(DIMS));
    let m = RetrievalManager::from_config(&cfg, &creds()).await.unwrap();
    let stats = m.stats().await;

    assert_eq!(stats.local_chunks, 1);
    assert_eq!(stats.remote_chunks, 5);
    assert_eq!(stats.total_chunks, 6);
    assert_eq!(stats.remote_mode, Some(SearchMode::ClientRanked));
    assert_eq!(stats.sources[0], "local.md");
    assert!(stats.sources.contains(&"travel.md".to_string()));
    assert_eq!(stats.sources.len(), 5);
}

#[tokio::test]
async fn reads_come_from_local_index() {
    let dir = tempfile::tempdir().unwrap();
    let store = FakeStore::start(true).await;
    seed_corpus(&store);
    let cfg = config_with(dir.path(), Some(&store)).await;
    let m = RetrievalManager::from_config(&cfg, &creds()).await.unwrap();

    // remote rows are not visible to the turn-time search
    assert!(m.search("rust borrowing", 3).await.unwrap().is_empty());
    assert!(m.retrieval_context("rust borrowing").await.is_empty());

    let remote = m.search_remote("rust borrowing", 2, None).await.unwrap();
    assert!(!remote.is_empty());
    assert_eq!(remote[0].document_id.as_deref(), Some("rust.md"));
}
