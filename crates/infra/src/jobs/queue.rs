//! Chunk queue: FIFO of submission work in the durable store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use curator_core::ChunkId;

use crate::store::{DurableStore, StoreError, discard, get_json, put_json};

use super::ingest::CorrelationId;
use super::keys;
use super::types::Chunk;

pub struct ChunkQueue {
    store: Arc<dyn DurableStore>,
}

impl ChunkQueue {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    /// Store each chunk under a fresh key, in order.
    pub async fn enqueue(&self, chunks: Vec<Chunk>) -> Result<Vec<ChunkId>, StoreError> {
        let mut ids = Vec::with_capacity(chunks.len());
        for mut chunk in chunks {
            chunk.retry_count = 0;
            let id = ChunkId::new();
            put_json(self.store.as_ref(), &keys::chunk(&id), &chunk).await?;
            debug!(chunk_id = %id, index = chunk.index, articles = chunk.articles.len(), "chunk queued");
            ids.push(id);
        }
        Ok(ids)
    }

    /// The oldest queued chunk.
    ///
    /// Entries with a malformed key or value are logged and deleted so they
    /// cannot block the rest of the queue.
    pub async fn oldest(&self) -> Result<Option<(ChunkId, Chunk)>, StoreError> {
        while let Some((key, value)) = self.store.first(keys::CHUNK_PREFIX).await? {
            let Some(id) = keys::chunk_id(&key) else {
                discard(self.store.as_ref(), &key, &"malformed chunk key").await?;
                continue;
            };
            match serde_json::from_value(value) {
                Ok(chunk) => return Ok(Some((id, chunk))),
                Err(e) => discard(self.store.as_ref(), &key, &e).await?,
            }
        }
        Ok(None)
    }

    pub async fn get(&self, id: &ChunkId) -> Result<Option<Chunk>, StoreError> {
        get_json(self.store.as_ref(), &keys::chunk(id)).await
    }

    /// Persist a chunk in place (same key).
    pub async fn put(&self, id: &ChunkId, chunk: &Chunk) -> Result<(), StoreError> {
        put_json(self.store.as_ref(), &keys::chunk(id), chunk).await
    }

    pub async fn remove(&self, id: &ChunkId) -> Result<bool, StoreError> {
        self.store.delete(&keys::chunk(id)).await
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        self.store.count(keys::CHUNK_PREFIX).await
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }
}

/// Provider input for one chunk: one embeddings request per article.
///
/// Articles with blank text are skipped. Returns `None` when nothing is left.
pub fn build_request_jsonl(chunk: &Chunk, model: &str) -> Option<String> {
    let mut body = String::new();
    for article in &chunk.articles {
        if article.text.trim().is_empty() {
            debug!(article_id = %article.article_id, "skipping article without text");
            continue;
        }
        let custom_id = CorrelationId::new(article.article_id.clone(), chunk.owner_id.clone());
        let line = serde_json::json!({
            "custom_id": custom_id.encode(),
            "method": "POST",
            "url": "/v1/embeddings",
            "body": { "model": model, "input": article.text },
        });
        body.push_str(&line.to_string());
        body.push('\n');
    }
    (!body.is_empty()).then_some(body)
}

pub fn upload_name(index: u32, now: DateTime<Utc>) -> String {
    format!("articles_chunk{index}_{}.jsonl", now.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::ArticleInput;
    use crate::store::InMemoryDurableStore;
    use curator_core::{ArticleId, OwnerId};

    fn chunk(index: u32, texts: &[&str]) -> Chunk {
        Chunk {
            index,
            articles: texts
                .iter()
                .enumerate()
                .map(|(i, t)| ArticleInput {
                    article_id: ArticleId::new(format!("a{index}-{i}")).unwrap(),
                    text: t.to_string(),
                })
                .collect(),
            retry_count: 0,
            owner_id: None,
        }
    }

    #[tokio::test]
    async fn oldest_follows_enqueue_order() {
        let queue = ChunkQueue::new(Arc::new(InMemoryDurableStore::new()));
        let ids = queue
            .enqueue(vec![chunk(0, &["x"]), chunk(1, &["y"]), chunk(2, &["z"])])
            .await
            .unwrap();

        let (id, first) = queue.oldest().await.unwrap().unwrap();
        assert_eq!(id, ids[0]);
        assert_eq!(first.index, 0);

        queue.remove(&id).await.unwrap();
        let (id, next) = queue.oldest().await.unwrap().unwrap();
        assert_eq!(id, ids[1]);
        assert_eq!(next.index, 1);
        assert_eq!(queue.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn oldest_skips_past_undecodable_chunks() {
        let store = Arc::new(InMemoryDurableStore::new());
        store
            .put("chunk:00000000-0000-7000-8000-000000000000", serde_json::json!(42))
            .await
            .unwrap();
        store.put("chunk:-malformed", serde_json::json!({})).await.unwrap();
        let queue = ChunkQueue::new(store.clone());
        let ids = queue.enqueue(vec![chunk(0, &["x"])]).await.unwrap();

        let (id, oldest) = queue.oldest().await.unwrap().unwrap();
        assert_eq!(id, ids[0]);
        assert_eq!(oldest.index, 0);
        assert_eq!(queue.len().await.unwrap(), 1);
        assert!(store.get("chunk:-malformed").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn enqueue_resets_retry_count() {
        let queue = ChunkQueue::new(Arc::new(InMemoryDurableStore::new()));
        let mut c = chunk(0, &["x"]);
        c.retry_count = 7;
        let ids = queue.enqueue(vec![c]).await.unwrap();
        assert_eq!(queue.get(&ids[0]).await.unwrap().unwrap().retry_count, 0);
    }

    #[test]
    fn request_lines_carry_the_correlation_id() {
        let mut c = chunk(3, &["first", "   ", "third"]);
        c.owner_id = Some(OwnerId::new("u9").unwrap());

        let body = build_request_jsonl(&c, "text-embedding-3-small").unwrap();
        let lines: Vec<serde_json::Value> = body
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["url"], "/v1/embeddings");
        assert_eq!(lines[0]["body"]["model"], "text-embedding-3-small");
        assert_eq!(lines[1]["body"]["input"], "third");
        let custom: CorrelationId =
            serde_json::from_str(lines[1]["custom_id"].as_str().unwrap()).unwrap();
        assert_eq!(custom.article_id.as_str(), "a3-2");
        assert_eq!(custom.user_id.unwrap().as_str(), "u9");
    }

    #[test]
    fn blank_chunks_produce_no_body() {
        assert!(build_request_jsonl(&chunk(0, &["", "  "]), "m").is_none());
    }

    #[test]
    fn upload_names_embed_index_and_time() {
        let at = DateTime::<Utc>::from_timestamp_millis(1_750_597_260_970).unwrap();
        assert_eq!(upload_name(0, at), "articles_chunk0_1750597260970.jsonl");
    }
}
