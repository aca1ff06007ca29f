//! Dual-scope retrieval over the vector index.
//!
//! One chat turn embeds the query once and runs two searches in parallel:
//! general knowledge (untagged rows) and documents uploaded into the
//! current conversation. Either search failing fails the whole retrieval,
//! so an answer is never built from half the evidence.

use std::sync::Arc;

use crate::config::{EmbeddingConfig, RetrievalConfig};
use crate::embedding::{self, EmbeddingProvider};
use crate::error::{ChatError, Result};
use crate::models::VectorMatch;
use crate::vector::{VectorIndex, VectorScope};

/// Matches retrieved for one chat turn, by scope.
#[derive(Debug, Default)]
pub struct RetrievedContext {
    pub general: Vec<VectorMatch>,
    pub user_documents: Vec<VectorMatch>,
}

pub struct RetrievalEngine {
    index: Arc<dyn VectorIndex>,
    provider: Arc<dyn EmbeddingProvider>,
    embedding: EmbeddingConfig,
    retrieval: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        provider: Arc<dyn EmbeddingProvider>,
        embedding: EmbeddingConfig,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            index,
            provider,
            embedding,
            retrieval,
        }
    }

    /// Retrieve context for a chat turn: top general matches plus top
    /// matches among the conversation's uploads. All-or-nothing.
    pub async fn retrieve(
        &self,
        query: &str,
        conversation_id: &str,
    ) -> Result<RetrievedContext> {
        if query.trim().is_empty() {
            return Err(ChatError::validation("query must not be empty"));
        }

        // Without an embedding provider there is nothing to search; the
        // turn proceeds on conversation history alone.
        if !self.embedding.is_enabled() {
            return Ok(RetrievedContext::default());
        }

        let vector = embedding::embed_query(self.provider.as_ref(), &self.embedding, query).await?;

        let conversation_scope = VectorScope::Conversation(conversation_id.to_string());
        let (general, user_documents) = tokio::try_join!(
            self.index
                .query(&vector, self.retrieval.general_top_k, &VectorScope::General),
            self.index
                .query(&vector, self.retrieval.conversation_top_k, &conversation_scope),
        )?;

        Ok(RetrievedContext {
            general,
            user_documents,
        })
    }

    /// Standalone document search within one conversation's uploads.
    pub async fn search_documents(
        &self,
        query: &str,
        conversation_id: &str,
        top_k: Option<usize>,
    ) -> Result<Vec<VectorMatch>> {
        if query.trim().is_empty() {
            return Err(ChatError::validation("query must not be empty"));
        }
        let top_k = top_k.unwrap_or(self.retrieval.search_top_k);

        let vector = embedding::embed_query(self.provider.as_ref(), &self.embedding, query).await?;
        self.index
            .query(
                &vector,
                top_k,
                &VectorScope::Conversation(conversation_id.to_string()),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::DisabledProvider;
    use crate::models::{VectorMetadata, VectorRecord};
    use crate::vector::SqliteVectorIndex;
    use crate::{db, migrate};
    use async_trait::async_trait;

    /// Index stub whose general-scope queries always fail.
    struct FailingGeneralIndex(SqliteVectorIndex);

    #[async_trait]
    impl VectorIndex for FailingGeneralIndex {
        async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
            self.0.upsert(records).await
        }
        async fn query(
            &self,
            vector: &[f32],
            top_k: usize,
            scope: &VectorScope,
        ) -> Result<Vec<VectorMatch>> {
            if *scope == VectorScope::General {
                return Err(ChatError::upstream(anyhow::anyhow!("index offline")));
            }
            self.0.query(vector, top_k, scope).await
        }
        async fn delete_many(&self, ids: &[String]) -> Result<()> {
            self.0.delete_many(ids).await
        }
        async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
            self.0.delete_conversation(conversation_id).await
        }
    }

    /// Provider stub with fixed dims; paired with an embedding config that
    /// never reaches the network because the query path is pre-failed or
    /// validation rejects the input first.
    fn engine(index: Arc<dyn VectorIndex>) -> RetrievalEngine {
        RetrievalEngine::new(
            index,
            Arc::new(DisabledProvider),
            EmbeddingConfig::default(),
            RetrievalConfig::default(),
        )
    }

    fn record(id: &str, conversation: Option<&str>) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            embedding: vec![1.0, 0.0],
            metadata: VectorMetadata {
                conversation_id: conversation.map(str::to_string),
                source: format!("{id}.txt"),
                doc_type: None,
                chunk_index: 0,
                chunk_total: 1,
                text: id.to_string(),
                ingested_at: 0,
            },
        }
    }

    #[tokio::test]
    async fn empty_query_rejected_before_any_embedding() {
        let pool = db::connect_memory().await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let engine = engine(Arc::new(SqliteVectorIndex::new(pool)));

        let err = engine.retrieve("   ", "conv-1").await.unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));

        let err = engine
            .search_documents("", "conv-1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[tokio::test]
    async fn disabled_provider_yields_empty_context() {
        let pool = db::connect_memory().await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let engine = engine(Arc::new(SqliteVectorIndex::new(pool)));

        let retrieved = engine.retrieve("anything at all", "conv-1").await.unwrap();
        assert!(retrieved.general.is_empty());
        assert!(retrieved.user_documents.is_empty());
    }

    #[tokio::test]
    async fn one_failed_scope_fails_the_whole_retrieval() {
        let pool = db::connect_memory().await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let inner = SqliteVectorIndex::new(pool);
        inner
            .upsert(&[record("conv-doc", Some("conv-1"))])
            .await
            .unwrap();
        let failing = Arc::new(FailingGeneralIndex(inner));

        // Drive try_join directly so no real embedding call is needed
        let vector = vec![1.0, 0.0];
        let scope = VectorScope::Conversation("conv-1".to_string());
        let result = tokio::try_join!(
            failing.query(&vector, 3, &VectorScope::General),
            failing.query(&vector, 3, &scope),
        );
        assert!(matches!(result, Err(ChatError::Upstream(_))));
    }
}
