//! Document ingestion: extract, chunk, embed, upsert.
//!
//! Two paths share the tail of the pipeline. Uploads are tagged with the
//! owning conversation and chunked contiguously; the offline knowledge
//! base is untagged, uses overlapping chunks, and keeps a content-hash
//! ledger so re-running ingestion skips unchanged files.
//!
//! Ingestion is not atomic: a failure partway through leaves earlier
//! batches in the index. Record ids are deterministic, so re-ingesting
//! the same file overwrites rather than duplicates.

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::chunk;
use crate::config::Config;
use crate::embedding::{self, EmbeddingProvider};
use crate::error::{ChatError, Result};
use crate::extract::{self, DocumentType};
use crate::models::{VectorMetadata, VectorRecord};
use crate::vector::VectorIndex;

/// Outcome of ingesting one document.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub source: String,
    pub doc_type: String,
    pub chunk_count: usize,
    pub metadata: serde_json::Value,
}

/// Ingest an uploaded file into one conversation's document scope.
///
/// The file's signature is checked against its claimed type before any
/// parsing. Chunks are embedded in batches with bounded concurrency and
/// upserted under ids derived from the conversation, filename, chunk
/// index, and content hash.
pub async fn ingest_upload(
    config: &Config,
    index: &dyn VectorIndex,
    provider: &dyn EmbeddingProvider,
    bytes: &[u8],
    original_name: &str,
    conversation_id: &str,
) -> Result<IngestReport> {
    let doc_type = DocumentType::from_extension(original_name).ok_or_else(|| {
        ChatError::validation(format!("unsupported file type: {original_name}"))
    })?;

    extract::verify_signature(bytes, doc_type)?;
    let extracted = extract::extract_document(bytes, doc_type)?;

    let chunks = chunk::split_upload(&extracted.text, config.chunking.upload_max_chars);
    if chunks.is_empty() {
        return Err(ChatError::validation(
            "document contains no extractable text",
        ));
    }

    let hash = content_hash(bytes);
    let records = build_records(
        &chunks,
        provider,
        &config.embedding,
        |i| format!("{conversation_id}:{original_name}:{i}:{hash}"),
        VectorTag {
            conversation_id: Some(conversation_id.to_string()),
            source: original_name.to_string(),
            doc_type: Some(doc_type.as_str().to_string()),
        },
    )
    .await?;

    index.upsert(&records).await?;
    info!(
        source = original_name,
        conversation_id = %conversation_id,
        chunks = records.len(),
        "upload ingested"
    );

    Ok(IngestReport {
        source: original_name.to_string(),
        doc_type: doc_type.as_str().to_string(),
        chunk_count: records.len(),
        metadata: extracted.metadata,
    })
}

/// Ingest a directory tree of text files into the shared knowledge base.
///
/// Files already in the content-hash ledger are skipped. Returns the
/// number of files ingested (not skipped).
pub async fn ingest_knowledge_dir(
    config: &Config,
    pool: &SqlitePool,
    index: &dyn VectorIndex,
    provider: Arc<dyn EmbeddingProvider>,
    dir: &Path,
) -> anyhow::Result<usize> {
    let mut ingested = 0usize;

    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.with_context(|| format!("walking {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        let is_plain = matches!(ext.as_str(), "md" | "txt");
        let binary_type = DocumentType::from_extension(&path.to_string_lossy());
        if !is_plain && binary_type.is_none() {
            continue;
        }

        let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let hash = content_hash(&bytes);

        let seen: Option<(String,)> =
            sqlx::query_as("SELECT content_hash FROM kb_documents WHERE content_hash = ?")
                .bind(&hash)
                .fetch_optional(pool)
                .await?;
        if seen.is_some() {
            debug!(path = %path.display(), "unchanged, skipping");
            continue;
        }

        let text = match binary_type {
            Some(ty) => {
                extract::extract_document(&bytes, ty)
                    .map_err(|e| anyhow!("{}: {e}", path.display()))?
                    .text
            }
            None => String::from_utf8_lossy(&bytes).into_owned(),
        };
        let relative = path
            .strip_prefix(dir)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string();

        let chunks = chunk::split_knowledge(
            &text,
            config.chunking.kb_max_chars,
            config.chunking.kb_overlap_chars,
        );
        if chunks.is_empty() {
            continue;
        }

        let records = build_records(
            &chunks,
            provider.as_ref(),
            &config.embedding,
            |i| format!("kb:{relative}:{i}:{hash}"),
            VectorTag {
                conversation_id: None,
                source: relative.clone(),
                doc_type: None,
            },
        )
        .await
        .map_err(|e| anyhow!("{}: {e}", path.display()))?;

        index
            .upsert(&records)
            .await
            .map_err(|e| anyhow!("{}: {e}", path.display()))?;

        sqlx::query(
            "INSERT OR REPLACE INTO kb_documents (content_hash, source, ingested_at) VALUES (?, ?, ?)",
        )
        .bind(&hash)
        .bind(&relative)
        .bind(chrono::Utc::now().timestamp())
        .execute(pool)
        .await?;

        info!(source = %relative, chunks = records.len(), "knowledge file ingested");
        ingested += 1;
    }

    Ok(ingested)
}

struct VectorTag {
    conversation_id: Option<String>,
    source: String,
    doc_type: Option<String>,
}

/// Embed chunks in batches with bounded concurrency, preserving chunk
/// order, and pair them with their metadata.
async fn build_records(
    chunks: &[String],
    provider: &dyn EmbeddingProvider,
    embedding_config: &crate::config::EmbeddingConfig,
    id_for: impl Fn(usize) -> String,
    tag: VectorTag,
) -> Result<Vec<VectorRecord>> {
    let batches: Vec<Vec<String>> = chunks
        .chunks(embedding_config.batch_size)
        .map(|b| b.to_vec())
        .collect();

    // buffered() yields in submission order, so embeddings line up with
    // chunk indices even when batches finish out of order.
    let embedded: Vec<Result<Vec<Vec<f32>>>> = futures::stream::iter(batches)
        .map(|batch| async move { embedding::embed_texts(provider, embedding_config, &batch).await })
        .buffered(embedding_config.concurrency.max(1))
        .collect()
        .await;

    let mut vectors = Vec::with_capacity(chunks.len());
    for batch in embedded {
        vectors.extend(batch?);
    }
    if vectors.len() != chunks.len() {
        return Err(ChatError::upstream(anyhow!(
            "embedding count mismatch: got {}, expected {}",
            vectors.len(),
            chunks.len()
        )));
    }

    let now = chrono::Utc::now().timestamp();
    let total = chunks.len() as i64;
    Ok(chunks
        .iter()
        .zip(vectors)
        .enumerate()
        .map(|(i, (text, embedding))| VectorRecord {
            id: id_for(i),
            embedding,
            metadata: VectorMetadata {
                conversation_id: tag.conversation_id.clone(),
                source: tag.source.clone(),
                doc_type: tag.doc_type.clone(),
                chunk_index: i as i64,
                chunk_total: total,
                text: text.clone(),
                ingested_at: now,
            },
        })
        .collect())
}

/// First 8 hex chars of the SHA-256 of the file bytes.
fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..8].to_string()
}
