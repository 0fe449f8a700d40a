//! Ingestion pipeline: raw records in, immutable snapshot out.
//!
//! Embedding requests are the only slow part, so batches are requested with
//! bounded concurrency while the indexes themselves are filled by a single
//! writer, one batch at a time and in batch order.

use crate::bm25::SparseIndex;
use crate::config::{RetryPolicy, SearchConfig};
use crate::embedding::EmbeddingProvider;
use crate::error::{EmbeddingError, SourceError};
use crate::hnsw::DenseIndex;
use crate::index::{DocId, Document, DocumentStore};
use crate::snapshot::Snapshot;
use crate::source::RawIssue;
use crate::tokenizer::Analyzer;
use crate::{Error, Result};
use futures::stream::{self, StreamExt};
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// Counts of what made it into the snapshot and what did not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub documents_indexed: usize,
    /// Source records rejected before indexing (unparseable or malformed).
    pub skipped_records: usize,
    pub sparse_indexed: usize,
    pub dense_indexed: usize,
    /// Batches whose embedding request kept failing after every retry.
    pub failed_batches: usize,
    /// Documents left out of the dense index for any reason.
    pub dense_omitted: usize,
    /// Documents the provider rejected individually, or returned a wrong-sized vector for.
    pub invalid_documents: usize,
}

impl fmt::Display for BuildReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "indexed={} sparse={} dense={} skipped_records={} failed_batches={} dense_omitted={} invalid_documents={}",
            self.documents_indexed,
            self.sparse_indexed,
            self.dense_indexed,
            self.skipped_records,
            self.failed_batches,
            self.dense_omitted,
            self.invalid_documents
        )
    }
}

/// Aborts a running build at the next batch boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self { Self::default() }

    pub fn cancel(&self) { self.0.store(true, Ordering::SeqCst); }

    pub fn is_cancelled(&self) -> bool { self.0.load(Ordering::SeqCst) }
}

/// Turns raw records into documents with sequential ids. Bad records are logged and
/// counted, never fatal.
pub fn ingest<I>(records: I) -> (Vec<Document>, usize)
where
    I: IntoIterator<Item = std::result::Result<RawIssue, SourceError>>,
{
    let mut docs = Vec::new();
    let mut skipped = 0usize;
    for (n, record) in records.into_iter().enumerate() {
        match record.and_then(|raw| raw.into_document(docs.len() as DocId)) {
            Ok(doc) => docs.push(doc),
            Err(e) => {
                skipped += 1;
                warn!(record = n, error = %e, "skipping source record");
            }
        }
    }
    (docs, skipped)
}

/// Per-document outcome of one embedding batch.
struct BatchEmbedding {
    vectors: Vec<std::result::Result<Vec<f32>, EmbeddingError>>,
    batch_failed: bool,
}

async fn embed_with_retry(
    embedder: &dyn EmbeddingProvider,
    texts: &[String],
    retry: RetryPolicy,
) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
    let mut attempt = 0u32;
    loop {
        let err = match embedder.embed_batch(texts).await {
            Ok(vectors) if vectors.len() == texts.len() => return Ok(vectors),
            Ok(vectors) => EmbeddingError::Transient(format!("expected {} vectors, got {}", texts.len(), vectors.len())),
            Err(e) => e,
        };
        attempt += 1;
        if !err.is_retryable() || attempt >= retry.max_attempts {
            return Err(err);
        }
        let delay = retry.backoff_ms(attempt - 1);
        warn!(attempt, delay_ms = delay, error = %err, "embedding request failed, retrying");
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
}

async fn embed_batch(embedder: &dyn EmbeddingProvider, texts: Vec<String>, retry: RetryPolicy) -> BatchEmbedding {
    match embed_with_retry(embedder, &texts, retry).await {
        Ok(vectors) => BatchEmbedding { vectors: vectors.into_iter().map(Ok).collect(), batch_failed: false },
        Err(EmbeddingError::InvalidInput(reason)) => {
            // Something in the batch was rejected: ask again one document at a time so
            // only the offending documents are lost.
            debug!(%reason, size = texts.len(), "batch rejected, embedding documents individually");
            let mut vectors = Vec::with_capacity(texts.len());
            for text in &texts {
                let single = embed_with_retry(embedder, std::slice::from_ref(text), retry)
                    .await
                    .and_then(|v| v.into_iter().next().ok_or_else(|| EmbeddingError::Transient("empty response".into())));
                vectors.push(single);
            }
            BatchEmbedding { vectors, batch_failed: false }
        }
        Err(e) => BatchEmbedding { vectors: texts.iter().map(|_| Err(e.clone())).collect(), batch_failed: true },
    }
}

pub struct IndexBuilder {
    embedder: Arc<dyn EmbeddingProvider>,
    config: SearchConfig,
    cancel: CancelHandle,
}

impl IndexBuilder {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, config: SearchConfig) -> Self {
        Self { embedder, config, cancel: CancelHandle::new() }
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle { self.cancel.clone() }

    /// Ingest raw records, then build.
    pub async fn build_from_records<I>(&self, records: I) -> Result<(Snapshot, BuildReport)>
    where
        I: IntoIterator<Item = std::result::Result<RawIssue, SourceError>>,
    {
        let (docs, skipped) = ingest(records);
        let (snapshot, mut report) = self.build(docs).await?;
        report.skipped_records = skipped;
        if skipped > 0 {
            warn!(skipped_records = skipped, "some source records were rejected during ingestion");
        }
        Ok((snapshot, report))
    }

    /// Build both indexes over `documents`, whose ids must run 0, 1, 2, ...
    pub async fn build(&self, documents: Vec<Document>) -> Result<(Snapshot, BuildReport)> {
        self.config.validate()?;
        let dimension = self.embedder.dimension();
        let analyzer = Analyzer::new(self.config.analyzer);
        let retry = self.config.build.retry;
        let batch_size = self.config.build.batch_size;

        let mut store = DocumentStore::new();
        for doc in documents {
            store.push(doc)?;
        }
        let mut sparse = SparseIndex::new(self.config.bm25);
        let mut dense = DenseIndex::new(dimension, self.config.hnsw);
        let mut report = BuildReport { documents_indexed: store.len(), ..BuildReport::default() };

        let total = store.len();
        let batches: Vec<Range<usize>> = (0..total).step_by(batch_size).map(|s| s..(s + batch_size).min(total)).collect();
        info!(documents = total, batches = batches.len(), embedder = %self.embedder.name(), dimension, "starting index build");

        let embedder = self.embedder.as_ref();
        let store_ref = &store;
        let mut pending = stream::iter(batches)
            .map(move |range| {
                let texts: Vec<String> = range
                    .clone()
                    .filter_map(|id| store_ref.get(id as DocId).map(Document::embedding_text))
                    .collect();
                async move { (range, embed_batch(embedder, texts, retry).await) }
            })
            .buffered(self.config.build.concurrency);

        let mut batch_no = 0usize;
        while let Some((range, embedded)) = pending.next().await {
            if self.cancel.is_cancelled() {
                warn!(batch = batch_no, "index build cancelled, discarding partial indexes");
                return Err(Error::Cancelled);
            }
            let batch_failed = embedded.batch_failed;
            if batch_failed {
                report.failed_batches += 1;
                warn!(batch = batch_no, first_doc = range.start, size = range.len(), "embedding failed for batch, documents omitted from dense index");
            }
            for (id, vector) in range.clone().zip(embedded.vectors) {
                let id = id as DocId;
                if let Some(doc) = store_ref.get(id) {
                    sparse.add(id, &analyzer.analyze(&doc.indexed_text()))?;
                    report.sparse_indexed += 1;
                }
                match vector {
                    Ok(v) if v.len() == dimension => {
                        dense.add(id, v)?;
                        report.dense_indexed += 1;
                    }
                    Ok(v) => {
                        report.invalid_documents += 1;
                        report.dense_omitted += 1;
                        warn!(doc_id = id, expected = dimension, actual = v.len(), "embedding has the wrong dimension");
                    }
                    Err(e) => {
                        report.dense_omitted += 1;
                        if matches!(e, EmbeddingError::InvalidInput(_)) {
                            report.invalid_documents += 1;
                            warn!(doc_id = id, error = %e, "provider rejected document, omitted from dense index");
                        } else if !batch_failed {
                            warn!(doc_id = id, error = %e, "embedding failed for document, omitted from dense index");
                        }
                    }
                }
            }
            debug!(batch = batch_no, indexed = report.sparse_indexed, embedded = report.dense_indexed, "batch indexed");
            batch_no += 1;
        }
        drop(pending);

        let snapshot = Snapshot {
            analyzer,
            store,
            sparse,
            dense,
            fusion: self.config.fusion,
            embedder: self.embedder.name(),
            created_at: OffsetDateTime::now_utc(),
        };
        info!(%report, "index build complete");
        Ok((snapshot, report))
    }
}
