//! # Question/answer deduplication
//!
//! [`DedupService`] ties an [`Embedder`], a [`SimilarityStore`] and the local [`QaArchive`]
//! together. Its main entry point, [`DedupService::store_if_new`], runs two independent paths for
//! every completed exchange:
//!
//! 1. **Index path**: embed the question, look at the five nearest `qa_pair` points, and compare
//!    their `question`/`answer` payloads to the input by exact string equality. Nothing is
//!    written when one matches. Otherwise the answer is embedded too and a new point keyed by
//!    the question's vector is upserted.
//! 2. **Archive path**: append the pair to `que_ans.json`, duplicate or not.
//!
//! The two paths can disagree: a pair can be archived but missing from the index (index path
//! failed) or indexed but missing from the archive (archive write failed after the upsert).
//! [`StoreReport`] carries both outcomes so the caller sees each failure.
//!
//! A failed similarity search never counts as "not a duplicate": the index path stops and the
//! error is reported.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::archive::{QaArchive, QaPair};
use crate::embedder::Embedder;
use crate::error::{ArchiveError, AskAiError, EmbeddingError, StoreError};
use crate::store::{Payload, PayloadFilter, ScoredPoint, SimilarityStore};

/// Payload `type` of every question/answer point.
pub const QA_PAIR_TYPE: &str = "qa_pair";

/// How many neighbours the duplicate check inspects.
pub const DEDUP_CANDIDATES: usize = 5;

/// Result of the index path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOutcome {
    /// A new point was written.
    Stored { id: String },
    /// An identical pair is already indexed; nothing was written.
    AlreadyExists,
}

/// Outcome of both persistence paths for one pair.
#[derive(Debug)]
pub struct StoreReport {
    pub index: Result<IndexOutcome, AskAiError>,
    /// Entry count after the append.
    pub archive: Result<usize, ArchiveError>,
}

impl StoreReport {
    pub fn is_ok(&self) -> bool {
        self.index.is_ok() && self.archive.is_ok()
    }

    /// One status line for the user.
    pub fn summary(&self) -> String {
        let index = match &self.index {
            Ok(IndexOutcome::Stored { .. }) => "indexed".to_string(),
            Ok(IndexOutcome::AlreadyExists) => "already indexed".to_string(),
            Err(e) => format!("index failed: {e}"),
        };
        let archive = match &self.archive {
            Ok(n) => format!("archived ({n} entries)"),
            Err(e) => format!("archive failed: {e}"),
        };
        format!("{index}; {archive}")
    }
}

/// Counters from [`DedupService::reindex_archive`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReindexSummary {
    pub total: usize,
    pub stored: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct DedupService {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn SimilarityStore>,
    archive: Arc<QaArchive>,
}

impl DedupService {
    /// # Errors
    ///
    /// Refuses an embedder whose vectors would not fit the store's collection.
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn SimilarityStore>,
        archive: Arc<QaArchive>,
    ) -> Result<Self, AskAiError> {
        if embedder.dimension() != store.dimension() {
            return Err(EmbeddingError::DimensionMismatch {
                expected: store.dimension(),
                actual: embedder.dimension(),
            }
            .into());
        }
        Ok(Self {
            embedder,
            store,
            archive,
        })
    }

    /// Create the collection if needed.
    pub async fn ensure_ready(&self) -> Result<(), StoreError> {
        self.store.ensure_collection(self.store.dimension()).await
    }

    pub fn store(&self) -> &Arc<dyn SimilarityStore> {
        &self.store
    }

    pub fn archive(&self) -> &Arc<QaArchive> {
        &self.archive
    }

    /// Index the pair if it is new, then append it to the archive regardless.
    pub async fn store_if_new(&self, question: &str, answer: &str) -> StoreReport {
        let index = self.index_if_new(question, answer).await;
        if let Err(e) = &index {
            error!(error = %e, question, "index path failed, pair only archived");
        }

        let archive = self.archive.append(QaPair::new(question, answer)).await;
        if let Err(e) = &archive {
            error!(error = %e, question, "archive append failed");
        }

        StoreReport { index, archive }
    }

    /// The index path alone: dedup-check then upsert.
    pub async fn index_if_new(
        &self,
        question: &str,
        answer: &str,
    ) -> Result<IndexOutcome, AskAiError> {
        let question_vector = self.embedder.embed(question).await?;

        if let Some(existing) = self
            .find_duplicate(question, answer, &question_vector)
            .await?
        {
            info!(point_id = %existing.id, question, "pair already indexed");
            return Ok(IndexOutcome::AlreadyExists);
        }

        // Computed for parity with the stored question vector; only the question's is persisted.
        let answer_vector = self.embedder.embed(answer).await?;
        debug!(dimension = answer_vector.len(), "embedded answer");

        let id = Uuid::new_v4().to_string();
        let mut payload = Payload::new();
        payload.insert("type".into(), QA_PAIR_TYPE.into());
        payload.insert("question".into(), question.into());
        payload.insert("answer".into(), answer.into());
        payload.insert(
            "stored_at".into(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        payload.insert("vector_type".into(), "question".into());

        self.store.upsert(&id, question_vector, payload).await?;
        info!(point_id = %id, collection = self.store.collection(), "stored new pair");
        Ok(IndexOutcome::Stored { id })
    }

    /// Scan the nearest `qa_pair` points for an exact `(question, answer)` match.
    ///
    /// Scores are ignored; the embedding only narrows the candidates.
    pub async fn find_duplicate(
        &self,
        question: &str,
        answer: &str,
        question_vector: &[f32],
    ) -> Result<Option<ScoredPoint>, StoreError> {
        let filter = PayloadFilter::new("type", QA_PAIR_TYPE);
        let candidates = self
            .store
            .search(question_vector, DEDUP_CANDIDATES, Some(&filter))
            .await?;

        Ok(candidates.into_iter().find(|c| {
            c.payload.get("question").map(String::as_str) == Some(question)
                && c.payload.get("answer").map(String::as_str) == Some(answer)
        }))
    }

    /// Indexed pairs whose questions are closest to `query`.
    pub async fn search_similar(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>, AskAiError> {
        let vector = self.embedder.embed(query).await?;
        let filter = PayloadFilter::new("type", QA_PAIR_TYPE);
        Ok(self.store.search(&vector, limit, Some(&filter)).await?)
    }

    /// Run the index path for every archived pair, in archive order.
    ///
    /// Entries with an empty question or answer are skipped. The archive itself is not touched.
    /// `progress` is called once per entry with the 1-based position.
    ///
    /// # Errors
    ///
    /// Only a failure to read the archive aborts the run; per-entry failures are counted.
    pub async fn reindex_archive<F>(&self, mut progress: F) -> Result<ReindexSummary, AskAiError>
    where
        F: FnMut(usize, usize),
    {
        let file = self.archive.snapshot().await?;
        let mut summary = ReindexSummary {
            total: file.qas.len(),
            ..Default::default()
        };

        for (i, qa) in file.qas.iter().enumerate() {
            progress(i + 1, summary.total);

            if qa.question.is_empty() || qa.answer.is_empty() {
                warn!(index = i, "skipping empty archive entry");
                summary.skipped += 1;
                continue;
            }

            match self.index_if_new(&qa.question, &qa.answer).await {
                Ok(IndexOutcome::Stored { .. }) => summary.stored += 1,
                Ok(IndexOutcome::AlreadyExists) => summary.duplicates += 1,
                Err(e) => {
                    error!(index = i, error = %e, "failed to index archive entry");
                    summary.failed += 1;
                }
            }
        }

        info!(
            total = summary.total,
            stored = summary.stored,
            duplicates = summary.duplicates,
            skipped = summary.skipped,
            failed = summary.failed,
            "reindex finished"
        );
        Ok(summary)
    }
}
