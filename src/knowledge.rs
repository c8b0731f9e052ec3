//! Knowledge Store: persisted research results with lexical and hybrid
//! (lexical + semantic) lookup.
//!
//! Lexical search runs through the FTS5 index with the query column
//! weighted above the answer column. Semantic search compares the stored
//! 768-dim embeddings by cosine similarity. Hybrid search merges both
//! channels, boosts results found in both, clamps to [0,1] and sorts.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::db::DbHandle;
use crate::errors::StoreError;
use crate::llm::{ChatModel, ChatRequest};
use crate::model::ResearchResult;

/// Dimensionality of the stored embeddings.
pub const EMBEDDING_DIM: usize = 768;

/// Answers longer than this are summarized before embedding.
const SUMMARIZE_OVER: usize = 28_000;

/// Channel weights for hybrid scoring.
#[derive(Debug, Clone, Copy)]
pub struct HybridWeights {
    pub semantic: f64,
    pub full_text: f64,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            semantic: 0.7,
            full_text: 0.3,
        }
    }
}

/// One prior-research match with its combined score.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeMatch {
    pub id: Uuid,
    pub query: String,
    pub answer: String,
    pub score: f64,
}

pub struct KnowledgeStore {
    db: DbHandle,
    model: Arc<dyn ChatModel>,
}

impl KnowledgeStore {
    pub fn new(db: DbHandle, model: Arc<dyn ChatModel>) -> Self {
        Self { db, model }
    }

    /// Persist a research result, then attach its embedding in a follow-up
    /// update. Embedding failure is non-fatal: the row stays, embedding
    /// NULL, eligible for a later backfill pass.
    pub async fn save(&self, result: &ResearchResult) -> Result<(), StoreError> {
        let sources = serde_json::to_string(&result.sources)?;
        let metadata = serde_json::to_string(&result.metadata)?;
        let confidence = result
            .confidence
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO research_results
                 (id, log_id, plan_id, query, answer, sources, metadata, confidence, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    result.id.to_string(),
                    result.log_id.to_string(),
                    result.plan_id.to_string(),
                    result.query,
                    result.answer,
                    sources,
                    metadata,
                    confidence,
                    result.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;

        match self.embed_result(&result.query, &result.answer).await {
            Ok(embedding) => self.write_embedding(result.id, &embedding)?,
            Err(err) => {
                warn!(result_id = %result.id, error = %err,
                    "embedding failed; row saved without embedding");
            }
        }
        Ok(())
    }

    /// The persisted result for a session, if one exists.
    pub fn find_by_log_id(&self, log_id: Uuid) -> Result<Option<ResearchResult>, StoreError> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, log_id, plan_id, query, answer, sources, metadata, confidence, created_at
                 FROM research_results WHERE log_id = ?1 ORDER BY created_at DESC LIMIT 1",
            )?;
            let mut rows = stmt.query_map(params![log_id.to_string()], read_result_row)?;
            match rows.next() {
                Some(row) => Ok(Some(row?.into_result()?)),
                None => Ok(None),
            }
        })
    }

    /// Lexical lookup over prior research, query column weighted above the
    /// answer column, ordered by rank.
    pub fn search_prior_research(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<KnowledgeMatch>, StoreError> {
        let candidates = self.full_text_candidates(query, max_results)?;
        Ok(candidates
            .into_iter()
            .map(|c| KnowledgeMatch {
                id: c.id,
                query: c.query,
                answer: c.answer,
                score: c.score,
            })
            .collect())
    }

    /// Hybrid lookup: semantic and full-text channels each fetch twice the
    /// requested count, merge by id, weight, boost dual-channel hits by
    /// 1.1x, clamp to [0,1], sort descending, truncate.
    pub async fn search_hybrid(
        &self,
        query: &str,
        max_results: usize,
        weights: HybridWeights,
    ) -> Result<Vec<KnowledgeMatch>, StoreError> {
        let query_embedding = self
            .model
            .embed(query)
            .await
            .map_err(StoreError::Embedding)?;

        let fetch = max_results * 2;
        let semantic = self.semantic_candidates(&query_embedding, fetch)?;
        let full_text = self.full_text_candidates(query, fetch)?;

        let mut merged: Vec<KnowledgeMatch> = Vec::new();
        for c in &semantic {
            let ft = full_text.iter().find(|f| f.id == c.id);
            let mut score = c.score * weights.semantic
                + ft.map(|f| f.score).unwrap_or(0.0) * weights.full_text;
            if ft.is_some() {
                score *= 1.1;
            }
            merged.push(KnowledgeMatch {
                id: c.id,
                query: c.query.clone(),
                answer: c.answer.clone(),
                score: score.clamp(0.0, 1.0),
            });
        }
        for f in &full_text {
            if semantic.iter().any(|c| c.id == f.id) {
                continue;
            }
            merged.push(KnowledgeMatch {
                id: f.id,
                query: f.query.clone(),
                answer: f.answer.clone(),
                score: (f.score * weights.full_text).clamp(0.0, 1.0),
            });
        }

        merged.sort_by(|a, b| b.score.total_cmp(&a.score));
        merged.truncate(max_results);
        Ok(merged)
    }

    /// Embed rows still missing embeddings. Returns how many rows were
    /// processed; running it twice only touches rows the first pass missed.
    pub async fn backfill_embeddings(&self, batch_size: usize) -> Result<usize, StoreError> {
        let pending: Vec<(Uuid, String, String)> = self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, query, answer FROM research_results
                 WHERE embedding IS NULL ORDER BY created_at LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![batch_size as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            let mut pending = Vec::new();
            for row in rows {
                let (id, query, answer) = row?;
                pending.push((parse_uuid(&id)?, query, answer));
            }
            Ok(pending)
        })?;

        let mut processed = 0;
        for (id, query, answer) in pending {
            match self.embed_result(&query, &answer).await {
                Ok(embedding) => {
                    self.write_embedding(id, &embedding)?;
                    processed += 1;
                }
                Err(err) => {
                    warn!(result_id = %id, error = %err, "backfill embedding failed; skipping row");
                }
            }
        }
        Ok(processed)
    }

    // ── Internals ────────────────────────────────────────────────────

    async fn embed_result(
        &self,
        query: &str,
        answer: &str,
    ) -> Result<Vec<f32>, crate::llm::LlmError> {
        let answer_text = if answer.len() > SUMMARIZE_OVER {
            let request = ChatRequest::new(&format!(
                "Summarize the following research answer in at most 2000 words, \
                 keeping all key facts:\n\n{answer}"
            ));
            self.model.chat(request).await?.content
        } else {
            answer.to_string()
        };
        self.model.embed(&format!("{query}\n\n{answer_text}")).await
    }

    fn write_embedding(&self, id: Uuid, embedding: &[f32]) -> Result<(), StoreError> {
        let blob = encode_embedding(embedding);
        self.db.with(|conn| {
            conn.execute(
                "UPDATE research_results SET embedding = ?1 WHERE id = ?2",
                params![blob, id.to_string()],
            )?;
            Ok(())
        })
    }

    fn full_text_candidates(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Candidate>, StoreError> {
        let Some(match_expr) = fts_match_expression(query) else {
            return Ok(Vec::new());
        };
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT r.id, r.query, r.answer, bm25(research_results_fts, 2.0, 1.0) AS rank
                 FROM research_results_fts
                 JOIN research_results r ON r.rowid = research_results_fts.rowid
                 WHERE research_results_fts MATCH ?1
                 ORDER BY rank LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![match_expr, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                ))
            })?;
            let mut candidates = Vec::new();
            for row in rows {
                let (id, query, answer, rank) = row?;
                candidates.push(Candidate {
                    id: parse_uuid(&id)?,
                    query,
                    answer,
                    score: normalize_bm25(rank),
                });
            }
            Ok(candidates)
        })
    }

    fn semantic_candidates(
        &self,
        query_embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<Candidate>, StoreError> {
        let mut candidates = self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, query, answer, embedding FROM research_results
                 WHERE embedding IS NOT NULL",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                ))
            })?;
            let mut candidates = Vec::new();
            for row in rows {
                let (id, query, answer, blob) = row?;
                let embedding = decode_embedding(&blob);
                let score = cosine_similarity(query_embedding, &embedding).max(0.0);
                candidates.push(Candidate {
                    id: parse_uuid(&id)?,
                    query,
                    answer,
                    score,
                });
            }
            Ok(candidates)
        })?;

        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        candidates.truncate(limit);
        Ok(candidates)
    }
}

struct Candidate {
    id: Uuid,
    query: String,
    answer: String,
    score: f64,
}

struct ResultRow {
    id: String,
    log_id: String,
    plan_id: String,
    query: String,
    answer: String,
    sources: String,
    metadata: String,
    confidence: Option<String>,
    created_at: String,
}

fn read_result_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ResultRow> {
    Ok(ResultRow {
        id: row.get(0)?,
        log_id: row.get(1)?,
        plan_id: row.get(2)?,
        query: row.get(3)?,
        answer: row.get(4)?,
        sources: row.get(5)?,
        metadata: row.get(6)?,
        confidence: row.get(7)?,
        created_at: row.get(8)?,
    })
}

impl ResultRow {
    fn into_result(self) -> Result<ResearchResult, StoreError> {
        Ok(ResearchResult {
            id: parse_uuid(&self.id)?,
            log_id: parse_uuid(&self.log_id)?,
            plan_id: parse_uuid(&self.plan_id)?,
            query: self.query,
            answer: self.answer,
            sources: serde_json::from_str(&self.sources)?,
            metadata: serde_json::from_str(&self.metadata)?,
            confidence: self
                .confidence
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            created_at: parse_timestamp(&self.created_at),
        })
    }
}

fn parse_uuid(text: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(text).map_err(|_| {
        StoreError::Database(rusqlite::Error::InvalidColumnName(format!(
            "invalid uuid '{text}'"
        )))
    })
}

fn parse_timestamp(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Build an OR-of-terms FTS5 match expression from free text. Returns None
/// when the text has no indexable tokens.
fn fts_match_expression(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

/// Map a bm25 rank (negative, lower is better) into (0, 1].
fn normalize_bm25(rank: f64) -> f64 {
    let strength = (-rank).max(0.0);
    strength / (1.0 + strength)
}

pub(crate) fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

pub(crate) fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::llm::{ChatResponse, LlmError};

    /// Embeds deterministically: a unit vector selected by keyword.
    struct KeywordEmbedder {
        fail_embedding: AtomicBool,
    }

    impl KeywordEmbedder {
        fn new() -> Self {
            Self {
                fail_embedding: AtomicBool::new(false),
            }
        }

        fn axis_for(text: &str) -> usize {
            if text.contains("database") {
                1
            } else if text.contains("neural") {
                0
            } else {
                2
            }
        }
    }

    #[async_trait]
    impl ChatModel for KeywordEmbedder {
        async fn chat(&self, _request: crate::llm::ChatRequest) -> Result<ChatResponse, LlmError> {
            Ok(ChatResponse {
                content: "summary".to_string(),
                tokens_used: None,
            })
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
            if self.fail_embedding.load(Ordering::SeqCst) {
                return Err(LlmError::EmptyResponse);
            }
            let mut v = vec![0.0f32; 8];
            v[Self::axis_for(text)] = 1.0;
            Ok(v)
        }
    }

    fn store() -> (KnowledgeStore, Arc<KeywordEmbedder>) {
        let model = Arc::new(KeywordEmbedder::new());
        let store = KnowledgeStore::new(DbHandle::in_memory().unwrap(), model.clone());
        (store, model)
    }

    fn result(query: &str, answer: &str) -> ResearchResult {
        ResearchResult::new(Uuid::new_v4(), Uuid::new_v4(), query, answer)
    }

    #[tokio::test]
    async fn save_and_find_by_log_id() {
        let (store, _) = store();
        let r = result("neural nets", "layers and weights");
        store.save(&r).await.unwrap();

        let found = store.find_by_log_id(r.log_id).unwrap().unwrap();
        assert_eq!(found.id, r.id);
        assert_eq!(found.answer, "layers and weights");

        assert!(store.find_by_log_id(Uuid::new_v4()).unwrap().is_none());
    }

    #[tokio::test]
    async fn embedding_failure_still_saves_row() {
        let (store, model) = store();
        model.fail_embedding.store(true, Ordering::SeqCst);

        let r = result("neural nets", "answer");
        store.save(&r).await.unwrap();
        assert!(store.find_by_log_id(r.log_id).unwrap().is_some());

        // Row is eligible for backfill once embedding works again.
        model.fail_embedding.store(false, Ordering::SeqCst);
        let processed = store.backfill_embeddings(10).await.unwrap();
        assert_eq!(processed, 1);
    }

    #[tokio::test]
    async fn backfill_is_idempotent() {
        let (store, model) = store();
        model.fail_embedding.store(true, Ordering::SeqCst);
        store.save(&result("neural one", "a")).await.unwrap();
        store.save(&result("neural two", "b")).await.unwrap();
        model.fail_embedding.store(false, Ordering::SeqCst);

        assert_eq!(store.backfill_embeddings(10).await.unwrap(), 2);
        assert_eq!(store.backfill_embeddings(10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn lexical_search_prefers_query_column() {
        let (store, _) = store();
        store
            .save(&result("database indexing strategies", "btrees"))
            .await
            .unwrap();
        store
            .save(&result("storage systems", "database files on disk"))
            .await
            .unwrap();

        let matches = store.search_prior_research("database", 5).unwrap();
        assert_eq!(matches.len(), 2);
        // The row matching in the query column outranks the answer-column match.
        assert_eq!(matches[0].query, "database indexing strategies");
        assert!(matches[0].score > matches[1].score);
    }

    #[tokio::test]
    async fn hybrid_scores_are_clamped_and_sorted() {
        let (store, _) = store();
        store.save(&result("neural networks", "layers")).await.unwrap();
        store.save(&result("database engines", "btrees")).await.unwrap();

        let matches = store
            .search_hybrid("neural networks", 5, HybridWeights::default())
            .await
            .unwrap();
        assert!(!matches.is_empty());
        for pair in matches.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        for m in &matches {
            assert!((0.0..=1.0).contains(&m.score));
        }
        // The dual-channel match comes first.
        assert_eq!(matches[0].query, "neural networks");
    }

    #[tokio::test]
    async fn dual_channel_match_outranks_single_channels() {
        let (store, _) = store();
        // Dual: matches "neural" both lexically and semantically.
        store.save(&result("neural networks", "layers")).await.unwrap();
        // Lexical only: shares a token, embeds on a different axis.
        store
            .save(&result("database neural pipelines", "etl"))
            .await
            .unwrap();

        let matches = store
            .search_hybrid("neural networks", 5, HybridWeights::default())
            .await
            .unwrap();
        assert_eq!(matches[0].query, "neural networks");
        assert!(matches.len() >= 2);
        assert!(matches[0].score > matches[1].score);
    }

    #[test]
    fn embedding_blob_roundtrip() {
        let original = vec![0.25f32, -1.5, 3.125, 0.0];
        let decoded = decode_embedding(&encode_embedding(&original));
        assert_eq!(decoded, original);
    }

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn bm25_normalization_stays_in_unit_interval() {
        for rank in [-20.0, -1.0, -0.1, 0.0] {
            let s = normalize_bm25(rank);
            assert!((0.0..=1.0).contains(&s), "rank {rank} -> {s}");
        }
        assert!(normalize_bm25(-5.0) > normalize_bm25(-1.0));
    }

    #[test]
    fn fts_expression_quotes_tokens() {
        assert_eq!(
            fts_match_expression("what is rust?").unwrap(),
            "\"what\" OR \"is\" OR \"rust\""
        );
        assert!(fts_match_expression("!!!").is_none());
    }
}
