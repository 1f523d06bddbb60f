//! # Similarity store
//!
//! One named collection of `(id, vector, payload)` points with cosine distance and a fixed
//! dimension. [`QdrantStore`] talks to a Qdrant server over its REST API; [`MemoryStore`] keeps
//! the points in process for tests.
//!
//! ## Example
//!
//! ```no_run
//! use askai::store::{QdrantStore, SimilarityStore, PayloadFilter};
//!
//! # async fn demo(vector: Vec<f32>) -> Result<(), Box<dyn std::error::Error>> {
//! let store = QdrantStore::new("http://localhost:6333", "askai_questions", 1024, None);
//! store.ensure_collection(1024).await?;
//! let hits = store
//!     .search(&vector, 5, Some(&PayloadFilter::new("type", "qa_pair")))
//!     .await?;
//! for hit in hits {
//!     println!("{:.3} {}", hit.score, hit.payload.get("question").cloned().unwrap_or_default());
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::StoreError;

/// String-keyed payload attached to every point.
pub type Payload = BTreeMap<String, String>;

/// Exact-match condition on one payload key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadFilter {
    pub key: String,
    pub value: String,
}

impl PayloadFilter {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    fn matches(&self, payload: &Payload) -> bool {
        payload.get(&self.key).is_some_and(|v| v == &self.value)
    }
}

/// One search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: Payload,
}

/// Remote (or in-process) collection of vectors.
///
/// Every method addresses the single collection the store was built for. Implementations hold
/// only a connection handle and are safe to share behind an `Arc`.
#[async_trait]
pub trait SimilarityStore: Send + Sync {
    /// Create the collection with cosine distance if it is missing. Succeeds without changes if
    /// it already exists with the same dimension.
    ///
    /// # Errors
    ///
    /// [`StoreError::DimensionMismatch`] when the existing collection has another vector size.
    async fn ensure_collection(&self, dimension: usize) -> Result<(), StoreError>;

    /// Write or overwrite one point.
    async fn upsert(&self, id: &str, vector: Vec<f32>, payload: Payload) -> Result<(), StoreError>;

    /// Nearest neighbours by descending similarity, at most `limit` of them.
    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<ScoredPoint>, StoreError>;

    /// Delete the collection (a missing collection is fine) and create it again.
    async fn reset_collection(&self) -> Result<(), StoreError>;

    /// Exact number of points in the collection.
    async fn count(&self) -> Result<u64, StoreError>;

    fn dimension(&self) -> usize;

    fn collection(&self) -> &str;
}

/// Qdrant REST client bound to one collection.
pub struct QdrantStore {
    http: reqwest::Client,
    base_url: String,
    collection: String,
    dimension: usize,
    api_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct QdrantPoint<'a> {
    id: &'a str,
    vector: Vec<f32>,
    payload: &'a Payload,
}

#[derive(Debug, Deserialize)]
struct CollectionInfo {
    result: CollectionResult,
}

#[derive(Debug, Deserialize)]
struct CollectionResult {
    config: CollectionConfig,
}

#[derive(Debug, Deserialize)]
struct CollectionConfig {
    params: CollectionParams,
}

#[derive(Debug, Deserialize)]
struct CollectionParams {
    vectors: VectorParams,
}

#[derive(Debug, Deserialize)]
struct VectorParams {
    size: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    result: Vec<SearchEntry>,
}

#[derive(Debug, Deserialize)]
struct SearchEntry {
    id: serde_json::Value,
    score: f32,
    payload: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    result: CountResult,
}

#[derive(Debug, Deserialize)]
struct CountResult {
    count: u64,
}

impl QdrantStore {
    pub fn new(base_url: &str, collection: &str, dimension: usize, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            collection: collection.to_string(),
            dimension,
            api_key,
        }
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.base_url, self.collection)
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(StoreError::Server {
            status: status.as_u16(),
            body,
        })
    }

    async fn create_collection(&self, dimension: usize) -> Result<(), StoreError> {
        let body = json!({
            "vectors": {
                "size": dimension,
                "distance": "Cosine"
            }
        });
        let response = self
            .request(reqwest::Method::PUT, self.collection_url())
            .json(&body)
            .send()
            .await?;

        // A concurrent creator may have won the race.
        if response.status() == StatusCode::CONFLICT {
            return Ok(());
        }
        Self::check(response).await?;
        info!(collection = %self.collection, dimension, "created collection");
        Ok(())
    }
}

#[async_trait]
impl SimilarityStore for QdrantStore {
    async fn ensure_collection(&self, dimension: usize) -> Result<(), StoreError> {
        let response = self
            .request(reqwest::Method::GET, self.collection_url())
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return self.create_collection(dimension).await;
        }

        let info: CollectionInfo = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;

        match info.result.config.params.vectors.size {
            Some(actual) if actual != dimension => Err(StoreError::DimensionMismatch {
                collection: self.collection.clone(),
                expected: dimension,
                actual,
            }),
            _ => {
                debug!(collection = %self.collection, "collection already exists");
                Ok(())
            }
        }
    }

    async fn upsert(&self, id: &str, vector: Vec<f32>, payload: Payload) -> Result<(), StoreError> {
        let point = QdrantPoint {
            id,
            vector,
            payload: &payload,
        };
        let body = json!({ "points": [point] });
        let response = self
            .request(
                reqwest::Method::PUT,
                format!("{}/points", self.collection_url()),
            )
            .query(&[("wait", "true")])
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;
        debug!(collection = %self.collection, point_id = id, "upserted point");
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<ScoredPoint>, StoreError> {
        let mut body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(filter) = filter {
            body["filter"] = json!({
                "must": [{ "key": filter.key, "match": { "value": filter.value } }]
            });
        }

        let response = self
            .request(
                reqwest::Method::POST,
                format!("{}/points/search", self.collection_url()),
            )
            .json(&body)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::MissingCollection(self.collection.clone()));
        }

        let parsed: SearchResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;

        let mut hits: Vec<ScoredPoint> = parsed
            .result
            .into_iter()
            .map(|entry| ScoredPoint {
                id: value_to_string(entry.id),
                score: entry.score,
                payload: entry
                    .payload
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(k, v)| (k, value_to_string(v)))
                    .collect(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(hits)
    }

    async fn reset_collection(&self) -> Result<(), StoreError> {
        let response = self
            .request(reqwest::Method::DELETE, self.collection_url())
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            warn!(collection = %self.collection, "collection did not exist before reset");
        } else {
            Self::check(response).await?;
        }
        self.create_collection(self.dimension).await
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let response = self
            .request(
                reqwest::Method::POST,
                format!("{}/points/count", self.collection_url()),
            )
            .json(&json!({ "exact": true }))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::MissingCollection(self.collection.clone()));
        }
        let parsed: CountResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(parsed.result.count)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn collection(&self) -> &str {
        &self.collection
    }
}

fn value_to_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

struct MemoryPoint {
    id: String,
    vector: Vec<f32>,
    payload: Payload,
}

/// In-process store. Brute-force cosine search over every point.
pub struct MemoryStore {
    collection: String,
    dimension: usize,
    points: Mutex<Option<Vec<MemoryPoint>>>,
}

impl MemoryStore {
    /// A store whose collection does not exist yet; call
    /// [`ensure_collection`](SimilarityStore::ensure_collection) first.
    pub fn new(collection: &str, dimension: usize) -> Self {
        Self {
            collection: collection.to_string(),
            dimension,
            points: Mutex::new(None),
        }
    }
}

#[async_trait]
impl SimilarityStore for MemoryStore {
    async fn ensure_collection(&self, dimension: usize) -> Result<(), StoreError> {
        if dimension != self.dimension {
            return Err(StoreError::DimensionMismatch {
                collection: self.collection.clone(),
                expected: dimension,
                actual: self.dimension,
            });
        }
        let mut points = self.points.lock().await;
        if points.is_none() {
            *points = Some(Vec::new());
        }
        Ok(())
    }

    async fn upsert(&self, id: &str, vector: Vec<f32>, payload: Payload) -> Result<(), StoreError> {
        if vector.len() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                collection: self.collection.clone(),
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        let mut guard = self.points.lock().await;
        let points = guard
            .as_mut()
            .ok_or_else(|| StoreError::MissingCollection(self.collection.clone()))?;
        match points.iter_mut().find(|p| p.id == id) {
            Some(existing) => {
                existing.vector = vector;
                existing.payload = payload;
            }
            None => points.push(MemoryPoint {
                id: id.to_string(),
                vector,
                payload,
            }),
        }
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<ScoredPoint>, StoreError> {
        let guard = self.points.lock().await;
        let points = guard
            .as_ref()
            .ok_or_else(|| StoreError::MissingCollection(self.collection.clone()))?;

        let mut hits: Vec<ScoredPoint> = points
            .iter()
            .filter(|p| filter.is_none_or(|f| f.matches(&p.payload)))
            .map(|p| ScoredPoint {
                id: p.id.clone(),
                score: cosine_similarity(vector, &p.vector),
                payload: p.payload.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn reset_collection(&self) -> Result<(), StoreError> {
        *self.points.lock().await = Some(Vec::new());
        Ok(())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let guard = self.points.lock().await;
        guard
            .as_ref()
            .map(|p| p.len() as u64)
            .ok_or_else(|| StoreError::MissingCollection(self.collection.clone()))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn collection(&self) -> &str {
        &self.collection
    }
}

/// Cosine similarity; zero when either vector has no magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
