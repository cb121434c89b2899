use crate::concurrency::WorkerPool;
use crate::config::Config;
use crate::errors::AppError;
use crate::llm::ModelAdapter;
use crate::models::{ChatScope, ChunkSource};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Vector store client (Qdrant-shaped HTTP contract per §6: EnsureCollection, Upsert,
/// Search, DeleteByField). Every call runs through `worker_pool`, this dependency's own
/// bounded worker budget (§4.10).
pub struct VectorService {
    pub client: reqwest::Client,
    pub base_url: String,
    worker_pool: WorkerPool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub score: f32,
    pub payload: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: HashMap<String, serde_json::Value>,
}

impl VectorService {
    pub fn new(base_url: String, io_worker_capacity: usize) -> Self {
        Self { client: reqwest::Client::new(), base_url, worker_pool: WorkerPool::new(io_worker_capacity) }
    }

    /// `EnsureCollection(name, dim, metric=cosine)`.
    pub async fn ensure_collection(&self, collection_name: &str, dim: usize) -> Result<()> {
        let client = &self.client;
        let base_url = &self.base_url;
        self.worker_pool
            .run(|| async move {
                let check_url = format!("{}/collections/{}", base_url, collection_name);
                let check_response = client.get(&check_url).send().await?;

                if check_response.status().is_success() {
                    tracing::debug!("collection '{}' already exists", collection_name);
                    return Ok(());
                }

                let create_url = format!("{}/collections/{}", base_url, collection_name);
                let body = serde_json::json!({ "vectors": { "size": dim, "distance": "Cosine" } });

                let response = client.put(&create_url).json(&body).send().await?;
                if !response.status().is_success() {
                    let error = response.text().await?;
                    return Err(anyhow::anyhow!("failed to create collection: {}", error));
                }

                tracing::info!("created collection '{}'", collection_name);
                Ok(())
            })
            .await
    }

    /// `Upsert(points)`.
    pub async fn upsert(&self, collection_name: &str, points: Vec<VectorPoint>) -> Result<()> {
        let url = format!("{}/collections/{}/points", self.base_url, collection_name);
        let body = serde_json::json!({
            "points": points.into_iter().map(|p| serde_json::json!({
                "id": p.id, "vector": p.vector, "payload": p.payload
            })).collect::<Vec<_>>()
        });
        let client = &self.client;

        self.worker_pool
            .run(|| async move {
                let response = client.put(&url).json(&body).send().await?;
                if !response.status().is_success() {
                    let error = response.text().await?;
                    tracing::error!("qdrant upsert failed: {}", error);
                    return Err(anyhow::anyhow!("failed to upsert points: {}", error));
                }
                Ok(())
            })
            .await
    }

    /// `Search(vector, filter, limit) → points with score`. `filter` is a conjunction
    /// of equality conditions on payload fields.
    pub async fn search(
        &self,
        collection_name: &str,
        query_vector: Vec<f32>,
        limit: usize,
        filter: Option<serde_json::Value>,
    ) -> Result<Vec<SearchResult>> {
        let url = format!("{}/collections/{}/points/search", self.base_url, collection_name);
        let mut body = serde_json::json!({ "vector": query_vector, "limit": limit, "with_payload": true });
        if let Some(f) = filter {
            body["filter"] = f;
        }
        let client = &self.client;

        self.worker_pool
            .run(|| async move {
                let response = client.post(&url).json(&body).send().await?;
                if !response.status().is_success() {
                    let error = response.text().await?;
                    return Err(anyhow::anyhow!("search failed: {}", error));
                }

                let json: serde_json::Value = response.json().await?;
                let results = json["result"]
                    .as_array()
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|item| {
                                Some(SearchResult {
                                    id: item["id"].as_str()?.to_string(),
                                    score: item["score"].as_f64()? as f32,
                                    payload: serde_json::from_value(item["payload"].clone()).ok()?,
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default();

                Ok(results)
            })
            .await
    }

    /// `DeleteByField(key, value)`.
    pub async fn delete_by_field(&self, collection_name: &str, key: &str, value: &str) -> Result<()> {
        let url = format!("{}/collections/{}/points/delete", self.base_url, collection_name);
        let body = serde_json::json!({
            "filter": { "must": [{ "key": key, "match": { "value": value } }] }
        });
        let client = &self.client;

        self.worker_pool
            .run(|| async move {
                let response = client.post(&url).json(&body).send().await?;
                if !response.status().is_success() {
                    let error = response.text().await?;
                    return Err(anyhow::anyhow!("failed to delete points: {}", error));
                }
                Ok(())
            })
            .await
    }
}

fn equality_filter(scope: &ChatScope) -> serde_json::Value {
    let (key, value) = match (scope.material_id, scope.pod_id) {
        (Some(m), _) => ("material_id", m.to_string()),
        (_, Some(p)) => ("pod_id", p.to_string()),
        _ => unreachable!("ChatScope always has one side set"),
    };
    serde_json::json!({ "must": [{ "key": key, "match": { "value": value } }] })
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// `Retrieve(query, scope, k) → []ChunkSource` (§4.2).
///
/// Algorithm: embed the query once, issue a filtered nearest-neighbour search, drop
/// chunks below the score floor, deduplicate by normalised-whitespace text (keeping the
/// higher-scored instance), sort by descending score with `(material_id, chunk_index)`
/// tie-break, then truncate to `k`. An empty result is not an error.
pub async fn retrieve(
    adapter: &ModelAdapter,
    vector_service: &VectorService,
    collection: &str,
    query: &str,
    scope: ChatScope,
    k: usize,
    config: &Config,
) -> Result<Vec<ChunkSource>, AppError> {
    if query.is_empty() || query.chars().count() > 2000 {
        return Err(AppError::InvalidArgument("query must be 1..=2000 characters".to_string()));
    }
    let k = k.clamp(1, config.retrieval_max_k);

    let query_vector = adapter.embed(query).await.map_err(AppError::from)?;

    let filter = equality_filter(&scope);
    // Over-fetch: dedup/floor filtering may drop candidates before truncation to k.
    let raw = vector_service
        .search(collection, query_vector, k * 4, Some(filter))
        .await
        .map_err(|e| AppError::Unavailable(e.to_string()))?;

    let mut sources: Vec<ChunkSource> = Vec::new();
    let mut seen_texts: Vec<String> = Vec::new();

    let mut candidates: Vec<SearchResult> = raw
        .into_iter()
        .filter(|r| r.score >= config.retrieval_score_floor)
        .collect();
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    for result in candidates {
        let text = result
            .payload
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let normalized = normalize_whitespace(&text);
        if seen_texts.contains(&normalized) {
            continue;
        }

        let material_id = result
            .payload
            .get("material_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        let chunk_index = result
            .payload
            .get("chunk_index")
            .and_then(|v| v.as_i64())
            .unwrap_or(0) as i32;

        seen_texts.push(normalized);
        sources.push(ChunkSource { material_id, chunk_index, text, score: result.score });

        if sources.len() >= k {
            break;
        }
    }

    sources.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.material_id.cmp(&b.material_id))
            .then_with(|| a.chunk_index.cmp(&b.chunk_index))
    });

    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn normalize_whitespace_collapses_runs_and_case() {
        assert_eq!(normalize_whitespace("A  limit\n describes"), "a limit describes");
    }

    #[test]
    fn equality_filter_prefers_material_over_pod() {
        let scope = ChatScope { material_id: Some(Uuid::nil()), pod_id: Some(Uuid::nil()) };
        let filter = equality_filter(&scope);
        assert_eq!(filter["must"][0]["key"], "material_id");
    }

    #[test]
    fn equality_filter_falls_back_to_pod() {
        let scope = ChatScope::pod(Uuid::nil());
        let filter = equality_filter(&scope);
        assert_eq!(filter["must"][0]["key"], "pod_id");
    }
}
