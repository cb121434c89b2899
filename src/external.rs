use crate::concurrency::WorkerPool;
use anyhow::Result;
use async_trait::async_trait;

/// `HasAccess(user, material) → bool` (§6). The License Manager treats a `false` return
/// as `Forbidden` and logs an audit entry.
#[async_trait]
pub trait AccessChecker: Send + Sync {
    async fn has_access(&self, user_id: &str, material_id: &str) -> Result<bool>;
}

/// HTTP-backed adapter calling out to the materials service, bounded by its own worker
/// budget (§4.10) so a slow materials service can't starve the process of connections.
pub struct HttpAccessChecker {
    client: reqwest::Client,
    base_url: String,
    worker_pool: WorkerPool,
}

impl HttpAccessChecker {
    pub fn new(base_url: String, io_worker_capacity: usize) -> Self {
        Self { client: reqwest::Client::new(), base_url, worker_pool: WorkerPool::new(io_worker_capacity) }
    }
}

#[async_trait]
impl AccessChecker for HttpAccessChecker {
    async fn has_access(&self, user_id: &str, material_id: &str) -> Result<bool> {
        let url = format!("{}/internal/access/{}/{}", self.base_url, user_id, material_id);
        let client = &self.client;
        self.worker_pool
            .run(|| async move {
                let response = client.get(&url).send().await?;
                if !response.status().is_success() {
                    return Ok(false);
                }
                let body: serde_json::Value = response.json().await?;
                Ok(body["has_access"].as_bool().unwrap_or(false))
            })
            .await
    }
}

/// Object store contract (§6): `PresignedPut`, `PresignedGet`, `Stat`, `Delete`. All
/// keys are opaque strings; encrypted materials use `encrypted/{material_id}/{cek_version}`.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    async fn presigned_put(&self, key: &str, content_type: &str, ttl_secs: u64) -> Result<String>;
    async fn presigned_get(&self, key: &str, ttl_secs: u64) -> Result<String>;
    async fn stat(&self, key: &str) -> Result<ObjectStat>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Uploads bytes directly through a presigned PUT URL, a common pattern layered on
    /// top of the presigned contract rather than a distinct primitive.
    async fn put_bytes(&self, key: &str, content_type: &str, bytes: Vec<u8>) -> Result<()> {
        let url = self.presigned_put(key, content_type, 300).await?;
        let client = reqwest::Client::new();
        let response = client.put(&url).header("Content-Type", content_type).body(bytes).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("object store upload failed: {}", response.status());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ObjectStat {
    pub size: u64,
    pub content_type: String,
    pub etag: String,
}

pub struct HttpObjectStoreClient {
    client: reqwest::Client,
    base_url: String,
    worker_pool: WorkerPool,
}

impl HttpObjectStoreClient {
    pub fn new(base_url: String, io_worker_capacity: usize) -> Self {
        Self { client: reqwest::Client::new(), base_url, worker_pool: WorkerPool::new(io_worker_capacity) }
    }
}

#[async_trait]
impl ObjectStoreClient for HttpObjectStoreClient {
    async fn presigned_put(&self, key: &str, content_type: &str, ttl_secs: u64) -> Result<String> {
        let url = format!("{}/presign/put", self.base_url);
        let body = serde_json::json!({"key": key, "content_type": content_type, "ttl_secs": ttl_secs});
        let client = &self.client;
        self.worker_pool
            .run(|| async move {
                let response = client.post(&url).json(&body).send().await?;
                let body: serde_json::Value = response.json().await?;
                body["url"]
                    .as_str()
                    .map(|s| s.to_string())
                    .ok_or_else(|| anyhow::anyhow!("object store did not return a presigned URL"))
            })
            .await
    }

    async fn presigned_get(&self, key: &str, ttl_secs: u64) -> Result<String> {
        let url = format!("{}/presign/get", self.base_url);
        let body = serde_json::json!({"key": key, "ttl_secs": ttl_secs});
        let client = &self.client;
        self.worker_pool
            .run(|| async move {
                let response = client.post(&url).json(&body).send().await?;
                let body: serde_json::Value = response.json().await?;
                body["url"]
                    .as_str()
                    .map(|s| s.to_string())
                    .ok_or_else(|| anyhow::anyhow!("object store did not return a presigned URL"))
            })
            .await
    }

    async fn stat(&self, key: &str) -> Result<ObjectStat> {
        let url = format!("{}/stat/{}", self.base_url, key);
        let client = &self.client;
        self.worker_pool
            .run(|| async move {
                let response = client.get(&url).send().await?;
                Ok(response.json().await?)
            })
            .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let url = format!("{}/object/{}", self.base_url, key);
        let client = &self.client;
        self.worker_pool
            .run(|| async move {
                client.delete(&url).send().await?;
                Ok(())
            })
            .await
    }

    /// Overrides the trait default so the upload itself, not just the presign call,
    /// runs through this client's own worker budget instead of an ad hoc `reqwest::Client`.
    async fn put_bytes(&self, key: &str, content_type: &str, bytes: Vec<u8>) -> Result<()> {
        let url = self.presigned_put(key, content_type, 300).await?;
        let client = &self.client;
        self.worker_pool
            .run(|| async move {
                let response = client.put(&url).header("Content-Type", content_type).body(bytes).send().await?;
                if !response.status().is_success() {
                    anyhow::bail!("object store upload failed: {}", response.status());
                }
                Ok(())
            })
            .await
    }
}

pub fn encrypted_object_key(material_id: &str, cek_version: i32) -> String {
    format!("encrypted/{material_id}/{cek_version}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypted_object_key_matches_spec_pattern() {
        assert_eq!(encrypted_object_key("m1", 3), "encrypted/m1/3");
    }
}
