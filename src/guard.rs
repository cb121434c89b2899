use crate::config::Config;
use crate::errors::AppError;
use crate::models::Device;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::json;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// `AllowDownload(user)` (§4.9). Sliding window of `download_window`, `download_quota`
/// downloads per user, mirroring the teacher's Redis `INCRBY` + `EXPIRE` counter shape
/// (`cache.rs::track_tokens`).
pub async fn allow_download(cache: &ConnectionManager, config: &Config, user_id: &str) -> Result<(), AppError> {
    let mut conn = cache.clone();
    let key = format!("download:{user_id}");

    let count: i64 = conn.incr(&key, 1).await.map_err(|e| AppError::Internal(e.to_string()))?;
    if count == 1 {
        let _: () = conn
            .expire(&key, config.download_window.as_secs() as i64)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
    }

    if count > config.download_quota as i64 {
        let ttl: i64 = conn.ttl(&key).await.unwrap_or(config.download_window.as_secs() as i64);
        return Err(AppError::RateLimited {
            retry_after_secs: ttl.max(0) as u64,
            details: json!({"limit": config.download_quota, "window_secs": config.download_window.as_secs()}),
        });
    }

    Ok(())
}

/// `RecordValidationFailure(device) → blocked?` (§4.9). Consecutive `Validate` failures
/// increment a per-device counter with a window; at `device_failure_threshold` the
/// device is blocked for the remainder of the window.
pub async fn record_validation_failure(
    cache: &ConnectionManager,
    config: &Config,
    device_id: &str,
) -> Result<bool, AppError> {
    let mut conn = cache.clone();
    let key = format!("valfail:{device_id}");

    let count: i64 = conn.incr(&key, 1).await.map_err(|e| AppError::Internal(e.to_string()))?;
    if count == 1 {
        let _: () = conn
            .expire(&key, config.device_failure_window.as_secs() as i64)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
    }

    Ok(count >= config.device_failure_threshold as i64)
}

/// A successful `Validate` or an explicit admin reset clears the counter.
pub async fn clear_validation_failures(cache: &ConnectionManager, device_id: &str) -> Result<(), AppError> {
    let mut conn = cache.clone();
    let key = format!("valfail:{device_id}");
    let _: () = conn.del(&key).await.map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(())
}

pub async fn is_device_blocked(cache: &ConnectionManager, config: &Config, device_id: &str) -> Result<bool, AppError> {
    let mut conn = cache.clone();
    let key = format!("valfail:{device_id}");
    let count: Option<i64> = conn.get(&key).await.map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(count.unwrap_or(0) >= config.device_failure_threshold as i64)
}

/// `CheckSignedRequest(req, device) → ok?` (§4.9). Accepts only if `|now - timestamp| <=
/// replay_window`, the `(device, nonce)` pair has not been seen within the window, and
/// the signature verifies against the device's signing key.
pub async fn check_signed_request(
    cache: &ConnectionManager,
    config: &Config,
    device: &Device,
    nonce: &str,
    signature_b64: &str,
    timestamp: DateTime<Utc>,
) -> Result<bool, AppError> {
    let now = Utc::now();
    let skew = (now - timestamp).num_seconds().unsigned_abs();
    if skew > config.replay_window.as_secs() {
        return Ok(false);
    }

    if !verify_signature(device, nonce, signature_b64, timestamp) {
        return Ok(false);
    }

    let mut conn = cache.clone();
    let key = format!("replay:{}:{}", device.id, nonce);
    // SET NX EX: first writer wins, so a concurrent or repeated presentation of the
    // same nonce is rejected.
    let inserted: bool = redis::cmd("SET")
        .arg(&key)
        .arg(1)
        .arg("NX")
        .arg("EX")
        .arg(config.replay_window.as_secs())
        .query_async::<_, Option<String>>(&mut conn)
        .await
        .map(|v| v.is_some())
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok(inserted)
}

/// Verifies `HMAC-SHA256(device.signing_key, "{timestamp}:{nonce}:{device_id}")`
/// against the presented base64 signature.
pub fn verify_signature(device: &Device, nonce: &str, signature_b64: &str, timestamp: DateTime<Utc>) -> bool {
    let signature = match STANDARD.decode(signature_b64) {
        Ok(s) => s,
        Err(_) => return false,
    };
    let key_bytes = match STANDARD.decode(&device.signing_key) {
        Ok(k) => k,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(&key_bytes) {
        Ok(m) => m,
        Err(_) => return false,
    };
    let message = format!("{}:{}:{}", timestamp.to_rfc3339(), nonce, device.id);
    mac.update(message.as_bytes());
    mac.verify_slice(&signature).is_ok()
}

/// Helper for clients/tests: produces a valid signature for a given device + nonce + timestamp.
pub fn sign(device: &Device, nonce: &str, timestamp: DateTime<Utc>) -> Result<String, AppError> {
    let key_bytes = STANDARD
        .decode(&device.signing_key)
        .map_err(|e| AppError::Internal(e.to_string()))?;
    let mut mac = HmacSha256::new_from_slice(&key_bytes).map_err(|e| AppError::Internal(e.to_string()))?;
    let message = format!("{}:{}:{}", timestamp.to_rfc3339(), nonce, device.id);
    mac.update(message.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn test_device() -> Device {
        let mut key = [0u8; 32];
        for (i, b) in key.iter_mut().enumerate() {
            *b = i as u8;
        }
        Device {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            fingerprint: "fp".to_string(),
            name: "phone".to_string(),
            platform: "ios".to_string(),
            last_used_at: Utc::now(),
            created_at: Utc::now(),
            revoked_at: None,
            signing_key: STANDARD.encode(key),
        }
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let device = test_device();
        let ts = Utc::now();
        let sig = sign(&device, "nonce-1", ts).unwrap();
        assert!(verify_signature(&device, "nonce-1", &sig, ts));
    }

    #[test]
    fn verify_rejects_tampered_nonce() {
        let device = test_device();
        let ts = Utc::now();
        let sig = sign(&device, "nonce-1", ts).unwrap();
        assert!(!verify_signature(&device, "nonce-2", &sig, ts));
    }

    #[test]
    fn verify_rejects_wrong_device_key() {
        let device_a = test_device();
        let device_b = test_device();
        let ts = Utc::now();
        let sig = sign(&device_a, "nonce-1", ts).unwrap();
        assert!(!verify_signature(&device_b, "nonce-1", &sig, ts));
    }
}
