use crate::concurrency::WorkerPool;
use crate::db as dbmod;
use crate::errors::AppError;
use crate::models::Device;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::json;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

/// `Register(user, fingerprint, name, platform) → Device` (§4.6). Idempotent on
/// `(user, fingerprint)`: a repeat call returns the existing device with `last_used_at`
/// refreshed. Rejects with `ResourceExhausted`/`DEVICE_LIMIT_EXCEEDED` once the user
/// already has `max_devices_per_user` active devices.
#[allow(clippy::too_many_arguments)]
pub async fn register(
    pool: &Pool<Postgres>,
    budget: &WorkerPool,
    user_id: Uuid,
    fingerprint: &str,
    name: &str,
    platform: &str,
    max_devices: i64,
) -> Result<Device, AppError> {
    budget
        .run(|| async move {
            if let Some(mut existing) = dbmod::find_device_by_fingerprint(pool, user_id, fingerprint).await? {
                dbmod::touch_device(pool, existing.id).await?;
                existing.last_used_at = chrono::Utc::now();
                return Ok(existing);
            }

            let active = dbmod::count_active_devices(pool, user_id).await?;
            if active >= max_devices {
                return Err(AppError::ResourceExhausted(
                    "DEVICE_LIMIT_EXCEEDED".to_string(),
                    json!({"limit": max_devices, "current": active}),
                ));
            }

            let mut key_bytes = [0u8; 32];
            rand::Rng::fill(&mut rand::thread_rng(), &mut key_bytes);
            let signing_key = STANDARD.encode(key_bytes);

            let device = dbmod::insert_device(pool, user_id, fingerprint, name, platform, &signing_key).await?;
            tracing::info!(%user_id, device_id = %device.id, "registered device");
            Ok(device)
        })
        .await
}

pub async fn list(pool: &Pool<Postgres>, budget: &WorkerPool, user_id: Uuid) -> Result<Vec<Device>, AppError> {
    Ok(budget.run(|| dbmod::list_devices(pool, user_id)).await?)
}

/// `Deregister(user, device)`. Sets `revoked_at = now` and cascades revocation of all
/// active licenses bound to that device (§4.7). Ownership-checked: a device belonging to
/// another user is treated as `NotFound`, not `Forbidden`, to avoid leaking existence.
pub async fn deregister(
    pool: &Pool<Postgres>,
    budget: &WorkerPool,
    user_id: Uuid,
    device_id: Uuid,
) -> Result<(), AppError> {
    budget
        .run(|| async move {
            let device = dbmod::get_device(pool, device_id)
                .await?
                .filter(|d| d.user_id == user_id)
                .ok_or_else(|| AppError::NotFound("device".to_string()))?;

            dbmod::revoke_device(pool, device.id).await?;
            let revoked = dbmod::revoke_licenses_for_device(pool, device.id).await?;
            tracing::info!(%user_id, device_id = %device.id, revoked_licenses = revoked, "deregistered device");
            Ok(())
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_limit_error_carries_limit_and_current_in_details() {
        let err = AppError::ResourceExhausted(
            "DEVICE_LIMIT_EXCEEDED".to_string(),
            json!({"limit": 5, "current": 5}),
        );
        match err {
            AppError::ResourceExhausted(code, details) => {
                assert_eq!(code, "DEVICE_LIMIT_EXCEEDED");
                assert_eq!(details["limit"], 5);
            }
            _ => panic!("wrong variant"),
        }
    }
}
