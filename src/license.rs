use crate::concurrency::WorkerPool;
use crate::config::Config;
use crate::db as dbmod;
use crate::errors::AppError;
use crate::external::AccessChecker;
use crate::guard;
use crate::models::{License, LicenseStatus};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

fn fresh_nonce() -> String {
    let mut bytes = [0u8; 32];
    rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
    STANDARD.encode(bytes)
}

/// `Issue(user, material, device) → License` (§4.7). Verifies material access, refuses
/// with `Forbidden` if absent, and otherwise creates — or idempotently returns — the
/// active license for `(user, material, device)`.
#[allow(clippy::too_many_arguments)]
pub async fn issue(
    pool: &Pool<Postgres>,
    config: &Config,
    access_checker: &dyn AccessChecker,
    budget: &WorkerPool,
    user_id: Uuid,
    material_id: Uuid,
    device_id: Uuid,
) -> Result<License, AppError> {
    budget
        .run(|| async move {
            if let Some(existing) = dbmod::find_active_license(pool, user_id, material_id, device_id).await? {
                return Ok(existing);
            }

            let allowed = access_checker
                .has_access(&user_id.to_string(), &material_id.to_string())
                .await
                .map_err(|e| AppError::Unavailable(e.to_string()))?;

            if !allowed {
                dbmod::append_audit_log(
                    pool,
                    &user_id.to_string(),
                    "license.issue",
                    &material_id.to_string(),
                    "forbidden",
                    None,
                    None,
                )
                .await?;
                return Err(AppError::Forbidden);
            }

            let now = Utc::now();
            let license = dbmod::insert_license(
                pool,
                user_id,
                material_id,
                device_id,
                now + chrono::Duration::from_std(config.license_validity).unwrap(),
                config.offline_grace_period.as_secs() as i64,
                &fresh_nonce(),
            )
            .await?;

            dbmod::append_audit_log(
                pool,
                &user_id.to_string(),
                "license.issue",
                &material_id.to_string(),
                "granted",
                None,
                None,
            )
            .await?;
            tracing::info!(%user_id, %material_id, %device_id, license_id = %license.id, "issued license");

            Ok(license)
        })
        .await
}

/// Precise failure reasons per §7, surfaced in the `details.reason` of the returned error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidateFailure {
    Expired,
    Revoked,
    NonceMismatch,
    SignatureInvalid,
    Blocked,
    GraceExpired,
}

impl ValidateFailure {
    fn code(self) -> &'static str {
        match self {
            ValidateFailure::Expired => "LICENSE_EXPIRED",
            ValidateFailure::Revoked => "LICENSE_REVOKED",
            ValidateFailure::NonceMismatch => "INVALID_NONCE",
            ValidateFailure::SignatureInvalid => "INVALID_SIGNATURE",
            ValidateFailure::Blocked => "DEVICE_BLOCKED",
            ValidateFailure::GraceExpired => "LICENSE_OFFLINE_EXPIRED",
        }
    }
}

impl From<ValidateFailure> for AppError {
    fn from(f: ValidateFailure) -> Self {
        let message = match f {
            ValidateFailure::Expired => "license has expired",
            ValidateFailure::Revoked => "license has been revoked",
            ValidateFailure::NonceMismatch => "presented nonce does not match the current license nonce",
            ValidateFailure::SignatureInvalid => "request signature did not verify against the device's key",
            ValidateFailure::Blocked => "device is blocked after repeated validation failures",
            ValidateFailure::GraceExpired => "offline grace period has elapsed; an online validation is required",
        };
        AppError::LicenseRejected { code: f.code(), message: message.to_string() }
    }
}

pub struct ValidateOutcome {
    pub new_nonce: String,
    pub expires_at: DateTime<Utc>,
}

/// Pure form of §4.7(e): the grace period only binds an offline call; an online call
/// (the caller has already reached the network to get here) is exempt regardless of
/// how long it has been since the last validation.
fn grace_exceeded(license: &License, now: DateTime<Utc>, online: bool) -> bool {
    !online && now >= license.offline_validity_deadline()
}

/// `Validate(license, nonce, signature) → Status` (§4.7), the hot path. `online`
/// distinguishes a call the caller knows reached the network, relaxing the grace-period
/// bound per the contract in §4.7(e). The HTTP surface is itself only reachable over the
/// network, so `handlers::validate_license` always passes `online: true`; `online: false`
/// is exercised directly by `grace_exceeded`'s unit tests below and is reserved for a
/// future offline-capable caller (e.g. a client-embedded validator) that this binary does
/// not yet expose.
#[allow(clippy::too_many_arguments)]
pub async fn validate(
    pool: &Pool<Postgres>,
    cache: &ConnectionManager,
    config: &Config,
    budget: &WorkerPool,
    license_id: Uuid,
    presented_nonce: &str,
    signature_b64: &str,
    timestamp: DateTime<Utc>,
    online: bool,
) -> Result<ValidateOutcome, AppError> {
    let license = budget
        .run(|| dbmod::get_license(pool, license_id))
        .await?
        .ok_or_else(|| AppError::NotFound("license".to_string()))?;

    let device = budget
        .run(|| dbmod::get_device(pool, license.device_id))
        .await?
        .ok_or_else(|| AppError::NotFound("device".to_string()))?;

    if guard::is_device_blocked(cache, config, &device.id.to_string()).await? {
        return Err(fail(pool, &license, ValidateFailure::Blocked, config, cache).await);
    }

    let now = Utc::now();
    match license.effective_status(now) {
        LicenseStatus::Revoked => return Err(fail(pool, &license, ValidateFailure::Revoked, config, cache).await),
        LicenseStatus::Expired => return Err(fail(pool, &license, ValidateFailure::Expired, config, cache).await),
        LicenseStatus::Active => {}
    }

    if presented_nonce != license.nonce {
        return Err(fail(pool, &license, ValidateFailure::NonceMismatch, config, cache).await);
    }

    let signed_ok = guard::check_signed_request(cache, config, &device, presented_nonce, signature_b64, timestamp)
        .await?;
    if !signed_ok {
        return Err(fail(pool, &license, ValidateFailure::SignatureInvalid, config, cache).await);
    }

    if grace_exceeded(&license, now, online) {
        return Err(fail(pool, &license, ValidateFailure::GraceExpired, config, cache).await);
    }

    let new_nonce = fresh_nonce();
    let advanced = budget
        .run(|| dbmod::advance_license_nonce(pool, license.id, &license.nonce, &new_nonce, now))
        .await?;
    if !advanced {
        // Lost the race to a concurrent Validate; the presented nonce is now stale.
        return Err(fail(pool, &license, ValidateFailure::NonceMismatch, config, cache).await);
    }

    guard::clear_validation_failures(cache, &device.id.to_string()).await?;
    budget.run(|| dbmod::touch_device(pool, device.id)).await?;

    Ok(ValidateOutcome { new_nonce, expires_at: license.expires_at })
}

async fn fail(
    pool: &Pool<Postgres>,
    license: &License,
    reason: ValidateFailure,
    config: &Config,
    cache: &ConnectionManager,
) -> AppError {
    let _ = dbmod::append_audit_log(
        pool,
        &license.device_id.to_string(),
        "license.validate",
        &license.id.to_string(),
        reason.code(),
        None,
        None,
    )
    .await;

    if reason != ValidateFailure::Blocked {
        if let Ok(blocked) = guard::record_validation_failure(cache, config, &license.device_id.to_string()).await {
            if blocked {
                tracing::warn!(device_id = %license.device_id, "device blocked after repeated validation failures");
            }
        }
    }

    reason.into()
}

/// `Renew(license) → License` (§4.7). May be called up to `renew_window` before
/// expiry; advances `expires_at` by `license_validity` and rotates the nonce.
pub async fn renew(
    pool: &Pool<Postgres>,
    config: &Config,
    budget: &WorkerPool,
    license_id: Uuid,
) -> Result<License, AppError> {
    budget
        .run(|| async move {
            let license = dbmod::get_license(pool, license_id)
                .await?
                .ok_or_else(|| AppError::NotFound("license".to_string()))?;

            let now = Utc::now();
            if license.effective_status(now) != LicenseStatus::Active {
                return Err(AppError::Conflict("license is not active".to_string()));
            }

            let renew_window = chrono::Duration::from_std(config.renew_window).unwrap();
            if license.expires_at - now > renew_window {
                return Err(AppError::InvalidArgument(format!(
                    "license can only be renewed within {} days of expiry",
                    config.renew_window.as_secs() / 86_400
                )));
            }

            let new_nonce = fresh_nonce();
            let new_expires_at = license.expires_at + chrono::Duration::from_std(config.license_validity).unwrap();
            dbmod::renew_license(pool, license.id, new_expires_at, &new_nonce).await?;

            dbmod::get_license(pool, license.id)
                .await?
                .ok_or_else(|| AppError::Internal("license disappeared after renewal".to_string()))
        })
        .await
}

/// `Revoke(license)`. Terminal and unconditional.
pub async fn revoke(pool: &Pool<Postgres>, budget: &WorkerPool, license_id: Uuid) -> Result<(), AppError> {
    budget.run(|| dbmod::revoke_license(pool, license_id)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_failure_codes_match_spec_vocabulary() {
        assert_eq!(ValidateFailure::Expired.code(), "LICENSE_EXPIRED");
        assert_eq!(ValidateFailure::NonceMismatch.code(), "INVALID_NONCE");
        assert_eq!(ValidateFailure::GraceExpired.code(), "LICENSE_OFFLINE_EXPIRED");
        assert_eq!(ValidateFailure::Blocked.code(), "DEVICE_BLOCKED");
    }

    fn grace_test_license(last_validated_at: DateTime<Utc>) -> License {
        License {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            material_id: Uuid::new_v4(),
            device_id: Uuid::new_v4(),
            status: "active".to_string(),
            expires_at: last_validated_at + chrono::Duration::days(30),
            offline_grace_period_secs: 72 * 3600,
            last_validated_at,
            nonce: "n".repeat(32),
            created_at: last_validated_at,
            revoked_at: None,
        }
    }

    // Scenario S5: a license last validated at T, presented offline at T+72h01m, is
    // past its offline grace period and must be rejected with GraceExpired.
    #[test]
    fn grace_exceeded_rejects_offline_call_past_72h_grace() {
        let last_validated_at = Utc::now() - chrono::Duration::hours(72) - chrono::Duration::minutes(1);
        let license = grace_test_license(last_validated_at);
        assert!(grace_exceeded(&license, Utc::now(), false));
    }

    #[test]
    fn grace_exceeded_allows_offline_call_within_grace() {
        let last_validated_at = Utc::now() - chrono::Duration::hours(1);
        let license = grace_test_license(last_validated_at);
        assert!(!grace_exceeded(&license, Utc::now(), false));
    }

    #[test]
    fn grace_exceeded_never_trips_for_an_online_call() {
        let last_validated_at = Utc::now() - chrono::Duration::hours(72) - chrono::Duration::minutes(1);
        let license = grace_test_license(last_validated_at);
        assert!(!grace_exceeded(&license, Utc::now(), true));
    }
}
