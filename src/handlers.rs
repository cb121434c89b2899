use crate::chat;
use crate::devices;
use crate::errors::{AppError, AppResult, Envelope};
use crate::license;
use crate::models::*;
use crate::AppState;
use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use uuid::Uuid;

/// Upstream (gateway/auth service) identity, forwarded as a header once a request has
/// already been authenticated; out of scope here per the core's external collaborators.
fn user_id(headers: &HeaderMap) -> AppResult<Uuid> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or(AppError::Unauthorized)
}

fn parse_uuid(raw: &str, what: &str) -> AppResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| AppError::InvalidArgument(format!("invalid {what}")))
}

// ============================================================
// Chat
// ============================================================

pub async fn chat_with_material(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(material_id): Path<String>,
    Json(req): Json<ChatRequest>,
) -> AppResult<Response> {
    let uid = user_id(&headers)?;
    let material_id = parse_uuid(&material_id, "material id")?;
    let scope = ChatScope::material(material_id);

    let outcome = chat::ask(
        &state.db,
        &state.config,
        &state.adapter,
        &state.vector,
        &state.db_budget,
        &state.config.chunk_collection,
        uid,
        scope,
        &req.message,
    )
    .await?;

    let response: ChatResponse = outcome.message.into();
    Ok((StatusCode::OK, Json(Envelope::ok(response))).into_response())
}

pub async fn chat_with_pod(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(pod_id): Path<String>,
    Json(req): Json<ChatRequest>,
) -> AppResult<Response> {
    let uid = user_id(&headers)?;
    let pod_id = parse_uuid(&pod_id, "pod id")?;
    let scope = ChatScope::pod(pod_id);

    let outcome = chat::ask(
        &state.db,
        &state.config,
        &state.adapter,
        &state.vector,
        &state.db_budget,
        &state.config.chunk_collection,
        uid,
        scope,
        &req.message,
    )
    .await?;

    let response: ChatResponse = outcome.message.into();
    Ok((StatusCode::OK, Json(Envelope::ok(response))).into_response())
}

pub async fn chat_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(material_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Response> {
    let uid = user_id(&headers)?;
    let material_id = parse_uuid(&material_id, "material id")?;
    let limit = query.limit.unwrap_or(20);
    let offset = query.offset.unwrap_or(0);

    let (messages, total) =
        chat::history(&state.db, &state.db_budget, uid, ChatScope::material(material_id), limit, offset).await?;
    let out: Vec<ChatResponse> = messages.into_iter().map(Into::into).collect();

    Ok((StatusCode::OK, Json(Envelope::paginated(out, limit, offset, total))).into_response())
}

pub async fn chat_suggestions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(material_id): Path<String>,
) -> AppResult<Response> {
    let uid = user_id(&headers)?;
    let material_id = parse_uuid(&material_id, "material id")?;

    let questions = chat::suggest(&state.db, &state.adapter, &state.db_budget, uid, material_id, 5).await?;
    Ok((StatusCode::OK, Json(Envelope::ok(SuggestionsResponse { questions }))).into_response())
}

pub async fn chat_export(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(material_id): Path<String>,
    Json(req): Json<ExportQuery>,
) -> AppResult<Response> {
    let uid = user_id(&headers)?;
    let material_id = parse_uuid(&material_id, "material id")?;

    let doc = chat::export(&state.db, &state.db_budget, uid, ChatScope::material(material_id), &req.format).await?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, doc.mime)
        .header(header::CONTENT_DISPOSITION, format!("attachment; filename=\"{}\"", doc.filename))
        .body(Body::from(doc.bytes))
        .unwrap())
}

pub async fn submit_feedback(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    Json(req): Json<FeedbackRequest>,
) -> AppResult<Response> {
    let message_id = parse_uuid(&message_id, "message id")?;
    let thumb: Feedback = req
        .feedback
        .parse()
        .map_err(|_| AppError::InvalidArgument("feedback must be 'thumbs_up' or 'thumbs_down'".to_string()))?;

    let message =
        chat::feedback(&state.db, &state.db_budget, message_id, thumb, req.feedback_text.as_deref()).await?;
    let response = FeedbackResponse { message: message.into() };
    Ok((StatusCode::OK, Json(Envelope::ok(response))).into_response())
}

// ============================================================
// Devices
// ============================================================

pub async fn register_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RegisterDeviceRequest>,
) -> AppResult<Response> {
    let uid = user_id(&headers)?;
    let device = devices::register(
        &state.db,
        &state.db_budget,
        uid,
        &req.fingerprint,
        &req.name,
        &req.platform,
        state.config.max_devices_per_user,
    )
    .await?;
    let response: DeviceResponse = device.into();
    Ok((StatusCode::CREATED, Json(Envelope::ok(response))).into_response())
}

pub async fn list_devices(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Response> {
    let uid = user_id(&headers)?;
    let list = devices::list(&state.db, &state.db_budget, uid).await?;
    let out: Vec<DeviceResponse> = list.into_iter().map(Into::into).collect();
    Ok((StatusCode::OK, Json(Envelope::ok(out))).into_response())
}

pub async fn deregister_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
) -> AppResult<StatusCode> {
    let uid = user_id(&headers)?;
    let device_id = parse_uuid(&device_id, "device id")?;
    devices::deregister(&state.db, &state.db_budget, uid, device_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================
// Licenses & offline delivery
// ============================================================

pub async fn issue_license(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(material_id): Path<String>,
    Json(req): Json<IssueLicenseRequest>,
) -> AppResult<Response> {
    let uid = user_id(&headers)?;
    let material_id = parse_uuid(&material_id, "material id")?;

    let lic = license::issue(
        &state.db,
        &state.config,
        state.access_checker.as_ref(),
        &state.db_budget,
        uid,
        material_id,
        req.device_id,
    )
    .await?;

    let wrapped_cek = crate::crypto::unwrap_cek_for_material(&state.db, &state.config, material_id).await?;

    let response = LicenseResponse { license: lic.into(), wrapped_cek };
    Ok((StatusCode::CREATED, Json(Envelope::ok(response))).into_response())
}

pub async fn validate_license(
    State(state): State<AppState>,
    Path(license_id): Path<String>,
    Json(req): Json<ValidateLicenseRequest>,
) -> AppResult<Response> {
    let license_id = parse_uuid(&license_id, "license id")?;

    // This HTTP endpoint is only reachable over the network, so it is always an online
    // call per §4.7(e) — see `license::validate`'s doc comment for the offline contract.
    let outcome = license::validate(
        &state.db,
        &state.cache,
        &state.config,
        &state.db_budget,
        license_id,
        &req.nonce,
        &req.signature,
        req.timestamp,
        true,
    )
    .await?;

    let response = ValidateLicenseResponse { new_nonce: outcome.new_nonce, expires_at: outcome.expires_at };
    Ok((StatusCode::OK, Json(Envelope::ok(response))).into_response())
}

pub async fn renew_license(State(state): State<AppState>, Path(license_id): Path<String>) -> AppResult<Response> {
    let license_id = parse_uuid(&license_id, "license id")?;
    let lic = license::renew(&state.db, &state.config, &state.db_budget, license_id).await?;
    let response: LicensePublic = lic.into();
    Ok((StatusCode::OK, Json(Envelope::ok(response))).into_response())
}

pub async fn download_material(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(material_id): Path<String>,
) -> AppResult<Response> {
    let uid = user_id(&headers)?;
    let material_id = parse_uuid(&material_id, "material id")?;

    crate::guard::allow_download(&state.cache, &state.config, &uid.to_string()).await?;

    let cek = state
        .db_budget
        .run(|| crate::db::find_active_cek(&state.db, material_id))
        .await?
        .ok_or_else(|| AppError::NotFound("encrypted material".to_string()))?;
    let encrypted = state
        .db_budget
        .run(|| crate::db::find_encrypted_material(&state.db, material_id, cek.id))
        .await?
        .ok_or_else(|| AppError::NotFound("encrypted material".to_string()))?;

    let key = crate::external::encrypted_object_key(&material_id.to_string(), cek.version);
    let download_url = state.object_store.presigned_get(&key, 300).await.map_err(|e| AppError::Unavailable(e.to_string()))?;

    let manifest: Manifest = serde_json::from_value(encrypted.manifest)
        .map_err(|e| AppError::Internal(format!("corrupt manifest: {e}")))?;
    let response = DownloadResponse { manifest, download_url };
    Ok((StatusCode::OK, Json(Envelope::ok(response))).into_response())
}

// ============================================================
// Provisioning (internal — not part of the public offline delivery surface)
// ============================================================

/// `ProvisionMaterial(material, sourceBytes) → EncryptedMaterial`. The missing third
/// leg of the §2 Offline data flow: without this, `issue_license`/`download_material`
/// have no CEK or encrypted object to hand out. Called by the materials pipeline once a
/// material's source is ready to ship offline, not by end-user clients.
pub async fn provision_material(
    State(state): State<AppState>,
    Path(material_id): Path<String>,
    body: Bytes,
) -> AppResult<Response> {
    let material_id = parse_uuid(&material_id, "material id")?;
    let encrypted = crate::crypto::provision_material(
        &state.db,
        &state.config,
        state.object_store.as_ref(),
        material_id,
        &body,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(Envelope::ok(encrypted))).into_response())
}

// ============================================================
// Health
// ============================================================

pub async fn health(State(state): State<AppState>) -> Response {
    let db = state.db.clone();
    let mut cache = state.cache.clone();

    let checks: Vec<(&'static str, std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send>>)> = vec![
        (
            "database",
            Box::pin(async move { sqlx::query("SELECT 1").execute(&db).await.map(|_| ()).map_err(|e| e.to_string()) }),
        ),
        (
            "cache",
            Box::pin(async move {
                redis::cmd("PING").query_async::<_, String>(&mut cache).await.map(|_| ()).map_err(|e| e.to_string())
            }),
        ),
    ];

    let report = crate::concurrency::aggregate_health(checks, state.config.health_deadline).await;
    let status = match report.status {
        crate::concurrency::HealthStatus::Healthy => StatusCode::OK,
        crate::concurrency::HealthStatus::Degraded => StatusCode::OK,
        crate::concurrency::HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(Envelope::ok(report))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_rejects_missing_header() {
        let headers = HeaderMap::new();
        assert!(matches!(user_id(&headers), Err(AppError::Unauthorized)));
    }

    #[test]
    fn user_id_rejects_non_uuid_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", "not-a-uuid".parse().unwrap());
        assert!(matches!(user_id(&headers), Err(AppError::Unauthorized)));
    }

    #[test]
    fn user_id_accepts_valid_uuid_header() {
        let id = Uuid::new_v4();
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", id.to_string().parse().unwrap());
        assert_eq!(user_id(&headers).unwrap(), id);
    }

    #[test]
    fn parse_uuid_rejects_garbage() {
        let err = parse_uuid("nope", "material id").unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(msg) if msg.contains("material id")));
    }
}
