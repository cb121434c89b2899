use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Either a single material or a whole pod; determines retrieval filter and session identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatMode {
    Material,
    Pod,
}

/// The retrieval/session scope a chat request targets. Exactly one field is set.
#[derive(Debug, Clone, Copy)]
pub struct ChatScope {
    pub material_id: Option<Uuid>,
    pub pod_id: Option<Uuid>,
}

impl ChatScope {
    pub fn material(id: Uuid) -> Self {
        ChatScope { material_id: Some(id), pod_id: None }
    }

    pub fn pod(id: Uuid) -> Self {
        ChatScope { material_id: None, pod_id: Some(id) }
    }

    pub fn mode(&self) -> ChatMode {
        if self.material_id.is_some() { ChatMode::Material } else { ChatMode::Pod }
    }

    /// Filename-safe identifier used in export filenames and retrieval filters.
    pub fn slug(&self) -> String {
        match (self.material_id, self.pod_id) {
            (Some(m), _) => format!("material-{m}"),
            (_, Some(p)) => format!("pod-{p}"),
            _ => "unknown".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChatSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub material_id: Option<Uuid>,
    pub pod_id: Option<Uuid>,
    pub mode: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn scope(&self) -> ChatScope {
        ChatScope { material_id: self.material_id, pod_id: self.pod_id }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feedback {
    ThumbsUp,
    ThumbsDown,
}

impl std::fmt::Display for Feedback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Feedback::ThumbsUp => write!(f, "thumbs_up"),
            Feedback::ThumbsDown => write!(f, "thumbs_down"),
        }
    }
}

impl std::str::FromStr for Feedback {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "thumbs_up" => Ok(Feedback::ThumbsUp),
            "thumbs_down" => Ok(Feedback::ThumbsDown),
            other => Err(format!("unknown feedback kind '{other}'")),
        }
    }
}

/// Denormalized snapshot of retrieval evidence at response time; never updated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkSource {
    pub material_id: Uuid,
    pub chunk_index: i32,
    pub text: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub sources: Vec<ChunkSource>,
    pub feedback: Option<Feedback>,
    pub feedback_text: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A chunk of a learning material's text with its embedding; the unit of retrieval.
/// Lives in the vector store, not Postgres.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialChunk {
    pub id: String,
    pub material_id: Uuid,
    pub pod_id: Option<Uuid>,
    pub chunk_index: i32,
    pub text: String,
    #[serde(default)]
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: Uuid,
    pub user_id: Uuid,
    pub fingerprint: String,
    pub name: String,
    pub platform: String,
    pub last_used_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    /// HMAC key used to verify this device's request signatures. Never serialized to clients.
    #[serde(skip_serializing)]
    pub signing_key: String,
}

impl Device {
    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseStatus {
    Active,
    Expired,
    Revoked,
}

impl std::fmt::Display for LicenseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LicenseStatus::Active => write!(f, "active"),
            LicenseStatus::Expired => write!(f, "expired"),
            LicenseStatus::Revoked => write!(f, "revoked"),
        }
    }
}

impl std::str::FromStr for LicenseStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(LicenseStatus::Active),
            "expired" => Ok(LicenseStatus::Expired),
            "revoked" => Ok(LicenseStatus::Revoked),
            other => Err(format!("unknown license status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct License {
    pub id: Uuid,
    pub user_id: Uuid,
    pub material_id: Uuid,
    pub device_id: Uuid,
    pub status: String,
    pub expires_at: DateTime<Utc>,
    pub offline_grace_period_secs: i64,
    pub last_validated_at: DateTime<Utc>,
    pub nonce: String,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl License {
    pub fn offline_validity_deadline(&self) -> DateTime<Utc> {
        let grace = chrono::Duration::seconds(self.offline_grace_period_secs);
        std::cmp::min(self.expires_at, self.last_validated_at + grace)
    }

    /// Lazily evaluates the time-triggered `active -> expired` transition (§4.7).
    pub fn effective_status(&self, now: DateTime<Utc>) -> LicenseStatus {
        let stored: LicenseStatus = self.status.parse().unwrap_or(LicenseStatus::Expired);
        if stored == LicenseStatus::Active && now >= self.expires_at {
            LicenseStatus::Expired
        } else {
            stored
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Cek {
    pub id: Uuid,
    pub material_id: Uuid,
    pub version: i32,
    pub wrapped_key: String,
    pub kek_version: i32,
    pub created_at: DateTime<Utc>,
    pub retired_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestChunk {
    pub index: i32,
    pub offset: i64,
    pub length: i64,
    pub iv: String,
    pub tag: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub chunk_count: i32,
    pub chunk_size: i64,
    pub kek_version: i32,
    pub cek_version: i32,
    pub per_chunk: Vec<ManifestChunk>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EncryptedMaterial {
    pub id: Uuid,
    pub material_id: Uuid,
    pub cek_id: Uuid,
    pub manifest: serde_json::Value,
    pub encrypted_object_ref: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditLog {
    pub id: Uuid,
    pub actor: String,
    pub action: String,
    pub subject: String,
    pub result: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Question generated for `Suggest`, tagged per §9's strict-schema resolution of the
/// free-form question-generation response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Question {
    MultipleChoice { question: String, options: Vec<String>, answer: String, explanation: Option<String> },
    TrueFalse { question: String, answer: bool, explanation: Option<String> },
    ShortAnswer { question: String, answer: String, explanation: Option<String> },
}

impl Question {
    pub fn text(&self) -> &str {
        match self {
            Question::MultipleChoice { question, .. } => question,
            Question::TrueFalse { question, .. } => question,
            Question::ShortAnswer { question, .. } => question,
        }
    }
}

// ---- HTTP DTOs ----

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub sources: Vec<ChunkSource>,
    pub created_at: DateTime<Utc>,
}

impl From<ChatMessage> for ChatResponse {
    fn from(m: ChatMessage) -> Self {
        ChatResponse { id: m.id, role: m.role, content: m.content, sources: m.sources, created_at: m.created_at }
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct SuggestionsResponse {
    pub questions: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    pub format: String,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub feedback: String,
    pub feedback_text: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FeedbackResponse {
    pub message: ChatResponse,
}

#[derive(Debug, Deserialize)]
pub struct RegisterDeviceRequest {
    pub fingerprint: String,
    pub name: String,
    pub platform: String,
}

#[derive(Debug, Serialize)]
pub struct DeviceResponse {
    pub id: Uuid,
    pub fingerprint: String,
    pub name: String,
    pub platform: String,
    pub last_used_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl From<Device> for DeviceResponse {
    fn from(d: Device) -> Self {
        DeviceResponse {
            id: d.id,
            fingerprint: d.fingerprint,
            name: d.name,
            platform: d.platform,
            last_used_at: d.last_used_at,
            created_at: d.created_at,
            revoked_at: d.revoked_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct IssueLicenseRequest {
    pub device_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct LicenseResponse {
    pub license: LicensePublic,
    pub wrapped_cek: String,
}

#[derive(Debug, Serialize)]
pub struct LicensePublic {
    pub id: Uuid,
    pub material_id: Uuid,
    pub device_id: Uuid,
    pub status: String,
    pub expires_at: DateTime<Utc>,
    pub nonce: String,
}

impl From<License> for LicensePublic {
    fn from(l: License) -> Self {
        LicensePublic {
            id: l.id,
            material_id: l.material_id,
            device_id: l.device_id,
            status: l.status,
            expires_at: l.expires_at,
            nonce: l.nonce,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ValidateLicenseRequest {
    pub nonce: String,
    pub signature: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ValidateLicenseResponse {
    pub new_nonce: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct DownloadResponse {
    pub manifest: Manifest,
    pub download_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_scope_slug_distinguishes_material_and_pod() {
        let m = Uuid::new_v4();
        let scope = ChatScope::material(m);
        assert_eq!(scope.slug(), format!("material-{m}"));
        assert_eq!(scope.mode(), ChatMode::Material);
    }

    #[test]
    fn message_role_round_trips_through_str() {
        assert_eq!("user".parse::<MessageRole>().unwrap(), MessageRole::User);
        assert_eq!("assistant".parse::<MessageRole>().unwrap(), MessageRole::Assistant);
        assert!("bogus".parse::<MessageRole>().is_err());
    }

    #[test]
    fn feedback_serializes_as_snake_case() {
        let json = serde_json::to_string(&Feedback::ThumbsDown).unwrap();
        assert_eq!(json, "\"thumbs_down\"");
    }

    #[test]
    fn license_effective_status_lazily_expires() {
        let now = Utc::now();
        let l = License {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            material_id: Uuid::new_v4(),
            device_id: Uuid::new_v4(),
            status: "active".to_string(),
            expires_at: now - chrono::Duration::seconds(1),
            offline_grace_period_secs: 3600,
            last_validated_at: now - chrono::Duration::hours(1),
            nonce: "n".repeat(32),
            created_at: now,
            revoked_at: None,
        };
        assert_eq!(l.effective_status(now), LicenseStatus::Expired);
    }

    #[test]
    fn license_offline_validity_deadline_is_the_tighter_bound() {
        let now = Utc::now();
        let l = License {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            material_id: Uuid::new_v4(),
            device_id: Uuid::new_v4(),
            status: "active".to_string(),
            expires_at: now + chrono::Duration::days(30),
            offline_grace_period_secs: 3600,
            last_validated_at: now,
            nonce: "n".repeat(32),
            created_at: now,
            revoked_at: None,
        };
        assert_eq!(l.offline_validity_deadline(), now + chrono::Duration::hours(1));
    }

    #[test]
    fn question_tagged_enum_round_trips() {
        let q = Question::TrueFalse { question: "Is Rust memory safe?".to_string(), answer: true, explanation: None };
        let json = serde_json::to_string(&q).unwrap();
        assert!(json.contains("\"type\":\"true_false\""));
        let back: Question = serde_json::from_str(&json).unwrap();
        assert_eq!(back.text(), "Is Rust memory safe?");
    }
}
