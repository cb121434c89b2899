use crate::concurrency::WorkerPool;
use crate::config::Config;
use crate::db as dbmod;
use crate::errors::AppError;
use crate::llm::{ModelAdapter, ModelError, ModelErrorKind};
use crate::models::{ChatMessage, ChatScope, ChunkSource, MessageRole};
use crate::vector::{self, VectorService};
use sqlx::{Pool, Postgres};
use uuid::Uuid;

const SYSTEM_PROMPT: &str = "You are a study assistant. Answer only from the provided context. \
If the context does not contain the answer, say you don't know rather than guessing.";

const MAX_CONTEXT_RETRIES: u32 = 3;

pub struct AskOutcome {
    pub message: ChatMessage,
    pub sources: Vec<ChunkSource>,
}

fn build_context(sources: &[ChunkSource]) -> String {
    let mut out = String::from("Context:\n");
    for (i, s) in sources.iter().enumerate() {
        out.push_str(&format!("[{}] {}\n", i + 1, s.text));
    }
    out
}

/// `Ask(session, text) → ChatMessage` (§4.3). Opens/touches the session, retrieves
/// context, asks the model, and persists both turns. On `ContextTooLong`, drops the
/// lowest-scored chunk and retries up to `MAX_CONTEXT_RETRIES` times before giving up
/// with `ResourceExhausted`.
#[allow(clippy::too_many_arguments)]
pub async fn ask(
    pool: &Pool<Postgres>,
    config: &Config,
    adapter: &ModelAdapter,
    vector_service: &VectorService,
    budget: &WorkerPool,
    collection: &str,
    user_id: Uuid,
    scope: ChatScope,
    text: &str,
) -> Result<AskOutcome, AppError> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.chars().count() > 2000 {
        return Err(AppError::InvalidArgument("message must be 1..=2000 characters".to_string()));
    }

    let session = budget.run(|| dbmod::open_session(pool, user_id, scope)).await?;
    budget
        .run(|| dbmod::append_message(pool, session.id, MessageRole::User, trimmed, Vec::new()))
        .await?;

    let mut sources = vector::retrieve(
        adapter,
        vector_service,
        collection,
        trimmed,
        scope,
        config.retrieval_default_k,
        config,
    )
    .await?;

    let mut attempt = 0u32;
    let answer = loop {
        let context = if sources.is_empty() { None } else { Some(build_context(&sources)) };
        match adapter.complete(SYSTEM_PROMPT, trimmed, context.as_deref(), 0.7, 1000).await {
            Ok(answer) => break answer,
            Err(ModelError { kind: ModelErrorKind::ContextTooLong, .. }) if attempt < MAX_CONTEXT_RETRIES && !sources.is_empty() => {
                attempt += 1;
                // Drop the weakest chunk (sources are sorted descending by score) and retry.
                sources.pop();
                tracing::warn!(session_id = %session.id, attempt, "context too long, dropping lowest-scored chunk");
            }
            Err(_) if attempt >= MAX_CONTEXT_RETRIES => {
                return Err(AppError::ResourceExhausted(
                    "CONTEXT_TOO_LONG".to_string(),
                    serde_json::json!({"attempts": attempt}),
                ));
            }
            Err(e) => return Err(AppError::from(e)),
        }
    };

    let message = budget
        .run(|| dbmod::append_message(pool, session.id, MessageRole::Assistant, &answer, sources.clone()))
        .await?;

    Ok(AskOutcome { message, sources })
}

pub async fn history(
    pool: &Pool<Postgres>,
    budget: &WorkerPool,
    user_id: Uuid,
    scope: ChatScope,
    limit: i64,
    offset: i64,
) -> Result<(Vec<ChatMessage>, i64), AppError> {
    let session = budget.run(|| dbmod::open_session(pool, user_id, scope)).await?;
    Ok(budget
        .run(|| dbmod::list_messages(pool, session.id, limit.clamp(1, 200), offset.max(0)))
        .await?)
}

/// `Feedback(message, thumb) → ChatMessage` (§4.4). Mutable-overwrite: repeated calls
/// replace the prior value rather than being rejected.
pub async fn feedback(
    pool: &Pool<Postgres>,
    budget: &WorkerPool,
    message_id: Uuid,
    thumb: crate::models::Feedback,
    feedback_text: Option<&str>,
) -> Result<ChatMessage, AppError> {
    budget
        .run(|| dbmod::set_feedback(pool, message_id, thumb, feedback_text))
        .await?
        .ok_or_else(|| AppError::NotFound("message".to_string()))
}

/// `Suggest(material) → []string` (§4.4). Generates candidate follow-up questions from
/// the material's accumulated assistant answers; falls back to an empty list rather than
/// failing the request if no answers exist yet.
pub async fn suggest(
    pool: &Pool<Postgres>,
    adapter: &ModelAdapter,
    budget: &WorkerPool,
    user_id: Uuid,
    material_id: Uuid,
    n: usize,
) -> Result<Vec<String>, AppError> {
    let answers = budget
        .run(|| dbmod::list_assistant_messages_for_material(pool, user_id, material_id))
        .await?;
    if answers.is_empty() {
        return Ok(Vec::new());
    }

    let corpus = answers.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join("\n\n");
    let questions = adapter
        .generate_questions(&corpus, n, "short_answer")
        .await
        .map_err(AppError::from)?;

    Ok(questions.iter().map(|q| q.text().to_string()).collect())
}

fn build_markdown(scope: ChatScope, messages: &[ChatMessage]) -> String {
    let mut out = format!("# Chat transcript — {}\n\n", scope.slug());
    for m in messages {
        let heading = match m.role {
            MessageRole::User => "**You**",
            MessageRole::Assistant => "**Assistant**",
        };
        out.push_str(&format!("{heading}: {}\n\n", m.content));
    }
    out
}

/// Lays the transcript out as plain text paragraphs across as many A4 pages as needed.
/// No rich markdown rendering — headings and turn labels stay as literal text lines.
fn render_pdf(markdown: &str) -> Vec<u8> {
    use printpdf::{BuiltinFont, Mm, PdfDocument};

    const PAGE_WIDTH: Mm = Mm(210.0);
    const PAGE_HEIGHT: Mm = Mm(297.0);
    const LINE_HEIGHT_MM: f64 = 6.0;
    const TOP_MARGIN_MM: f64 = 280.0;
    const BOTTOM_MARGIN_MM: f64 = 15.0;
    const FONT_SIZE: f64 = 11.0;

    let (doc, page1, layer1) = PdfDocument::new("chat-export", PAGE_WIDTH, PAGE_HEIGHT, "content");
    let font = doc.add_builtin_font(BuiltinFont::Helvetica).expect("builtin font is always available");

    let mut page_idx = page1;
    let mut layer_idx = layer1;
    let mut y = TOP_MARGIN_MM;

    for raw_line in markdown.lines() {
        if y < BOTTOM_MARGIN_MM {
            let (next_page, next_layer) = doc.add_page(PAGE_WIDTH, PAGE_HEIGHT, "content");
            page_idx = next_page;
            layer_idx = next_layer;
            y = TOP_MARGIN_MM;
        }
        let layer = doc.get_page(page_idx).get_layer(layer_idx);
        layer.use_text(raw_line, FONT_SIZE as f32, Mm(15.0), Mm(y as f32), &font);
        y -= LINE_HEIGHT_MM;
    }

    let mut bytes = Vec::new();
    doc.save(&mut std::io::BufWriter::new(std::io::Cursor::new(&mut bytes)))
        .expect("in-memory PDF write never fails");
    bytes
}

pub struct ExportedDocument {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub mime: &'static str,
}

/// `Export(user, scope, format) → (bytes, filename, mime)` (§4.4). Read-only: never
/// mutates history. `filename` follows `chat-{scope-slug}-{yyyymmdd-hhmmss}.{ext}`.
pub async fn export(
    pool: &Pool<Postgres>,
    budget: &WorkerPool,
    user_id: Uuid,
    scope: ChatScope,
    format: &str,
) -> Result<ExportedDocument, AppError> {
    let session = budget.run(|| dbmod::open_session(pool, user_id, scope)).await?;
    let messages = budget.run(|| dbmod::list_all_messages(pool, session.id)).await?;
    let markdown = build_markdown(scope, &messages);

    let timestamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
    let slug = scope.slug();

    match format {
        "markdown" => Ok(ExportedDocument {
            bytes: markdown.into_bytes(),
            filename: format!("chat-{slug}-{timestamp}.md"),
            mime: "text/markdown",
        }),
        "pdf" => Ok(ExportedDocument {
            bytes: render_pdf(&markdown),
            filename: format!("chat-{slug}-{timestamp}.pdf"),
            mime: "application/pdf",
        }),
        other => Err(AppError::InvalidArgument(format!("unsupported export format '{other}', expected 'pdf' or 'markdown'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn build_context_numbers_each_chunk() {
        let sources = vec![
            ChunkSource { material_id: Uuid::nil(), chunk_index: 0, text: "first".to_string(), score: 0.9 },
            ChunkSource { material_id: Uuid::nil(), chunk_index: 1, text: "second".to_string(), score: 0.5 },
        ];
        let context = build_context(&sources);
        assert!(context.contains("[1] first"));
        assert!(context.contains("[2] second"));
    }
}
