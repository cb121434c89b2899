mod chat;
mod concurrency;
mod config;
mod crypto;
mod db;
mod devices;
mod errors;
mod external;
mod guard;
mod handlers;
mod license;
mod llm;
mod models;
mod vector;

use axum::{
    routing::{delete, get, post},
    Router,
};
use concurrency::WorkerPool;
use config::Config;
use external::{AccessChecker, HttpAccessChecker, HttpObjectStoreClient, ObjectStoreClient};
use llm::ModelAdapter;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use vector::VectorService;

/// Shared process state, handed to every handler through axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub db: sqlx::Pool<sqlx::Postgres>,
    pub cache: redis::aio::ConnectionManager,
    pub vector: Arc<VectorService>,
    pub adapter: Arc<ModelAdapter>,
    pub access_checker: Arc<dyn AccessChecker>,
    pub object_store: Arc<dyn ObjectStoreClient>,
    /// Database's own bounded worker budget (§4.10), separate from the vector/object-store/
    /// model/access-checker budgets each of those clients holds internally.
    pub db_budget: WorkerPool,
    pub config: Arc<Config>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let config = Config::load();

    tracing::info!("connecting to postgres...");
    let db_pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to postgres");

    db::init_schema(&db_pool).await.expect("failed to initialize database schema");
    tracing::info!("database schema ready");

    tracing::info!("connecting to redis...");
    let redis_client = redis::Client::open(config.redis_url.clone()).expect("failed to create redis client");
    let cache_manager = redis_client.get_connection_manager().await.expect("failed to connect to redis");
    tracing::info!("connected to redis");

    let vector_service =
        Arc::new(VectorService::new(config.vector_store_url.clone(), config.io_worker_capacity));
    if let Err(e) = vector_service.ensure_collection(&config.chunk_collection, 768).await {
        tracing::warn!("could not ensure vector collection (vector store may be unavailable): {}", e);
    } else {
        tracing::info!("vector store collection ready");
    }

    let adapter = Arc::new(ModelAdapter::new(config.clone()));
    let access_checker: Arc<dyn AccessChecker> =
        Arc::new(HttpAccessChecker::new(config.access_checker_url.clone(), config.io_worker_capacity));
    let object_store: Arc<dyn ObjectStoreClient> =
        Arc::new(HttpObjectStoreClient::new(config.object_store_url.clone(), config.io_worker_capacity));

    let app_state = AppState {
        db: db_pool.clone(),
        cache: cache_manager,
        vector: vector_service,
        adapter,
        access_checker,
        object_store,
        db_budget: WorkerPool::new(config.io_worker_capacity),
        config: Arc::new(config.clone()),
    };

    concurrency::spawn_maintenance_loop(db_pool, config.clone());

    let app = Router::new()
        .route("/materials/:id/chat", post(handlers::chat_with_material))
        .route("/pods/:id/chat", post(handlers::chat_with_pod))
        .route("/materials/:id/chat/history", get(handlers::chat_history))
        .route("/materials/:id/chat/suggestions", get(handlers::chat_suggestions))
        .route("/materials/:id/chat/export", post(handlers::chat_export))
        .route("/chat/:message_id/feedback", post(handlers::submit_feedback))
        .route("/offline/devices", post(handlers::register_device).get(handlers::list_devices))
        .route("/offline/devices/:id", delete(handlers::deregister_device))
        .route("/internal/materials/:id/encrypt", post(handlers::provision_material))
        .route("/offline/materials/:id/license", post(handlers::issue_license))
        .route("/offline/licenses/:id/validate", post(handlers::validate_license))
        .route("/offline/licenses/:id/renew", post(handlers::renew_license))
        .route("/offline/materials/:id/download", get(handlers::download_material))
        .route("/health", get(handlers::health))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(app_state);

    tracing::info!(bind_addr = %config.bind_addr, "listening");
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await.expect("failed to bind listener");
    axum::serve(listener, app).await.expect("server error");
}
