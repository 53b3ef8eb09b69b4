use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quizclash::engine::GameEngine;
use quizclash::providers::{
    sample_questions, NoopResultSink, StaticQuestionProvider, TrustedIdentityResolver,
};
use quizclash::store::InMemoryRoomStore;
use quizclash::sweeper;
use quizclash::types::EngineConfig;
use quizclash::ws::{self, RoomHub, WsState};

#[tokio::main]
async fn main() {
    // Load .env file if present (before any env var reads)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quizclash=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting quizclash...");

    let config = EngineConfig::from_env();
    let engine = Arc::new(GameEngine::new(
        Arc::new(InMemoryRoomStore::new()),
        Arc::new(StaticQuestionProvider::new().with_set("sample", sample_questions())),
        Arc::new(NoopResultSink),
        config,
    ));
    let hub = Arc::new(RoomHub::new());

    sweeper::spawn_room_sweeper(engine.clone(), hub.clone());

    let state = Arc::new(WsState {
        engine,
        hub,
        identity: Arc::new(TrustedIdentityResolver),
    });

    let app = Router::new()
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let port = std::env::var("QUIZCLASH_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(7481);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
