pub mod app_state;
pub mod config;
pub mod error;
pub mod flv;
pub mod ingest;
pub mod playlist;
pub mod registry;
mod routes;
pub mod session;
pub mod store;
pub mod transcoder;

use axum::Router;
use axum::extract::Extension;
use axum::http::{HeaderValue, Method};
use axum::routing::get;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

//
// Re-export
//
pub use app_state::AppState;
pub use config::Config;
pub use error::{IngestError, RegistryError, SegmentError, TranscoderError};
pub use flv::MediaFrame;
pub use ingest::IngestListener;
pub use registry::StreamRegistry;
pub use session::{Session, SessionState};
pub use store::{SegmentInfo, SegmentStore};
pub use transcoder::TranscoderSupervisor;

/// Build the playback/status router for a prepared state.
pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.allow_origin);

    Router::new()
        .route("/{app}/{filename}", get(routes::serve_stream))
        .route("/api/streams", get(routes::list_streams))
        .route("/api/streams/{key}", get(routes::stream_status))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(Extension(state))
}

fn cors_layer(allow_origin: &str) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods([Method::GET]).allow_headers(Any);
    if allow_origin == "*" {
        return cors.allow_origin(Any);
    }
    match allow_origin.parse::<HeaderValue>() {
        Ok(origin) => cors.allow_origin(origin),
        Err(_) => {
            warn!(%allow_origin, "Unparseable allow_origin, falling back to any");
            cors.allow_origin(Any)
        }
    }
}

/// Run both servers until one of them fails.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let state = AppState::new(config).await?;

    let ingest = IngestListener::new(
        state.config.clone(),
        state.registry.clone(),
        state.sessions_dir.clone(),
    );

    let http_addr = format!("0.0.0.0:{}", state.config.http_port);
    let http_listener = TcpListener::bind(&http_addr).await?;
    info!(%http_addr, "Playback API listening");

    let app = router(state);

    tokio::select! {
        result = axum::serve(http_listener, app) => {
            result?;
        }
        result = ingest.run() => {
            result?;
        }
    }
    Ok(())
}
