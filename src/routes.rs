use crate::AppState;
use crate::error::SegmentError;
use axum::body::Body;
use axum::extract::{Extension, Path as AxumPath};
use axum::http::{Response, StatusCode, header};
use axum::response::{IntoResponse, Json};
use chrono::{DateTime, Utc};
use mime_guess::from_path;
use serde::Serialize;
use std::convert::Infallible;
use tracing::{debug, warn};

const MANIFEST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

#[derive(Serialize)]
pub(crate) struct StreamsResponse {
    pub(crate) streams: Vec<String>,
}

#[derive(Serialize)]
pub(crate) struct StreamStatusResponse {
    pub(crate) key: String,
    pub(crate) state: String,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) next_sequence: u64,
    pub(crate) ingest_url: String,
    pub(crate) playback_url: String,
}

/// `GET /{app}/{key}.m3u8` and `GET /{app}/{key}-{seq}.ts`.
pub(crate) async fn serve_stream(
    Extension(state): Extension<AppState>,
    AxumPath((app, filename)): AxumPath<(String, String)>,
) -> Result<Response<Body>, Infallible> {
    if app != state.config.app_name {
        debug!(%app, "Unknown application");
        return Ok(not_found());
    }

    if let Some(key) = filename.strip_suffix(".m3u8") {
        return Ok(serve_manifest(&state, key));
    }

    if let Some(stem) = filename.strip_suffix(".ts") {
        let Some((key, sequence)) = split_segment_name(stem) else {
            warn!(%filename, "Invalid segment name");
            return Ok(bad_request());
        };
        return Ok(serve_segment(&state, key, sequence, &filename));
    }

    warn!(%filename, "Invalid filename");
    Ok(bad_request())
}

fn serve_manifest(state: &AppState, key: &str) -> Response<Body> {
    let Ok(session) = state.registry.lookup(key) else {
        debug!(%key, "Manifest requested for unknown stream");
        return not_found();
    };
    let Some(manifest) = session.store().manifest() else {
        // registered but nothing published yet
        debug!(%key, "Manifest requested before first segment");
        return not_found();
    };

    // short-lived relative to the segment cadence so players re-poll
    let max_age = (state.config.segment_duration / 2).max(1);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, MANIFEST_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, format!("public,max-age={max_age}"))
        .body(Body::from(manifest.as_str().to_owned()))
        .unwrap()
}

fn serve_segment(state: &AppState, key: &str, sequence: u64, filename: &str) -> Response<Body> {
    let Ok(session) = state.registry.lookup(key) else {
        debug!(%key, "Segment requested for unknown stream");
        return not_found();
    };

    match session.store().segment(sequence) {
        Ok(data) => Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                from_path(filename).first_or_octet_stream().to_string(),
            )
            // a published segment's bytes never change
            .header(header::CACHE_CONTROL, "public,max-age=3600")
            .body(Body::from(data))
            .unwrap(),
        Err(SegmentError::Expired(sequence)) => {
            debug!(%key, sequence, "Segment fell out of the window");
            Response::builder()
                .status(StatusCode::GONE)
                .body(Body::from("Segment expired"))
                .unwrap()
        }
        Err(SegmentError::NotFound(sequence)) => {
            debug!(%key, sequence, "Segment not yet published");
            not_found()
        }
    }
}

#[axum::debug_handler]
pub(crate) async fn list_streams(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let mut streams = state.registry.active_keys();
    streams.sort();
    (StatusCode::OK, Json(StreamsResponse { streams }))
}

#[axum::debug_handler]
pub(crate) async fn stream_status(
    Extension(state): Extension<AppState>,
    AxumPath(key): AxumPath<String>,
) -> Response<Body> {
    let Ok(session) = state.registry.lookup(&key) else {
        return not_found();
    };

    (
        StatusCode::OK,
        Json(StreamStatusResponse {
            state: session.state().to_string(),
            created_at: session.created_at(),
            next_sequence: session.store().next_sequence(),
            ingest_url: state.config.ingest_url(&key),
            playback_url: state.config.playback_url(&key),
            key,
        }),
    )
        .into_response()
}

/// Splits `{key}-{seq}` on the last dash; keys may themselves contain dashes.
fn split_segment_name(stem: &str) -> Option<(&str, u64)> {
    let (key, sequence) = stem.rsplit_once('-')?;
    if key.is_empty() {
        return None;
    }
    Some((key, sequence.parse().ok()?))
}

fn not_found() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::from("Not found"))
        .unwrap()
}

fn bad_request() -> Response<Body> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .body(Body::from("Invalid filename"))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_name_parsing() {
        assert_eq!(split_segment_name("mystream-12"), Some(("mystream", 12)));
        assert_eq!(split_segment_name("my-stream-0"), Some(("my-stream", 0)));
        assert_eq!(split_segment_name("nodash"), None);
        assert_eq!(split_segment_name("-5"), None);
        assert_eq!(split_segment_name("key-notanumber"), None);
    }
}
