use crate::{
    config::{ConfigSource, WallConfig},
    error::AppError,
    health::HealthStats,
    ingest::IngestEvent,
    server::InboundEvent,
    state::AppState,
};
use axum::{
    body::Body,
    extract::{Path as UrlPath, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Component, Path, PathBuf};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

pub async fn root_handler() -> &'static str {
    "screenpool photo wall server"
}

pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let ready = state.server.store().read().await.ready_items().len();
    Json(json!({
        "status": "ok",
        "epoch": state.server.epoch(),
        "ready_items": ready,
        "connections": state.server.hub().len(),
    }))
}

pub async fn stats_handler(State(state): State<AppState>) -> Json<HealthStats> {
    Json(state.server.stats().await)
}

pub async fn config_handler(State(state): State<AppState>) -> Json<WallConfig> {
    Json(state.config.wall())
}

async fn dispatch(state: &AppState, event: InboundEvent) -> Result<(), AppError> {
    state
        .inbound
        .send(event)
        .await
        .map_err(|_| AppError::Internal(anyhow::anyhow!("event dispatcher is not running")))
}

pub async fn rescan_handler(State(state): State<AppState>) -> Result<StatusCode, AppError> {
    info!("Full rescan requested over HTTP");
    dispatch(&state, InboundEvent::Ingest(IngestEvent::RescanAll)).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
pub struct ReloadQuery {
    pub delay_ms: Option<u64>,
}

pub async fn reload_displays_handler(
    State(state): State<AppState>,
    Query(query): Query<ReloadQuery>,
) -> Result<StatusCode, AppError> {
    dispatch(
        &state,
        InboundEvent::ReloadDisplays {
            delay_ms: query.delay_ms,
        },
    )
    .await?;
    Ok(StatusCode::ACCEPTED)
}

/// Resolve a request path below the cache root, refusing anything that could escape it
fn rendition_path(cache_dir: &Path, requested: &str) -> Option<PathBuf> {
    let relative = Path::new(requested);
    if requested.is_empty() || !relative.components().all(|c| matches!(c, Component::Normal(_))) {
        return None;
    }
    Some(cache_dir.join(relative))
}

pub async fn serve_rendition(
    State(state): State<AppState>,
    UrlPath(path): UrlPath<String>,
) -> Result<Response, AppError> {
    let cache_dir = &state.server.pipeline().settings().cache_dir;
    let file_path = rendition_path(cache_dir, &path).ok_or(AppError::NotFound)?;

    let file = match File::open(&file_path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No rendition at {:?}", file_path);
            return Err(AppError::NotFound);
        }
        Err(e) => return Err(AppError::Io(e)),
    };
    let len = file.metadata().await?.len();

    let body = Body::from_stream(ReaderStream::with_capacity(file, 64 * 1024));
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/jpeg".to_string()),
            (header::CONTENT_LENGTH, len.to_string()),
            (header::CACHE_CONTROL, "public, max-age=31536000, immutable".to_string()),
        ],
        body,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rendition_path_stays_in_cache() {
        let cache = Path::new("/var/cache/screenpool");
        assert_eq!(
            rendition_path(cache, "party/a.jpg"),
            Some(PathBuf::from("/var/cache/screenpool/party/a.jpg"))
        );
        assert_eq!(rendition_path(cache, "../secrets.jpg"), None);
        assert_eq!(rendition_path(cache, "party/../../x.jpg"), None);
        assert_eq!(rendition_path(cache, "/etc/passwd"), None);
        assert_eq!(rendition_path(cache, ""), None);
    }
}
