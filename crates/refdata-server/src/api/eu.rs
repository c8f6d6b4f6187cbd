//! Query and control routes of the EU active-substance provider.

use super::{enveloped, join_error, ApiError, App};
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::Json;
use refdata::{BuildOptions, Error, ProviderStore};
use std::sync::Arc;

pub fn router() -> axum::Router<Arc<App>> {
    axum::Router::new()
        .route("/health", get(health))
        .route("/substance/:id", get(get_substance))
        .route("/cas/:cas", get(get_by_cas))
        .route("/search", get(search))
        .route("/fetch", post(trigger_fetch))
        .route("/rebuild", post(trigger_rebuild))
}

async fn health(State(app): State<Arc<App>>) -> Json<serde_json::Value> {
    let coordinator = app.eu.clone();
    let body = tokio::task::spawn_blocking(move || coordinator.health())
        .await
        .unwrap_or_else(|_| serde_json::json!({"ok": false, "error": "health probe failed"}));
    Json(body)
}

async fn get_substance(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id: i64 = id
        .parse()
        .map_err(|_| Error::BadRequest("substance id must be an integer".to_string()))?;

    let store = app.eu.store()?;
    let (substance, meta) = tokio::task::spawn_blocking(move || -> Result<_, Error> {
        Ok((store.get_substance(id)?, store.meta()?))
    })
    .await
    .map_err(join_error)??;

    Ok(enveloped("eu", &meta, app.eu.last_fetch(), substance))
}

async fn get_by_cas(
    State(app): State<Arc<App>>,
    Path(cas): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = app.eu.store()?;
    let (substance, meta) = tokio::task::spawn_blocking(move || -> Result<_, Error> {
        Ok((store.get_by_cas(&cas)?, store.meta()?))
    })
    .await
    .map_err(join_error)??;

    Ok(enveloped("eu", &meta, app.eu.last_fetch(), substance))
}

#[derive(serde::Deserialize)]
struct SearchParams {
    q: Option<String>,
    status: Option<String>,
    category: Option<String>,
    #[serde(rename = "includeOther")]
    include_other: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn search(
    State(app): State<Arc<App>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Some(q) = params.q else {
        return Err(Error::BadRequest("missing required parameter: q".to_string()).into());
    };
    // Absent means widened; anything other than "true"/"1" disables it.
    let include_other = match params.include_other.as_deref() {
        None => true,
        Some(v) => v == "true" || v == "1",
    };
    let limit = params.limit.unwrap_or(100);
    let offset = params.offset.unwrap_or(0);

    let store = app.eu.store()?;
    let (results, meta) = tokio::task::spawn_blocking(move || -> Result<_, Error> {
        let results = store.search(
            &q,
            params.status.as_deref(),
            params.category.as_deref(),
            include_other,
            limit,
            offset,
        )?;
        Ok((results, store.meta()?))
    })
    .await
    .map_err(join_error)??;

    let body = serde_json::to_value(results).map_err(Error::from)?;
    Ok(enveloped("eu", &meta, app.eu.last_fetch(), body))
}

async fn trigger_fetch(State(app): State<Arc<App>>) -> Result<Json<serde_json::Value>, ApiError> {
    let meta = app.eu.fetch().await?;
    Ok(Json(serde_json::json!({"ok": true, "meta": meta})))
}

async fn trigger_rebuild(State(app): State<Arc<App>>) -> Result<Json<serde_json::Value>, ApiError> {
    let meta = app.eu.rebuild(BuildOptions::default()).await?;
    Ok(Json(serde_json::json!({"ok": true, "meta": meta})))
}
