//! Query and control routes of the EPPO code provider.

use super::{enveloped, join_error, ApiError, App};
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::Json;
use refdata::{BuildOptions, Error, ProviderStore};
use std::sync::Arc;

pub fn router() -> axum::Router<Arc<App>> {
    axum::Router::new()
        .route("/health", get(health))
        .route("/code/:eppocode", get(get_code))
        .route("/name/:eppocode", get(get_name))
        .route("/search", get(search))
        .route("/fetch", post(trigger_fetch))
        .route("/rebuild", post(trigger_rebuild))
}

async fn health(State(app): State<Arc<App>>) -> Json<serde_json::Value> {
    let coordinator = app.eppo.clone();
    let body = tokio::task::spawn_blocking(move || coordinator.health())
        .await
        .unwrap_or_else(|_| serde_json::json!({"ok": false, "error": "health probe failed"}));
    Json(body)
}

#[derive(serde::Deserialize)]
struct CodeParams {
    lang: Option<String>,
}

async fn get_code(
    State(app): State<Arc<App>>,
    Path(eppocode): Path<String>,
    Query(params): Query<CodeParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = app.eppo.store()?;
    let (code, meta) = tokio::task::spawn_blocking(move || -> Result<_, Error> {
        let code = store.get_code(&eppocode, params.lang.as_deref())?;
        Ok((code, store.meta()?))
    })
    .await
    .map_err(join_error)??;

    let names = code.names.clone();
    let body = serde_json::json!({"code": code, "names": names});
    Ok(enveloped("eppo", &meta, app.eppo.last_fetch(), body))
}

#[derive(serde::Deserialize)]
struct NameParams {
    lang: Option<String>,
    country: Option<String>,
}

async fn get_name(
    State(app): State<Arc<App>>,
    Path(eppocode): Path<String>,
    Query(params): Query<NameParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Some(lang) = params.lang else {
        return Err(Error::BadRequest("missing required parameter: lang".to_string()).into());
    };

    let store = app.eppo.store()?;
    let (name, meta) = tokio::task::spawn_blocking(move || -> Result<_, Error> {
        let name = store.get_name(&eppocode, &lang, params.country.as_deref())?;
        Ok((name, store.meta()?))
    })
    .await
    .map_err(join_error)??;

    let body = serde_json::to_value(name).map_err(Error::from)?;
    Ok(enveloped("eppo", &meta, app.eppo.last_fetch(), body))
}

#[derive(serde::Deserialize)]
struct SearchParams {
    q: Option<String>,
    lang: Option<String>,
    country: Option<String>,
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
    let limit = params.limit.unwrap_or(100);
    let offset = params.offset.unwrap_or(0);

    let store = app.eppo.store()?;
    let (results, meta) = tokio::task::spawn_blocking(move || -> Result<_, Error> {
        let results = store.search(
            &q,
            params.lang.as_deref(),
            params.country.as_deref(),
            limit,
            offset,
        )?;
        Ok((results, store.meta()?))
    })
    .await
    .map_err(join_error)??;

    let body = serde_json::to_value(results).map_err(Error::from)?;
    Ok(enveloped("eppo", &meta, app.eppo.last_fetch(), body))
}

async fn trigger_fetch(State(app): State<Arc<App>>) -> Result<Json<serde_json::Value>, ApiError> {
    let meta = app.eppo.fetch().await?;
    Ok(Json(serde_json::json!({"ok": true, "meta": meta})))
}

#[derive(serde::Deserialize)]
struct RebuildBody {
    types: Option<String>,
}

async fn trigger_rebuild(
    State(app): State<Arc<App>>,
    body: Option<Json<RebuildBody>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let types = body
        .and_then(|Json(body)| body.types)
        .map(|types| refdata::parse_types(&types));

    let meta = app.eppo.rebuild(BuildOptions { types }).await?;
    Ok(Json(serde_json::json!({"ok": true, "meta": meta})))
}
