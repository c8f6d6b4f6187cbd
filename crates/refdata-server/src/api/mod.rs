use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use refdata::{Coordinator, Error};
use std::collections::BTreeMap;
use std::sync::Arc;

pub mod eppo;
pub mod eu;

/// Shared handler state: one coordinator per provider.
pub struct App {
    pub eppo: Coordinator<refdata::eppo::Source>,
    pub eu: Coordinator<refdata::eu::Source>,
}

/// Build the query API router: one sub-router per provider, request
/// tracing, and the reverse-proxy rejection guard.
pub fn build_router(app: Arc<App>) -> axum::Router<()> {
    axum::Router::new()
        .nest("/eppo", eppo::router())
        .nest("/eu", eu::router())
        .layer(axum::middleware::from_fn(reject_forwarded))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(app)
}

/// The service is meant to be reached directly, never through a reverse
/// proxy: requests bearing forwarded-address headers are refused.
async fn reject_forwarded(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    for header in ["forwarded", "x-forwarded-for", "x-real-ip"] {
        if req.headers().contains_key(header) {
            return (
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({"error": "forwarded requests are not accepted"})),
            )
                .into_response();
        }
    }
    next.run(req).await
}

/// Error wrapper mapping the library's error kinds onto HTTP responses.
/// Request-cycle sentinels (already in progress, peer lock, upstream
/// failure) are not HTTP errors: they answer 200 with a negative `ok`.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> ApiError {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        match &self.0 {
            Error::NotReady { fetching, building } => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "ok": false,
                    "error": self.0.to_string(),
                    "fetching": fetching,
                    "rebuilding": building,
                })),
            )
                .into_response(),
            Error::NotFound => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({"error": "not found"})),
            )
                .into_response(),
            Error::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": message})),
            )
                .into_response(),
            err if err.is_sentinel() => (
                StatusCode::OK,
                Json(serde_json::json!({"ok": false, "error": err.to_string()})),
            )
                .into_response(),
            Error::Upstream(_) | Error::Http(_) | Error::Build(_) => {
                tracing::warn!(error = %self.0, "pipeline operation failed");
                (
                    StatusCode::OK,
                    Json(serde_json::json!({"ok": false, "error": self.0.to_string()})),
                )
                    .into_response()
            }
            _ => {
                tracing::error!(error = %self.0, "query engine error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({"error": "internal error"})),
                )
                    .into_response()
            }
        }
    }
}

/// Attach the `_meta` envelope carried by every successful JSON response.
pub fn enveloped(
    provider: &str,
    meta: &BTreeMap<String, String>,
    last_fetch: Option<chrono::DateTime<chrono::Utc>>,
    mut body: serde_json::Value,
) -> Json<serde_json::Value> {
    let mut envelope = serde_json::Map::new();
    envelope.insert("provider".to_string(), provider.into());
    if let Some(date) = meta.get("dateexport") {
        envelope.insert("dataDate".to_string(), date.as_str().into());
    }
    if let Some(built) = meta.get("builtAt") {
        envelope.insert("builtAt".to_string(), built.as_str().into());
    }
    if let Some(version) = meta.get("version") {
        envelope.insert("version".to_string(), version.as_str().into());
    }
    if let Some(last_fetch) = last_fetch {
        envelope.insert(
            "lastFetch".to_string(),
            last_fetch
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
                .into(),
        );
    }

    if let Some(object) = body.as_object_mut() {
        object.insert("_meta".to_string(), envelope.into());
    }
    Json(body)
}

pub(crate) fn join_error(err: tokio::task::JoinError) -> Error {
    Error::Internal(format!("query task panicked: {err}"))
}

#[cfg(test)]
mod test {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use refdata::{EppoConfig, EuConfig};
    use tower::util::ServiceExt;

    const SAMPLE: &str = r#"<codes dateexport="2026-07-19" version="2026.07">
  <code isactive="true" type="PFL">
    <eppocode>LYPES</eppocode>
    <name ispreferred="true" isactive="true"><fullname>Tomato</fullname><lang>en</lang></name>
  </code>
</codes>"#;

    async fn test_app(eppo_raw: Option<&str>) -> (tempfile::TempDir, axum::Router<()>) {
        let dir = tempfile::tempdir().unwrap();
        let eppo_dir = dir.path().join("eppo");
        let eu_dir = dir.path().join("eu");
        std::fs::create_dir_all(&eppo_dir).unwrap();
        std::fs::create_dir_all(&eu_dir).unwrap();

        if let Some(raw) = eppo_raw {
            std::fs::write(eppo_dir.join("codes.xml"), raw).unwrap();
        }
        std::fs::write(
            eu_dir.join("data.json"),
            r#"[{"substance_id": 1, "substance_name": "Amitrole", "as_cas_number": "61-82-5",
                 "substance_status": "Approved", "substance_category": "HB - Herbicide"}]"#,
        )
        .unwrap();

        let eppo = Coordinator::new(
            refdata::eppo::Source::new(EppoConfig {
                api_url: "http://127.0.0.1:9/datasets".parse().unwrap(),
                api_key: "test".to_string(),
                types: vec!["PFL".to_string()],
            }),
            eppo_dir,
        )
        .unwrap();
        let eu = Coordinator::new(
            refdata::eu::Source::new(EuConfig {
                url: "http://127.0.0.1:9/export".parse().unwrap(),
            }),
            eu_dir,
        )
        .unwrap();
        if eppo_raw.is_some() {
            eppo.initialise().await.unwrap();
        }
        eu.initialise().await.unwrap();

        let router = build_router(Arc::new(App { eppo, eu }));
        (dir, router)
    }

    async fn get(router: &axum::Router<()>, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn forwarded_requests_are_refused() {
        let (_dir, router) = test_app(Some(SAMPLE)).await;

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/eppo/health")
                    .header("x-forwarded-for", "10.0.0.1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn health_is_always_200() {
        let (_dir, router) = test_app(None).await;
        let (status, body) = get(&router, "/eppo/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], false);
        assert_eq!(body["provider"], "eppo");

        let (status, body) = get(&router, "/eu/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["stats"]["substances"], 1);
    }

    #[tokio::test]
    async fn queries_before_any_store_answer_503() {
        let (_dir, router) = test_app(None).await;
        let (status, body) = get(&router, "/eppo/code/LYPES").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["ok"], false);
        assert_eq!(body["rebuilding"], false);
    }

    #[tokio::test]
    async fn code_lookup_carries_the_meta_envelope() {
        let (_dir, router) = test_app(Some(SAMPLE)).await;

        let (status, body) = get(&router, "/eppo/code/lypes").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"]["eppocode"], "LYPES");
        assert_eq!(body["names"][0]["fullname"], "Tomato");
        assert_eq!(body["_meta"]["provider"], "eppo");
        assert_eq!(body["_meta"]["dataDate"], "2026-07-19");
        assert_eq!(body["_meta"]["version"], "2026.07");

        let (status, _) = get(&router, "/eppo/code/UNKNOWN").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn name_lookup_requires_lang() {
        let (_dir, router) = test_app(Some(SAMPLE)).await;

        let (status, _) = get(&router, "/eppo/name/LYPES").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = get(&router, "/eppo/name/LYPES?lang=en").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["fullname"], "Tomato");

        let (status, _) = get(&router, "/eppo/name/LYPES?lang=de").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn search_requires_q() {
        let (_dir, router) = test_app(Some(SAMPLE)).await;

        let (status, _) = get(&router, "/eppo/search").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = get(&router, "/eppo/search?q=tom").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);
        assert_eq!(body["results"][0]["eppocode"], "LYPES");
    }

    #[tokio::test]
    async fn substance_routes_validate_their_input() {
        let (_dir, router) = test_app(None).await;

        let (status, _) = get(&router, "/eu/substance/not-a-number").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = get(&router, "/eu/substance/1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["substance_name"], "Amitrole");

        let (status, _) = get(&router, "/eu/cas/61-82-5").await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = get(&router, "/eu/cas/nonsense").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rebuild_of_a_malformed_artifact_answers_200_with_negative_ok() {
        let (dir, router) = test_app(Some(SAMPLE)).await;

        // The next rebuild re-reads the raw artifact and fails to parse;
        // the failure is a pipeline result, not an HTTP error.
        std::fs::write(
            dir.path().join("eppo").join("codes.xml"),
            "<codes><code></mismatch></codes>",
        )
        .unwrap();

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/eppo/rebuild")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["ok"], false);
        assert!(body["error"].as_str().unwrap().starts_with("build failed"));

        // The previous store is untouched and still serves queries.
        let (status, body) = get(&router, "/eppo/code/LYPES").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"]["eppocode"], "LYPES");
    }

    #[tokio::test]
    async fn locked_fetch_answers_200_with_negative_ok() {
        let (dir, router) = test_app(Some(SAMPLE)).await;
        std::fs::write(dir.path().join("eppo").join("fetch.lock"), "{}").unwrap();

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/eppo/fetch")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"], "locked by another node");
    }
}
