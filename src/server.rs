//! Local HTTP server (axum)
//!
//! Serves the JSON API for the UI under `/app`, the patient-history proxy,
//! and prescription PDF downloads.

use std::net::SocketAddr;

use axum::{
    extract::{Path, RawQuery, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use crate::api::TOKEN_KEY;
use crate::error::{AppError, AppResult};
use crate::web_api::{create_web_api_router, ApiError, SharedState};

/// Create the router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/patient-histories", get(proxy_patient_histories))
        .route("/api/patient-histories/{id}/pdf", get(download_pdf))
        .with_state(state.clone())
        .nest("/app", create_web_api_router(state))
}

/// Start the HTTP server; runs until Ctrl-C.
pub async fn start_server(state: SharedState, port: u16) -> AppResult<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(state).layer(cors);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AppError::Custom(format!("Server bind error: {}", e)))?;
    log::info!("[server] listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("[server] cannot listen for shutdown signal: {}", e);
            }
            log::info!("[server] shutting down");
        })
        .await
        .map_err(|e| AppError::Custom(format!("Server error: {}", e)))?;

    Ok(())
}

// ============ Handlers ============

async fn health_handler() -> &'static str {
    "OK"
}

fn bad_gateway(error: reqwest::Error) -> Response {
    log::error!("[proxy] upstream unreachable: {}", error);
    let detail = if error.is_timeout() {
        "Upstream request timed out".to_string()
    } else {
        format!("Upstream request failed: {}", error)
    };
    (StatusCode::BAD_GATEWAY, Json(json!({ "detail": detail }))).into_response()
}

/// Forwards the query string and bearer token to the backend's
/// `/patient-histories` and relays its status and body unchanged.
async fn proxy_patient_histories(
    State(state): State<SharedState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let mut url = state.api.url("/patient-histories");
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(&query);
    }

    // the caller's Authorization header wins over the stored session
    let incoming = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let uses_stored_token = incoming.is_none();
    let authorization = incoming.or_else(|| state.api.token().map(|t| format!("Bearer {}", t)));

    let mut request = state.api.http().get(&url);
    if let Some(value) = authorization {
        request = request.header(reqwest::header::AUTHORIZATION, value);
    }

    let upstream = match request.send().await {
        Ok(response) => response,
        Err(e) => return bad_gateway(e),
    };

    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    if status == StatusCode::UNAUTHORIZED && uses_stored_token {
        if let Err(e) = state.api.store().remove(TOKEN_KEY) {
            log::error!("[proxy] failed to clear token: {}", e);
        }
    }
    let content_type = upstream
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();

    match upstream.bytes().await {
        Ok(body) => (status, [(header::CONTENT_TYPE, content_type)], body).into_response(),
        Err(e) => bad_gateway(e),
    }
}

async fn download_pdf(State(state): State<SharedState>, Path(id): Path<i64>) -> Result<Response, ApiError> {
    state.session.require_token()?;
    let document = state.history_pdf(id).await?;
    log::info!("[server] pdf {} ({} bytes)", document.filename, document.bytes.len());

    let disposition = format!("attachment; filename=\"{}\"", document.filename);
    Ok((
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        document.bytes,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::AppState;
    use crate::config::AppConfig;
    use crate::db::LocalStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;
    use wiremock::matchers::{header as header_is, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn state_with(api_base_url: String, token: Option<&str>) -> SharedState {
        let config = AppConfig {
            api_base_url,
            ..Default::default()
        };
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        if let Some(token) = token {
            store.set(TOKEN_KEY, token).unwrap();
        }
        Arc::new(AppState::new(config, store).unwrap())
    }

    async fn get(state: SharedState, uri: &str, auth: Option<&str>) -> Response {
        let mut builder = Request::builder().uri(uri);
        if let Some(auth) = auth {
            builder = builder.header("authorization", auth);
        }
        create_router(state)
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let state = state_with("http://127.0.0.1:9".into(), None);
        let response = get(state, "/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_proxy_passes_status_and_body_through() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/patient-histories"))
            .and(query_param("type", "opd"))
            .and(query_param("skip", "0"))
            .and(header_is("authorization", "Bearer caller"))
            .respond_with(ResponseTemplate::new(206).set_body_json(json!({"items": [], "total": 0})))
            .expect(1)
            .mount(&server)
            .await;

        let state = state_with(server.uri(), Some("stored"));
        let response = get(state, "/api/patient-histories?type=opd&skip=0", Some("Bearer caller")).await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, json!({"items": [], "total": 0}));
    }

    #[tokio::test]
    async fn test_proxy_uses_stored_token_and_relays_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/patient-histories"))
            .and(header_is("authorization", "Bearer stored"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"detail": "Token expired"})))
            .mount(&server)
            .await;

        let state = state_with(server.uri(), Some("stored"));
        let response = get(state.clone(), "/api/patient-histories", None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(state.api.token().is_none());
    }

    #[tokio::test]
    async fn test_proxy_unreachable_upstream_is_502() {
        // nothing listens on the discard port
        let state = state_with("http://127.0.0.1:9".into(), Some("stored"));
        let response = get(state, "/api/patient-histories?type=opd", None).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["detail"].is_string());
    }

    #[tokio::test]
    async fn test_pdf_download() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/patient-histories/7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 7,
                "type": "opd",
                "json_data": "{\"patient_info\":{\"name\":\"Sok Dara\"},\"prescription\":[],\"visit_date\":\"2024-04-02\"}"
            })))
            .mount(&server)
            .await;

        let state = state_with(server.uri(), Some("tok"));
        let response = get(state, "/api/patient-histories/7/pdf", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/pdf");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"prescription-sok-dara-2024-04-02.pdf\""
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(bytes.starts_with(b"%PDF"));
    }

    #[tokio::test]
    async fn test_app_routes_are_nested() {
        let state = state_with("http://127.0.0.1:9".into(), None);
        let response = get(state, "/app/auth/state", None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
