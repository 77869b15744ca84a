#![forbid(unsafe_code)]

//! xTap HTTP daemon.
//!
//! Runs as a user service and accepts the same operations as the
//! native-messaging host, but over a loopback HTTP API so the extension can
//! reach the store without a round trip through the browser's messaging
//! pipe. Every POST route requires the pre-shared bearer token; `GET
//! /status` stays open as a liveness probe. Unlike the host loop, requests
//! here may run concurrently — the store's internal lock is what keeps
//! dedup state consistent.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use xtap_tools::config::{BIND_HOST, VERSION, load_runtime_config};
use xtap_tools::security::{ensure_not_root, load_token};
use xtap_tools::service::{Service, requested_dir, string_array};

#[derive(Clone)]
struct AppState {
    service: Arc<Service>,
    token: Arc<String>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "Unauthorized".to_string(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({"ok": false, "error": self.message});
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("XTAP_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    ensure_not_root("xtap_daemon")?;
    let config = load_runtime_config()?;

    // The secret is provisioned by the installer; without it no request
    // could ever authenticate, so refuse to start at all.
    let token = load_token(&config.secret_path())?;

    let port = config.port;
    let service = Arc::new(Service::new(config, tokio::runtime::Handle::current()));

    // Scan the default directory's existing records up front so the first
    // capture batch pays no bootstrap latency.
    {
        let service = service.clone();
        tokio::task::spawn_blocking(move || service.store().ensure_default_loaded())
            .await
            .context("bootstrap task failed")??;
    }

    let state = AppState {
        service,
        token: Arc::new(token),
    };

    let app = Router::new()
        .route("/status", get(status))
        .route("/tweets", post(write_tweets))
        .route("/log", post(write_log))
        .route("/dump", post(write_dump))
        .route("/test-path", post(test_path))
        .route("/check-ytdlp", post(check_ytdlp))
        .route("/download-video", post(download_video))
        .route("/download-status", post(download_status))
        .fallback(not_found)
        .with_state(state);

    let addr: SocketAddr = format!("{BIND_HOST}:{port}")
        .parse()
        .context("building listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(version = VERSION, %addr, "xTap daemon listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running HTTP server")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {err}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => error!("failed to install SIGTERM handler: {err}"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

fn check_auth(headers: &HeaderMap, token: &str) -> ApiResult<()> {
    let supplied = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    match supplied {
        Some(supplied) if supplied == token => Ok(()),
        _ => {
            warn!("rejected request with missing or invalid token");
            Err(ApiError::unauthorized())
        }
    }
}

fn parse_body(body: &str) -> ApiResult<Value> {
    if body.is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(body).map_err(|err| ApiError::bad_request(format!("Invalid JSON: {err}")))
}

/// Runs storage work off the async threads and folds both failure layers
/// into a 500.
async fn run_blocking<T>(task: impl FnOnce() -> Result<T> + Send + 'static) -> ApiResult<T>
where
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(task).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(ApiError::internal(err.to_string())),
        Err(err) => Err(ApiError::internal(format!("blocking task failed: {err}"))),
    }
}

async fn status() -> Json<Value> {
    Json(json!({"ok": true, "version": VERSION}))
}

async fn not_found() -> ApiError {
    ApiError::not_found("Not found")
}

async fn write_tweets(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    check_auth(&headers, &state.token)?;
    let body = parse_body(&body)?;
    let dir = requested_dir(&body).to_string();
    let records = body
        .get("tweets")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let service = state.service.clone();
    let (count, dupes) = run_blocking(move || service.write_records(&dir, &records)).await?;
    debug!(count, dupes, "handled /tweets");
    Ok(Json(json!({"ok": true, "count": count, "dupes": dupes})))
}

async fn write_log(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    check_auth(&headers, &state.token)?;
    let body = parse_body(&body)?;
    let dir = requested_dir(&body).to_string();
    let lines = string_array(&body, "lines");

    let service = state.service.clone();
    let logged = run_blocking(move || service.write_log(&dir, &lines)).await?;
    Ok(Json(json!({"ok": true, "logged": logged})))
}

async fn write_dump(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    check_auth(&headers, &state.token)?;
    let body = parse_body(&body)?;
    let dir = requested_dir(&body).to_string();
    let filename = body
        .get("filename")
        .and_then(Value::as_str)
        .unwrap_or("dump.json")
        .to_string();
    let content = body
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let service = state.service.clone();
    let path = run_blocking(move || service.write_dump(&dir, &filename, &content)).await?;
    Ok(Json(json!({"ok": true, "path": path.display().to_string()})))
}

async fn test_path(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    check_auth(&headers, &state.token)?;
    let body = parse_body(&body)?;
    let dir = requested_dir(&body).to_string();
    if dir.is_empty() {
        return Err(ApiError::bad_request("outputDir is required"));
    }

    let service = state.service.clone();
    run_blocking(move || service.test_path(&dir)).await?;
    Ok(Json(json!({"ok": true, "type": "TEST_PATH"})))
}

async fn check_ytdlp(
    State(state): State<AppState>,
    headers: HeaderMap,
    _body: String,
) -> ApiResult<Json<Value>> {
    check_auth(&headers, &state.token)?;
    let service = state.service.clone();
    // The probe spawns a subprocess, so it counts as blocking work too.
    let available = run_blocking(move || Ok(service.check_downloader())).await?;
    Ok(Json(json!({"ok": true, "available": available})))
}

async fn download_video(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    check_auth(&headers, &state.token)?;
    let body = parse_body(&body)?;
    let dir = requested_dir(&body).to_string();
    let tweet_url = body
        .get("tweetUrl")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let direct_url = body
        .get("directUrl")
        .and_then(Value::as_str)
        .map(str::to_string);
    let post_date = body
        .get("postDate")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let service = state.service.clone();
    let job_id = run_blocking(move || {
        service.start_download(&dir, &tweet_url, direct_url.as_deref(), &post_date)
    })
    .await?;
    debug!(job = %job_id, "handled /download-video");
    Ok(Json(json!({"ok": true, "downloadId": job_id})))
}

async fn download_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    check_auth(&headers, &state.token)?;
    let body = parse_body(&body)?;
    let job_id = body
        .get("downloadId")
        .and_then(Value::as_str)
        .unwrap_or("");

    let snapshot = state.service.download_status(job_id);
    let mut response = json!({"ok": true});
    if let (Some(fields), Ok(Value::Object(snapshot))) =
        (response.as_object_mut(), serde_json::to_value(&snapshot))
    {
        fields.extend(snapshot);
    }
    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State as AxumState;
    use std::fs;
    use tempfile::tempdir;
    use xtap_tools::config::RuntimeConfig;

    const TOKEN: &str = "test-token";

    struct DaemonTestContext {
        _temp: tempfile::TempDir,
        state: AppState,
    }

    impl DaemonTestContext {
        fn new() -> Self {
            let temp = tempdir().unwrap();
            let config = RuntimeConfig {
                output_dir: temp.path().join("out"),
                xtap_home: temp.path().join("home"),
                port: 17381,
            };
            fs::create_dir_all(&config.xtap_home).unwrap();
            fs::write(config.secret_path(), format!("{TOKEN}\n")).unwrap();

            let service = Arc::new(Service::new(
                config,
                tokio::runtime::Handle::current(),
            ));
            Self {
                state: AppState {
                    service,
                    token: Arc::new(TOKEN.to_string()),
                },
                _temp: temp,
            }
        }

        fn auth_headers(&self) -> HeaderMap {
            let mut headers = HeaderMap::new();
            headers.insert(
                header::AUTHORIZATION,
                format!("Bearer {TOKEN}").parse().unwrap(),
            );
            headers
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn status_reports_version_without_auth() {
        let Json(body) = status().await;
        assert_eq!(body, json!({"ok": true, "version": VERSION}));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_token_is_unauthorized_and_unprocessed() {
        let ctx = DaemonTestContext::new();
        let err = write_tweets(
            AxumState(ctx.state.clone()),
            HeaderMap::new(),
            r#"{"tweets":[{"id":"1"}]}"#.to_string(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert_eq!(err.message, "Unauthorized");
        // Nothing was written: the same batch still counts as new.
        let Json(body) = write_tweets(
            AxumState(ctx.state.clone()),
            ctx.auth_headers(),
            r#"{"tweets":[{"id":"1"}]}"#.to_string(),
        )
        .await
        .unwrap();
        assert_eq!(body["count"], json!(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wrong_token_is_unauthorized() {
        let ctx = DaemonTestContext::new();
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer nope".parse().unwrap());
        let err = write_log(AxumState(ctx.state.clone()), headers, "{}".to_string())
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tweets_round_trip_counts_duplicates() {
        let ctx = DaemonTestContext::new();
        let Json(body) = write_tweets(
            AxumState(ctx.state.clone()),
            ctx.auth_headers(),
            r#"{"tweets":[{"id":"1"},{"id":"1"}]}"#.to_string(),
        )
        .await
        .unwrap();
        assert_eq!(body, json!({"ok": true, "count": 1, "dupes": 1}));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_json_is_a_client_error() {
        let ctx = DaemonTestContext::new();
        let err = write_tweets(
            AxumState(ctx.state.clone()),
            ctx.auth_headers(),
            "{not json".to_string(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.message.contains("Invalid JSON"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_path_requires_output_dir() {
        let ctx = DaemonTestContext::new();
        let err = test_path(
            AxumState(ctx.state.clone()),
            ctx.auth_headers(),
            "{}".to_string(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "outputDir is required");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_path_probes_requested_dir() {
        let ctx = DaemonTestContext::new();
        let target = ctx._temp.path().join("probe");
        let body = json!({"outputDir": target.to_str().unwrap()}).to_string();
        let Json(response) = test_path(AxumState(ctx.state.clone()), ctx.auth_headers(), body)
            .await
            .unwrap();
        assert_eq!(response, json!({"ok": true, "type": "TEST_PATH"}));
        assert!(target.is_dir());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn log_appends_lines() {
        let ctx = DaemonTestContext::new();
        let Json(body) = write_log(
            AxumState(ctx.state.clone()),
            ctx.auth_headers(),
            r#"{"lines":["a","b"]}"#.to_string(),
        )
        .await
        .unwrap();
        assert_eq!(body, json!({"ok": true, "logged": 2}));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dump_writes_named_file() {
        let ctx = DaemonTestContext::new();
        let Json(body) = write_dump(
            AxumState(ctx.state.clone()),
            ctx.auth_headers(),
            r#"{"filename":"snap.json","content":"{}"}"#.to_string(),
        )
        .await
        .unwrap();
        assert_eq!(body["ok"], json!(true));
        let path = body["path"].as_str().unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "{}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_download_id_reports_unknown() {
        let ctx = DaemonTestContext::new();
        let Json(body) = download_status(
            AxumState(ctx.state.clone()),
            ctx.auth_headers(),
            r#"{"downloadId":"gone"}"#.to_string(),
        )
        .await
        .unwrap();
        assert_eq!(body, json!({"ok": true, "status": "unknown"}));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_route_is_not_found() {
        let response = not_found().await.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
