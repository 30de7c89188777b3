//! 观察 / 命令接口（unix socket 上的 HTTP）
//!
//! - GET  /health      存活与当前阶段
//! - GET  /telemetry   完整状态快照
//! - POST /command     {"action": "ping" | "get_phase" | "shutdown"}
//! - GET  /stream      日志事件 SSE
//!
//! 所有读取都走 StateReader 副本，命令只能通过 ShutdownManager 置位关闭标志，不直接改状态。

use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::UnixListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::IpcSection;
use crate::core::engine::EventBus;
use crate::core::shutdown::{ShutdownManager, ShutdownReason};
use crate::core::snapshot::StateReader;

/// 路由共享状态
#[derive(Clone)]
pub struct IpcState {
    pub reader: StateReader,
    pub events: EventBus,
    pub shutdown: Arc<ShutdownManager>,
    pub keepalive: Duration,
}

impl IpcState {
    pub fn new(reader: StateReader, events: EventBus, shutdown: Arc<ShutdownManager>, keepalive: Duration) -> Self {
        Self {
            reader,
            events,
            shutdown,
            keepalive,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub action: String,
}

pub fn router(state: IpcState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/telemetry", get(telemetry))
        .route("/command", post(command))
        .route("/stream", get(stream_events))
        .with_state(state)
}

async fn health(State(state): State<IpcState>) -> Json<serde_json::Value> {
    let snap = state.reader.snapshot();
    Json(json!({
        "ok": true,
        "status": snap.status,
        "phase": snap.phase,
        "iteration": snap.iteration,
    }))
}

async fn telemetry(State(state): State<IpcState>) -> Response {
    Json(state.reader.snapshot()).into_response()
}

async fn command(State(state): State<IpcState>, Json(req): Json<CommandRequest>) -> Response {
    match req.action.as_str() {
        "ping" => Json(json!({"ok": true, "reply": "pong"})).into_response(),
        "get_phase" => {
            let snap = state.reader.snapshot();
            Json(json!({"ok": true, "phase": snap.phase, "iteration": snap.iteration})).into_response()
        }
        "shutdown" => {
            let accepted = state.shutdown.shutdown(ShutdownReason::Command);
            tracing::info!(accepted, "shutdown requested over IPC");
            Json(json!({"ok": true, "accepted": accepted})).into_response()
        }
        other => (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "error": format!("unknown action '{}'", other)})),
        )
            .into_response(),
    }
}

async fn stream_events(State(state): State<IpcState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.subscribe();
    // 关闭时结束所有订阅，否则优雅关闭会一直等待长连接
    let closed = state.shutdown.token().cancelled_owned();
    let event_stream = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(ev) => {
                    let data = serde_json::to_string(&ev).unwrap_or_default();
                    return Some((Ok(Event::default().event("log").data(data)), rx));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, "slow SSE subscriber dropped events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .take_until(closed);
    Sse::new(event_stream).keep_alive(KeepAlive::new().interval(state.keepalive).text("keepalive"))
}

/// 绑定 unix socket：清理残留文件，拒绝与存活实例冲突，权限收紧为 0660
pub async fn bind_socket(path: &Path) -> anyhow::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    if path.exists() {
        if tokio::net::UnixStream::connect(path).await.is_ok() {
            anyhow::bail!("another instance is listening on {}", path.display());
        }
        tracing::info!(path = %path.display(), "removing stale IPC socket");
        tokio::fs::remove_file(path).await?;
    }
    let listener = UnixListener::bind(path)?;
    set_socket_mode(path)?;
    Ok(listener)
}

#[cfg(unix)]
fn set_socket_mode(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))
}

#[cfg(not(unix))]
fn set_socket_mode(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// 运行 IPC 服务直到 token 取消，退出时删除 socket 文件
pub async fn serve(cfg: &IpcSection, state: IpcState, token: CancellationToken) -> anyhow::Result<()> {
    let path: PathBuf = cfg.socket_path.clone();
    let listener = bind_socket(&path).await?;
    tracing::info!(socket = %path.display(), "IPC listening");

    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(token.cancelled_owned())
        .await;
    if let Err(e) = tokio::fs::remove_file(&path).await {
        tracing::debug!(error = %e, "IPC socket already removed");
    }
    result?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::LogEvent;
    use crate::core::engine::LogLevel;
    use crate::core::snapshot::state_channel;
    use crate::core::state::{IterationState, Phase};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> (IpcState, crate::core::snapshot::StatePublisher) {
        let mut state = IterationState::new(10);
        state.iteration = 4;
        state.phase = Phase::Act;
        let (publisher, reader) = state_channel(&state);
        let ipc = IpcState::new(
            reader,
            EventBus::new(8),
            Arc::new(ShutdownManager::new()),
            Duration::from_secs(15),
        );
        (ipc, publisher)
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn command_request(action: &str) -> Request<Body> {
        Request::post("/command")
            .header("content-type", "application/json")
            .body(Body::from(json!({ "action": action }).to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_and_telemetry() {
        let (state, _publisher) = test_state();
        let app = router(state);

        let resp = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["phase"], "ACT");
        assert_eq!(v["iteration"], 4);

        let resp = app
            .oneshot(Request::get("/telemetry").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let v = body_json(resp).await;
        assert_eq!(v["status"], "BOOTING");
        assert!(v["telemetry"].is_object());
    }

    #[tokio::test]
    async fn test_commands() {
        let (state, _publisher) = test_state();
        let shutdown = state.shutdown.clone();
        let app = router(state);

        let v = body_json(app.clone().oneshot(command_request("ping")).await.unwrap()).await;
        assert_eq!(v["reply"], "pong");

        let v = body_json(app.clone().oneshot(command_request("get_phase")).await.unwrap()).await;
        assert_eq!(v["phase"], "ACT");

        assert!(!shutdown.is_shutdown());
        let v = body_json(app.clone().oneshot(command_request("shutdown")).await.unwrap()).await;
        assert_eq!(v["accepted"], true);
        assert!(shutdown.is_shutdown());

        let resp = app.oneshot(command_request("reboot")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stream_is_event_stream() {
        let (state, _publisher) = test_state();
        let events = state.events.clone();
        let app = router(state);
        let resp = app
            .oneshot(Request::get("/stream").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "text/event-stream"
        );

        events.publish(LogEvent {
            timestamp: chrono::Utc::now(),
            level: LogLevel::Info,
            phase: Phase::Sense,
            iteration: 1,
            message: "hello".into(),
        });
        let mut body = resp.into_body().into_data_stream();
        let chunk = futures_util::StreamExt::next(&mut body).await.unwrap().unwrap();
        let text = String::from_utf8_lossy(&chunk);
        assert!(text.contains("event: log"));
        assert!(text.contains("hello"));
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("ipc.sock");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        // 残留的 socket 文件：绑定后立即关闭监听
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let listener = bind_socket(&path).await.unwrap();
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o660);

        // 存活实例占用时拒绝绑定
        assert!(bind_socket(&path).await.is_err());
        drop(listener);
    }

    #[tokio::test]
    async fn test_open_stream_does_not_block_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = IpcSection {
            socket_path: dir.path().join("kriya.sock"),
            ..IpcSection::default()
        };
        let (state, _publisher) = test_state();
        let shutdown = state.shutdown.clone();
        let server = tokio::spawn({
            let cfg = cfg.clone();
            let token = shutdown.token();
            async move { serve(&cfg, state, token).await }
        });

        // 等待 socket 就绪后挂一个 SSE 长连接
        let mut stream = loop {
            match tokio::net::UnixStream::connect(&cfg.socket_path).await {
                Ok(s) => break s,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        };
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        stream
            .write_all(b"GET /stream HTTP/1.1\r\nHost: kriya\r\n\r\n")
            .await
            .unwrap();
        let mut head = [0u8; 64];
        let n = stream.read(&mut head).await.unwrap();
        assert!(String::from_utf8_lossy(&head[..n]).starts_with("HTTP/1.1 200"));

        shutdown.shutdown(ShutdownReason::Command);
        let finished = tokio::time::timeout(Duration::from_secs(5), server).await;
        assert!(matches!(finished, Ok(Ok(Ok(())))), "IPC server did not stop after shutdown");
        assert!(!cfg.socket_path.exists());
    }

    #[tokio::test]
    async fn test_stream_ends_on_shutdown() {
        let (state, _publisher) = test_state();
        let shutdown = state.shutdown.clone();
        let resp = router(state)
            .oneshot(Request::get("/stream").body(Body::empty()).unwrap())
            .await
            .unwrap();
        shutdown.shutdown(ShutdownReason::Signal);

        let mut body = resp.into_body().into_data_stream();
        let rest = tokio::time::timeout(Duration::from_secs(2), async {
            while futures_util::StreamExt::next(&mut body).await.is_some() {}
        })
        .await;
        assert!(rest.is_ok());
    }
}
