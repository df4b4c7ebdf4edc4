use crate::core::DaemonEvent;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use preset_proto::protocol::{Command, CommandKind, PhoneState, SessionSnapshot};
use preset_proto::state::StateManager;
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

#[derive(Clone)]
struct HttpState {
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
}

#[derive(Serialize)]
struct ApiError {
    error: String,
}

type ApiResult = Result<StatusCode, (StatusCode, Json<ApiError>)>;

fn bad_request(message: String) -> (StatusCode, Json<ApiError>) {
    warn!("HTTP API: {}", message);
    (StatusCode::BAD_REQUEST, Json(ApiError { error: message }))
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state_manager, event_tx);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

fn router(state_manager: Arc<StateManager>, event_tx: mpsc::Sender<DaemonEvent>) -> Router {
    let app_state = HttpState {
        state_manager,
        event_tx,
    };

    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/play/:preset", get(play).post(play))
        .route("/api/next", get(next).post(next))
        .route("/api/prev", get(prev).post(prev))
        .route("/api/stop", get(stop).post(stop))
        .route("/api/pause", get(pause).post(pause))
        .route("/api/resume", get(resume).post(resume))
        .route("/api/action/:name", get(action).post(action))
        .route("/api/signal/phone/:state", get(phone).post(phone))
        .route("/api/signal/headset", get(headset).post(headset))
        .route("/api/signal/network", get(network).post(network))
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

async fn dispatch(state: &HttpState, cmd: Command) -> StatusCode {
    info!("HTTP API: {:?}", cmd);
    if state
        .event_tx
        .send(DaemonEvent::ClientCommand(cmd))
        .await
        .is_err()
    {
        error!("Failed to send command to daemon core");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::OK
}

async fn get_state(State(state): State<HttpState>) -> Json<SessionSnapshot> {
    Json(state.state_manager.get_state().await)
}

async fn play(State(state): State<HttpState>, Path(preset): Path<u32>) -> StatusCode {
    dispatch(&state, Command::Play { preset }).await
}

async fn next(State(state): State<HttpState>) -> StatusCode {
    dispatch(&state, Command::Next).await
}

async fn prev(State(state): State<HttpState>) -> StatusCode {
    dispatch(&state, Command::Previous).await
}

async fn stop(State(state): State<HttpState>) -> StatusCode {
    dispatch(&state, Command::Stop).await
}

async fn pause(State(state): State<HttpState>) -> StatusCode {
    dispatch(&state, Command::Pause).await
}

async fn resume(State(state): State<HttpState>) -> StatusCode {
    dispatch(&state, Command::Resume).await
}

/// Payload-free commands by name.  Unknown names never reach the core.
async fn action(State(state): State<HttpState>, Path(name): Path<String>) -> ApiResult {
    let kind: CommandKind = name
        .parse()
        .map_err(|e| bad_request(format!("{}", e)))?;
    let cmd = kind
        .without_payload()
        .ok_or_else(|| bad_request(format!("action '{}' needs a payload", kind)))?;
    Ok(dispatch(&state, cmd).await)
}

async fn phone(State(state): State<HttpState>, Path(phone): Path<String>) -> ApiResult {
    let phone: PhoneState = phone
        .parse()
        .map_err(|e| bad_request(format!("phone state: {}", e)))?;
    Ok(dispatch(&state, Command::PhoneState { state: phone }).await)
}

async fn headset(State(state): State<HttpState>) -> StatusCode {
    dispatch(&state, Command::HeadsetRemoved).await
}

async fn network(State(state): State<HttpState>) -> StatusCode {
    dispatch(&state, Command::NetworkChanged).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> (Router, mpsc::Receiver<DaemonEvent>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let sm = Arc::new(StateManager::new(dir.path().join("state.json"), Vec::new()));
        let (tx, rx) = mpsc::channel(8);
        (router(sm, tx), rx, dir)
    }

    async fn call(app: Router, method: &str, uri: &str) -> StatusCode {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        app.oneshot(req).await.unwrap().status()
    }

    fn command(rx: &mut mpsc::Receiver<DaemonEvent>) -> Command {
        match rx.try_recv().unwrap() {
            DaemonEvent::ClientCommand(cmd) => cmd,
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_play_route_dispatches() {
        let (app, mut rx, _dir) = app();
        assert_eq!(call(app, "POST", "/api/play/4").await, StatusCode::OK);
        assert_eq!(command(&mut rx), Command::Play { preset: 4 });
    }

    #[tokio::test]
    async fn test_action_route_parses_kind() {
        let (app, mut rx, _dir) = app();
        assert_eq!(call(app.clone(), "GET", "/api/action/prev").await, StatusCode::OK);
        assert_eq!(command(&mut rx), Command::Previous);

        assert_eq!(
            call(app.clone(), "GET", "/api/action/shuffle").await,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            call(app, "GET", "/api/action/play").await,
            StatusCode::BAD_REQUEST
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_phone_signal_route() {
        let (app, mut rx, _dir) = app();
        assert_eq!(
            call(app.clone(), "POST", "/api/signal/phone/ringing").await,
            StatusCode::OK
        );
        assert_eq!(
            command(&mut rx),
            Command::PhoneState {
                state: PhoneState::Ringing
            }
        );
        assert_eq!(
            call(app, "POST", "/api/signal/phone/busy").await,
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn test_state_route_returns_snapshot() {
        let (app, _rx, _dir) = app();
        let req = Request::builder()
            .uri("/api/state")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let snapshot: SessionSnapshot = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(snapshot.current_preset, 0);
    }
}
