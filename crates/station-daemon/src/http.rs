use crate::core::CoreEvent;
use crate::notification::NotificationAction;
use crate::session::{MediaSession, SharedSession};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use station_proto::protocol::{Command, FocusChange, StationState};
use station_proto::state::StateManager;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
pub struct HttpState {
    pub state_manager: Arc<StateManager>,
    pub session: SharedSession,
    pub event_tx: mpsc::Sender<CoreEvent>,
}

#[derive(Serialize)]
struct ApiState {
    #[serde(flatten)]
    state: StationState,
    is_playing: bool,
    track_text: String,
}

pub fn router(app_state: HttpState) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/session", get(get_session))
        .route("/api/play", get(play).post(play))
        .route("/api/pause", get(pause).post(pause))
        .route("/api/stop", get(stop).post(stop))
        .route("/api/toggle", get(toggle).post(toggle))
        .route("/api/refresh", get(refresh).post(refresh))
        .route("/api/focus/:change", post(focus))
        .route("/api/notification/:action", post(notification_action))
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

pub fn start_server(
    bind_address: String,
    port: u16,
    app_state: HttpState,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(app_state);

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

async fn get_state(State(state): State<HttpState>) -> Json<ApiState> {
    let station_state = state.state_manager.get_state().await;
    Json(ApiState {
        is_playing: station_state.is_playing(),
        track_text: station_state.track.display().to_string(),
        state: station_state,
    })
}

async fn get_session(State(state): State<HttpState>) -> Json<MediaSession> {
    Json(state.session.read().await.clone())
}

async fn send_command(state: &HttpState, cmd: Command) -> StatusCode {
    info!("HTTP API: {:?}", cmd);
    if state.event_tx.send(CoreEvent::Command(cmd)).await.is_err() {
        error!("Failed to send command to core");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    // Accepted; the outcome arrives as a state broadcast.
    StatusCode::ACCEPTED
}

async fn play(State(state): State<HttpState>) -> StatusCode {
    send_command(&state, Command::Play).await
}

async fn pause(State(state): State<HttpState>) -> StatusCode {
    send_command(&state, Command::Pause).await
}

async fn stop(State(state): State<HttpState>) -> StatusCode {
    send_command(&state, Command::Stop).await
}

async fn toggle(State(state): State<HttpState>) -> StatusCode {
    send_command(&state, Command::TogglePause).await
}

async fn refresh(State(state): State<HttpState>) -> StatusCode {
    send_command(&state, Command::RefreshTrack).await
}

async fn focus(State(state): State<HttpState>, Path(change): Path<String>) -> StatusCode {
    match change.parse::<FocusChange>() {
        Ok(change) => send_command(&state, Command::AudioFocus { change }).await,
        Err(e) => {
            info!("HTTP API: {}", e);
            StatusCode::BAD_REQUEST
        }
    }
}

async fn notification_action(
    State(state): State<HttpState>,
    Path(action): Path<String>,
) -> StatusCode {
    match action.parse::<NotificationAction>() {
        Ok(action) => send_command(&state, action.command()).await,
        Err(e) => {
            info!("HTTP API: {}", e);
            StatusCode::BAD_REQUEST
        }
    }
}
