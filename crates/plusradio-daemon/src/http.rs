use crate::core::ControllerEvent;
use crate::socket::CommandSink;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use plusradio_proto::protocol::{Command, PlayerView, StationEntry};
use plusradio_proto::state::StateManager;
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
struct HttpState {
    state_manager: StateManager,
    event_tx: CommandSink,
}

#[derive(Debug, Default, Deserialize)]
struct StationQuery {
    #[serde(default)]
    q: String,
}

pub fn router(state_manager: StateManager, event_tx: CommandSink) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/stations", get(get_stations))
        .route("/api/command", post(post_command))
        .layer(CorsLayer::permissive())
        .with_state(HttpState {
            state_manager,
            event_tx,
        })
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: StateManager,
    event_tx: CommandSink,
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

async fn get_state(State(state): State<HttpState>) -> Json<PlayerView> {
    Json(state.state_manager.get_state().await)
}

/// The published visible listing, optionally narrowed by `q`.
async fn get_stations(
    State(state): State<HttpState>,
    Query(query): Query<StationQuery>,
) -> Json<Vec<StationEntry>> {
    let view = state.state_manager.get_state().await;
    let needle = query.q.trim().to_lowercase();
    if needle.is_empty() {
        return Json(view.stations);
    }
    Json(
        view.stations
            .into_iter()
            .filter(|e| {
                e.station.name.to_lowercase().contains(&needle)
                    || e.station.group.to_lowercase().contains(&needle)
            })
            .collect(),
    )
}

async fn post_command(State(state): State<HttpState>, Json(cmd): Json<Command>) -> StatusCode {
    info!("HTTP API: {:?}", cmd);
    let Some(tx) = state.event_tx.as_ref() else {
        return StatusCode::SERVICE_UNAVAILABLE;
    };
    if tx.send(ControllerEvent::Command(cmd)).await.is_err() {
        error!("Failed to forward HTTP command");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::ACCEPTED
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use plusradio_proto::protocol::{Station, StationId};
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    fn entry(name: &str, group: &str) -> StationEntry {
        let station = Station {
            name: name.into(),
            group: group.into(),
            url: format!("http://{}/stream", name.to_lowercase()),
            logo_url: String::new(),
        };
        StationEntry {
            logo_url: station.display_logo_url(),
            station,
            favorite: false,
            recent: false,
            current: false,
        }
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_state_and_stations() {
        let sm = StateManager::new();
        sm.publish(PlayerView {
            stations: vec![entry("Rock FM", "Rock"), entry("Jazz Lounge", "Jazz")],
            ..PlayerView::default()
        })
        .await;
        let app = router(sm, None);

        let response = app
            .clone()
            .oneshot(Request::get("/api/state").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let view: PlayerView = body_json(response).await;
        assert_eq!(view.rev, 1);
        assert_eq!(view.stations.len(), 2);

        let response = app
            .oneshot(
                Request::get("/api/stations?q=JAZZ")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let stations: Vec<StationEntry> = body_json(response).await;
        assert_eq!(stations.len(), 1);
        assert_eq!(stations[0].station.name, "Jazz Lounge");
    }

    #[tokio::test]
    async fn test_command_forwarded() {
        let (tx, mut rx) = mpsc::channel(4);
        let app = router(StateManager::new(), Some(tx));
        let id = StationId::new("Rock FM", "http://rock fm/stream");
        let body = serde_json::to_string(&Command::Select { id: id.clone() }).unwrap();

        let response = app
            .oneshot(
                Request::post("/api/command")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        match rx.recv().await {
            Some(ControllerEvent::Command(Command::Select { id: got })) => assert_eq!(got, id),
            other => panic!("expected select, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_command_unavailable_after_failed_startup() {
        let sm = StateManager::new();
        sm.set_fatal("playlist not found").await;
        let app = router(sm, None);

        let response = app
            .oneshot(
                Request::post("/api/command")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"cmd":"Next"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
