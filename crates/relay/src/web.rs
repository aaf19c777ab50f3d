use axum::Router;
use axum::extract::State;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::http::Uri;
use axum::response::IntoResponse;
use axum::routing::get;
use tower_http::trace::TraceLayer;

use crate::relay::{AGENT_PATH, DRIVER_PATH, Relay, close_frame};
use crate::{agent, driver};

/// Build the axum router hosting the two WebSocket endpoints.
/// Every other path falls through to the 4004 rejection.
pub(crate) fn build_router(relay: Relay) -> Router {
    Router::new()
        .route(AGENT_PATH, get(agent_upgrade))
        .route(DRIVER_PATH, get(driver_upgrade))
        .fallback(invalid_path_upgrade)
        .layer(TraceLayer::new_for_http())
        .with_state(relay)
}

async fn agent_upgrade(State(relay): State<Relay>, ws: WebSocketUpgrade) -> impl IntoResponse {
    tracing::info!("Extension WebSocket upgrade request");
    ws.on_upgrade(move |socket| agent::handle_agent_ws(socket, relay))
}

async fn driver_upgrade(State(relay): State<Relay>, ws: WebSocketUpgrade) -> impl IntoResponse {
    tracing::info!("Driver WebSocket upgrade request");
    ws.on_upgrade(move |socket| driver::handle_driver_ws(socket, relay))
}

/// Upgrades on unrecognized paths are accepted and immediately closed with
/// code 4004 so the client sees a proper close frame.
async fn invalid_path_upgrade(ws: WebSocketUpgrade, uri: Uri) -> impl IntoResponse {
    tracing::warn!(path = %uri.path(), "WebSocket upgrade on invalid path");
    ws.on_upgrade(|mut socket: WebSocket| async move {
        let _ = socket.send(close_frame(4004, "Invalid path")).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use bridge_protocol::BridgeConfig;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let config: BridgeConfig = toml::from_str("").unwrap();
        build_router(Relay::new(config))
    }

    #[tokio::test]
    async fn reserved_paths_reject_plain_http() {
        for path in [AGENT_PATH, DRIVER_PATH] {
            let app = test_router();
            let request = Request::builder().uri(path).body(Body::empty()).unwrap();
            let response = app.oneshot(request).await.unwrap();
            assert!(
                response.status().is_client_error(),
                "{path} should reject a non-upgrade GET, got {}",
                response.status()
            );
        }
    }

    #[tokio::test]
    async fn unknown_paths_hit_the_upgrade_fallback() {
        let app = test_router();
        let request = Request::builder()
            .uri("/definitely-not-a-path")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        // The fallback owns every path, so there is no router-level 404; a
        // non-upgrade request fails the WebSocket extractor instead.
        assert_ne!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.status().is_client_error());
    }
}
