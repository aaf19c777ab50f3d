use axum::extract::ws::{Message, WebSocket};
use bridge_protocol::{ControlMessage, Envelope, RelayError};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{Instant, interval};
use uuid::Uuid;

use crate::relay::{Relay, WS_PING_INTERVAL, WS_PONG_TIMEOUT};

/// Handle a WebSocket connection from the **extension** side.
///
/// Extension sends text → connection_info, command responses, and events.
/// Extension receives ← forwarded driver commands and relay-initiated commands.
///
/// Binding a new extension evicts any previous one (normal close, code 1000):
/// the newest connection always wins.
pub(crate) async fn handle_agent_ws(mut socket: WebSocket, relay: Relay) {
    let (outbox, mut outbox_rx) = mpsc::unbounded_channel();
    let conn_id = relay.bind_agent(outbox);
    tracing::info!(%conn_id, "Extension WebSocket connected");

    // Ping/pong keepalive state
    let mut ping_interval = interval(WS_PING_INTERVAL);
    ping_interval.tick().await; // consume the immediate first tick
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            // Send periodic WebSocket ping frames
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > WS_PONG_TIMEOUT {
                    tracing::debug!(%conn_id, "Extension WebSocket ping timeout, closing");
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    tracing::debug!(%conn_id, "Extension WebSocket ping send failed");
                    break;
                }
            }
            // Drain the outbox: forwarded driver traffic and relay commands
            queued = outbox_rx.recv() => {
                let Some(frame) = queued else { break };
                let closing = matches!(frame, Message::Close(_));
                if socket.send(frame).await.is_err() {
                    tracing::debug!(%conn_id, "Extension WebSocket send failed");
                    break;
                }
                if closing {
                    break;
                }
            }
            // Receive messages from the extension
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => handle_agent_frame(&relay, conn_id, &text),
                    Some(Ok(Message::Pong(_))) => last_pong = Instant::now(),
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!(%conn_id, "Extension WebSocket closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(%conn_id, "Extension WebSocket error: {e}");
                        break;
                    }
                }
            }
        }
    }

    relay.agent_gone(conn_id);
    tracing::info!(%conn_id, "Extension WebSocket disconnected");
}

/// Classify one inbound extension frame: connection_info, response, or event.
/// Anything unparseable is logged and dropped; it never tears the socket down.
fn handle_agent_frame(relay: &Relay, conn_id: Uuid, text: &str) {
    if let Ok(ControlMessage::ConnectionInfo {
        session_id,
        target_info,
    }) = serde_json::from_str(text)
    {
        if session_id.is_empty() {
            tracing::warn!(%conn_id, "Ignoring connection_info with empty sessionId");
            return;
        }
        relay.set_connection_info(conn_id, session_id, target_info);
        return;
    }

    let env: Envelope = match serde_json::from_str(text) {
        Ok(env) => env,
        Err(e) => {
            tracing::warn!(%conn_id, "Discarding malformed frame from extension: {e}");
            return;
        }
    };

    if env.is_response() {
        on_response(relay, env, text);
    } else if env.is_event() {
        on_event(relay, env, text);
    } else {
        tracing::warn!(%conn_id, "Discarding frame that is neither response nor event");
    }
}

fn on_response(relay: &Relay, env: Envelope, raw: &str) {
    let Some(id) = env.id else { return };
    let Some(entry) = relay.take_pending(id) else {
        tracing::trace!(id, "Response with no matching pending request, dropping");
        return;
    };

    // A frameId in the result of a session-scoped command means the tab
    // navigated; re-read the target info once the response is out the door.
    let navigated = entry.session_id.is_some()
        && env
            .result
            .as_ref()
            .is_some_and(|result| result.get("frameId").is_some());

    match entry.waiter {
        Some(waiter) => {
            let outcome = match env.error {
                Some(err) => {
                    tracing::debug!(
                        id,
                        method = %entry.method,
                        params = ?entry.params,
                        "Relay command failed: {} ({})",
                        err.message,
                        err.code
                    );
                    Err(RelayError::Remote {
                        code: err.code,
                        message: err.message,
                    })
                }
                None => Ok(env.result.unwrap_or(Value::Null)),
            };
            let _ = waiter.send(outcome);
        }
        // Driver-originated command: hand the reply straight back.
        None => match relay.driver_outbox() {
            Some(driver) => {
                let _ = driver.send(Message::Text(raw.to_owned().into()));
            }
            None => {
                tracing::debug!(id, method = %entry.method, "No driver connected, dropping response");
            }
        },
    }

    if navigated {
        relay.schedule_target_refresh();
    }
}

fn on_event(relay: &Relay, env: Envelope, raw: &str) {
    match relay.driver_outbox() {
        Some(driver) => {
            let _ = driver.send(Message::Text(raw.to_owned().into()));
        }
        None => tracing::trace!(method = ?env.method, "No driver connected, dropping event"),
    }

    if env.method.as_deref() == Some("Page.frameNavigated") {
        relay.schedule_target_refresh();
    }
}
