use axum::extract::ws::{Message, WebSocket};
use bridge_protocol::Envelope;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::{Instant, interval};
use uuid::Uuid;

use crate::relay::{Outbox, Relay, WS_PING_INTERVAL, WS_PONG_TIMEOUT, error_envelope};

/// Handle a WebSocket connection from the **driver** side.
///
/// Driver sends text → debug-protocol commands.
/// Driver receives ← synthesized responses, forwarded agent responses, and
/// forwarded agent events.
///
/// Only one driver at a time; a new connection closes the previous one with
/// code 1000, reason "New connection established".
pub(crate) async fn handle_driver_ws(mut socket: WebSocket, relay: Relay) {
    let (outbox, mut outbox_rx) = mpsc::unbounded_channel();
    let conn_id = relay.bind_driver(outbox.clone());
    tracing::info!(%conn_id, "Driver WebSocket connected");

    // Ping/pong keepalive state
    let mut ping_interval = interval(WS_PING_INTERVAL);
    ping_interval.tick().await; // consume the immediate first tick
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            // Send periodic WebSocket ping frames
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > WS_PONG_TIMEOUT {
                    tracing::debug!(%conn_id, "Driver WebSocket ping timeout, closing");
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    tracing::debug!(%conn_id, "Driver WebSocket ping send failed");
                    break;
                }
            }
            // Drain the outbox: synthesized replies and forwarded agent traffic
            queued = outbox_rx.recv() => {
                let Some(frame) = queued else { break };
                let closing = matches!(frame, Message::Close(_));
                if socket.send(frame).await.is_err() {
                    tracing::debug!(%conn_id, "Driver WebSocket send failed");
                    break;
                }
                if closing {
                    break;
                }
            }
            // Receive commands from the driver
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => handle_driver_frame(&relay, &outbox, conn_id, &text),
                    Some(Ok(Message::Pong(_))) => last_pong = Instant::now(),
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!(%conn_id, "Driver WebSocket closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(%conn_id, "Driver WebSocket error: {e}");
                        break;
                    }
                }
            }
        }
    }

    relay.driver_gone(conn_id);
    tracing::info!(%conn_id, "Driver WebSocket disconnected");
}

/// Dispatch one driver command: answer locally, forward to the agent, or
/// synthesize a not-connected error.
fn handle_driver_frame(relay: &Relay, outbox: &Outbox, conn_id: Uuid, text: &str) {
    let env: Envelope = match serde_json::from_str(text) {
        Ok(env) => env,
        Err(e) => {
            tracing::warn!(%conn_id, "Discarding malformed frame from driver: {e}");
            return;
        }
    };
    let Some(method) = env.method.clone() else {
        tracing::warn!(%conn_id, "Discarding driver frame without method");
        return;
    };
    tracing::debug!(%conn_id, %method, id = ?env.id, "Driver command");

    if (method.starts_with("Browser.") || method.starts_with("Target."))
        && handle_local(relay, outbox, &env, &method)
    {
        return;
    }

    if relay.forward_to_agent(&env, text) {
        return;
    }

    if let Some(id) = env.id {
        send_json(
            outbox,
            error_envelope(id, env.session_id.as_deref(), -32000, "Extension not connected"),
        );
    } else {
        tracing::debug!(%method, "Dropping driver command, extension not connected");
    }
}

/// The handful of methods the relay answers itself so the driver can finish
/// its handshake without a real browser process behind the socket.
/// Returns false when the method should be forwarded after all.
fn handle_local(relay: &Relay, outbox: &Outbox, env: &Envelope, method: &str) -> bool {
    match method {
        "Browser.getVersion" => {
            reply(
                outbox,
                env,
                json!({
                    "protocolVersion": "1.3",
                    "product": "Chrome/Extension-Bridge",
                    "userAgent": "CDP-Bridge-Server/1.0.0",
                }),
            );
            true
        }
        "Browser.setDownloadBehavior" => {
            reply(outbox, env, json!({}));
            true
        }
        "Target.setAutoAttach" if env.session_id.is_none() => {
            // Simulate the attach handshake for the already-attached tab.
            let Some((session_id, mut target_info)) = relay.connected_target() else {
                return false;
            };
            target_info.insert("attached".to_owned(), Value::Bool(true));
            send_json(
                outbox,
                json!({
                    "method": "Target.attachedToTarget",
                    "params": {
                        "sessionId": session_id,
                        "targetInfo": target_info,
                        "waitingForDebugger": false,
                    },
                }),
            );
            reply(outbox, env, json!({}));
            true
        }
        "Target.getTargets" => {
            let target_infos = match relay.connected_target() {
                Some((_, mut target_info)) => {
                    target_info.insert("attached".to_owned(), Value::Bool(true));
                    vec![Value::Object(target_info)]
                }
                None => Vec::new(),
            };
            reply(outbox, env, json!({ "targetInfos": target_infos }));
            true
        }
        _ => false,
    }
}

/// Send a success response for `env`, echoing its sessionId when present.
/// Commands without an id get no response.
fn reply(outbox: &Outbox, env: &Envelope, result: Value) {
    let Some(id) = env.id else { return };
    let mut frame = json!({ "id": id, "result": result });
    if let Some(session_id) = &env.session_id {
        frame["sessionId"] = Value::String(session_id.clone());
    }
    send_json(outbox, frame);
}

fn send_json(outbox: &Outbox, frame: Value) {
    let _ = outbox.send(Message::Text(frame.to_string().into()));
}
