use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{CloseFrame, Message};
use bridge_protocol::{BridgeConfig, Envelope, RelayError, TargetInfo};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::web;

/// Reserved upgrade path for the agent (browser extension) peer.
pub const AGENT_PATH: &str = "/extension";
/// Reserved upgrade path for the automation driver peer.
pub const DRIVER_PATH: &str = "/cdp";

/// Deadline for relay-initiated commands.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between WebSocket ping frames.
pub(crate) const WS_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum time to wait for a pong response before considering the connection dead.
/// This allows 3 missed pings (3 * 30s = 90s).
pub(crate) const WS_PONG_TIMEOUT: Duration = Duration::from_secs(90);

/// Close reason sent to a driver socket displaced by a newer one.
const DRIVER_REPLACED_REASON: &str = "New connection established";

/// Queue feeding a connection's single writer. Everything sent to a peer goes
/// through its outbox, so per-socket ordering follows from the single consumer.
pub(crate) type Outbox = mpsc::UnboundedSender<Message>;

type Waiter = oneshot::Sender<Result<Value, RelayError>>;

pub(crate) fn close_frame(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_owned().into(),
    }))
}

/// The currently bound agent connection.
struct AgentSlot {
    conn_id: Uuid,
    outbox: Outbox,
    /// Empty until the agent sends its connection_info.
    session_id: String,
    target_info: Option<TargetInfo>,
}

/// The currently bound driver connection.
struct DriverSlot {
    conn_id: Uuid,
    outbox: Outbox,
}

/// One in-flight command, tracked by id.
///
/// Relay-initiated commands carry a waiter; commands forwarded on behalf of
/// the driver are tracked without one (the driver correlates its own
/// responses) so the entry only feeds diagnostics and navigation-refresh
/// triggering, and never times out.
pub(crate) struct PendingRequest {
    pub(crate) waiter: Option<Waiter>,
    pub(crate) session_id: Option<String>,
    pub(crate) method: String,
    pub(crate) params: Option<Value>,
}

struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct RelayState {
    agent: Option<AgentSlot>,
    driver: Option<DriverSlot>,
    pending: HashMap<u32, PendingRequest>,
    next_id: u32,
    server: Option<ServerHandle>,
}

impl RelayState {
    fn new() -> Self {
        Self {
            agent: None,
            driver: None,
            pending: HashMap::new(),
            next_id: 1,
            server: None,
        }
    }

    fn mint_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Drain the pending table, handing back every entry to fail.
    fn drain_pending(&mut self) -> Vec<(u32, PendingRequest)> {
        self.pending.drain().collect()
    }
}

/// Build a debug-protocol error envelope, echoing the session id of the
/// original request when one was supplied.
pub(crate) fn error_envelope(
    id: u32,
    session_id: Option<&str>,
    code: i64,
    message: &str,
) -> Value {
    let mut frame = json!({ "id": id, "error": { "code": code, "message": message } });
    if let Some(session_id) = session_id {
        frame["sessionId"] = Value::String(session_id.to_owned());
    }
    frame
}

/// The relay: one agent slot, one driver slot, and the machinery to route
/// debug-protocol traffic between them.
///
/// All shared state lives behind a single coarse mutex; critical sections
/// only touch maps and slots, never the network. Cloning is cheap and every
/// clone addresses the same relay.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    config: BridgeConfig,
    state: Mutex<RelayState>,
}

impl Relay {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                config,
                state: Mutex::new(RelayState::new()),
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RelayState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The axum router hosting both WebSocket endpoints. Exposed so the relay
    /// can be mounted into an externally owned HTTP server instead of
    /// [`start`](Self::start)ing its own listener.
    pub fn router(&self) -> Router {
        web::build_router(self.clone())
    }

    /// Bind the configured address and start serving both endpoints.
    /// A relay that is already running is left untouched.
    pub async fn start(&self) -> Result<(), RelayError> {
        if self.lock_state().server.is_some() {
            tracing::debug!("Relay already started");
            return Ok(());
        }

        let addr = format!(
            "{}:{}",
            self.inner.config.server.bind, self.inner.config.server.port
        );
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| RelayError::Bind {
            addr: addr.clone(),
            source,
        })?;

        let app = self.router();
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let shutdown = async {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!("Relay server error: {e}");
            }
        });

        self.lock_state().server = Some(ServerHandle {
            local_addr,
            shutdown,
            task,
        });
        tracing::info!(%local_addr, "Relay listening");
        Ok(())
    }

    /// Shut the relay down: close both peer sockets with a normal close, fail
    /// every in-flight command, and stop the HTTP listener. Idempotent.
    pub async fn stop(&self) {
        let (agent, driver, pending, server) = {
            let mut state = self.lock_state();
            (
                state.agent.take(),
                state.driver.take(),
                state.drain_pending(),
                state.server.take(),
            )
        };

        fail_pending(pending, driver.as_ref().map(|slot| &slot.outbox));
        if let Some(slot) = agent {
            let _ = slot.outbox.send(close_frame(1000, ""));
        }
        if let Some(slot) = driver {
            let _ = slot.outbox.send(close_frame(1000, ""));
        }

        if let Some(server) = server {
            let _ = server.shutdown.send(());
            if let Err(e) = server.task.await {
                tracing::debug!("Relay server task join error: {e}");
            }
            tracing::info!("Relay stopped");
        }
    }

    /// True once an agent is bound, has announced its session, and its socket
    /// is still open.
    pub fn is_connected(&self) -> bool {
        self.lock_state()
            .agent
            .as_ref()
            .is_some_and(|slot| !slot.session_id.is_empty() && !slot.outbox.is_closed())
    }

    /// The active debug session id, if the agent has announced one.
    pub fn session_id(&self) -> Option<String> {
        self.lock_state()
            .agent
            .as_ref()
            .filter(|slot| !slot.session_id.is_empty())
            .map(|slot| slot.session_id.clone())
    }

    /// Latest known target attribute bag for the active agent.
    pub fn target_info(&self) -> Option<TargetInfo> {
        self.lock_state()
            .agent
            .as_ref()
            .and_then(|slot| slot.target_info.clone())
    }

    /// Advertisement string operators paste into the extension.
    pub fn agent_url(&self) -> String {
        format!("ws://{}{}", self.advertised_addr(), AGENT_PATH)
    }

    /// Advertisement string handed to the automation client.
    pub fn driver_url(&self) -> String {
        format!("ws://{}{}", self.advertised_addr(), DRIVER_PATH)
    }

    fn advertised_addr(&self) -> String {
        match &self.lock_state().server {
            Some(server) => server.local_addr.to_string(),
            None => format!(
                "{}:{}",
                self.inner.config.server.bind, self.inner.config.server.port
            ),
        }
    }

    /// Dispatch a command to the agent on behalf of the relay itself and wait
    /// for the matching response.
    pub async fn send_command(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<&str>,
    ) -> Result<Value, RelayError> {
        let (id, outbox, response) = {
            let mut state = self.lock_state();
            let outbox = match state.agent.as_ref() {
                Some(slot) if !slot.session_id.is_empty() && !slot.outbox.is_closed() => {
                    slot.outbox.clone()
                }
                _ => return Err(RelayError::NotConnected),
            };
            let id = state.mint_id();
            let (waiter, response) = oneshot::channel();
            state.pending.insert(
                id,
                PendingRequest {
                    waiter: Some(waiter),
                    session_id: session_id.map(str::to_owned),
                    method: method.to_owned(),
                    params: params.clone(),
                },
            );
            (id, outbox, response)
        };

        let mut frame = json!({ "id": id, "method": method });
        if let Some(params) = params {
            frame["params"] = params;
        }
        if let Some(session_id) = session_id {
            frame["sessionId"] = Value::String(session_id.to_owned());
        }

        tracing::debug!(id, %method, "Relay command to extension");
        if outbox.send(Message::Text(frame.to_string().into())).is_err() {
            self.lock_state().pending.remove(&id);
            return Err(RelayError::ConnectionClosed);
        }

        match tokio::time::timeout(COMMAND_TIMEOUT, response).await {
            Ok(Ok(outcome)) => outcome,
            // Waiter dropped without completing: the agent slot was torn down.
            Ok(Err(_)) => Err(RelayError::ConnectionClosed),
            Err(_) => {
                // A response racing the deadline may have removed the entry already.
                self.lock_state().pending.remove(&id);
                Err(RelayError::CommandTimeout {
                    method: method.to_owned(),
                })
            }
        }
    }

    // ── Agent endpoint transitions ──

    /// Bind a freshly upgraded agent socket, evicting any previous agent.
    /// The new agent always wins; survivors of the old one's pending table
    /// fail with ConnectionClosed before the new socket sees any traffic.
    pub(crate) fn bind_agent(&self, outbox: Outbox) -> Uuid {
        let conn_id = Uuid::new_v4();
        let (evicted, pending, driver) = {
            let mut state = self.lock_state();
            let evicted = state.agent.take();
            let pending = state.drain_pending();
            let driver = state.driver.as_ref().map(|slot| slot.outbox.clone());
            state.agent = Some(AgentSlot {
                conn_id,
                outbox,
                session_id: String::new(),
                target_info: None,
            });
            (evicted, pending, driver)
        };

        if let Some(old) = evicted {
            tracing::info!(old = %old.conn_id, new = %conn_id, "Evicting previous extension connection");
            let _ = old.outbox.send(close_frame(1000, ""));
        }
        fail_pending(pending, driver.as_ref());
        conn_id
    }

    /// Clear the agent slot after its socket closed or errored. Stale calls
    /// from an evicted connection's task are ignored.
    pub(crate) fn agent_gone(&self, conn_id: Uuid) {
        let (pending, driver) = {
            let mut state = self.lock_state();
            if !state
                .agent
                .as_ref()
                .is_some_and(|slot| slot.conn_id == conn_id)
            {
                return;
            }
            state.agent = None;
            let driver = state.driver.as_ref().map(|slot| slot.outbox.clone());
            (state.drain_pending(), driver)
        };
        if !pending.is_empty() {
            tracing::info!(
                count = pending.len(),
                "Failing in-flight commands after extension disconnect"
            );
        }
        fail_pending(pending, driver.as_ref());
    }

    pub(crate) fn set_connection_info(
        &self,
        conn_id: Uuid,
        session_id: String,
        target_info: Option<TargetInfo>,
    ) {
        let mut state = self.lock_state();
        if let Some(slot) = state.agent.as_mut() {
            if slot.conn_id != conn_id {
                return;
            }
            tracing::info!(session_id = %session_id, "Extension attached to target");
            slot.session_id = session_id;
            slot.target_info = target_info;
        }
    }

    pub(crate) fn take_pending(&self, id: u32) -> Option<PendingRequest> {
        self.lock_state().pending.remove(&id)
    }

    // ── Driver endpoint transitions ──

    /// Bind a freshly upgraded driver socket, closing any previous driver.
    pub(crate) fn bind_driver(&self, outbox: Outbox) -> Uuid {
        let conn_id = Uuid::new_v4();
        let evicted = {
            let mut state = self.lock_state();
            state.driver.replace(DriverSlot { conn_id, outbox })
        };
        if let Some(old) = evicted {
            tracing::info!(old = %old.conn_id, new = %conn_id, "Evicting previous driver connection");
            let _ = old.outbox.send(close_frame(1000, DRIVER_REPLACED_REASON));
        }
        conn_id
    }

    pub(crate) fn driver_gone(&self, conn_id: Uuid) {
        let mut state = self.lock_state();
        if state
            .driver
            .as_ref()
            .is_some_and(|slot| slot.conn_id == conn_id)
        {
            state.driver = None;
        }
    }

    pub(crate) fn driver_outbox(&self) -> Option<Outbox> {
        self.lock_state()
            .driver
            .as_ref()
            .map(|slot| slot.outbox.clone())
    }

    /// Session id and target info snapshot, present only when fully connected.
    pub(crate) fn connected_target(&self) -> Option<(String, TargetInfo)> {
        let state = self.lock_state();
        state.agent.as_ref().and_then(|slot| {
            if slot.session_id.is_empty() || slot.outbox.is_closed() {
                return None;
            }
            Some((
                slot.session_id.clone(),
                slot.target_info.clone().unwrap_or_default(),
            ))
        })
    }

    /// Forward a driver command to the agent unchanged. Commands carrying an
    /// id get a waiterless pending entry for diagnostics and refresh
    /// triggering. Returns false when no agent is connected.
    pub(crate) fn forward_to_agent(&self, env: &Envelope, raw: &str) -> bool {
        let outbox = {
            let mut state = self.lock_state();
            let outbox = match state.agent.as_ref() {
                Some(slot) if !slot.session_id.is_empty() && !slot.outbox.is_closed() => {
                    slot.outbox.clone()
                }
                _ => return false,
            };
            if let Some(id) = env.id {
                state.pending.insert(
                    id,
                    PendingRequest {
                        waiter: None,
                        session_id: env.session_id.clone(),
                        method: env.method.clone().unwrap_or_default(),
                        params: env.params.clone(),
                    },
                );
            }
            outbox
        };
        if outbox.send(Message::Text(raw.to_owned().into())).is_err() {
            // Agent vanished between check and send; the caller answers this id itself.
            if let Some(id) = env.id {
                self.lock_state().pending.remove(&id);
            }
            return false;
        }
        true
    }

    // ── Target tracker ──

    /// Kick off a best-effort target-info refresh after a navigation hint.
    /// Failures are swallowed; concurrent refreshes simply overwrite the
    /// cache in completion order.
    pub(crate) fn schedule_target_refresh(&self) {
        let relay = self.clone();
        tokio::spawn(async move {
            if let Err(e) = relay.refresh_target_info().await {
                tracing::debug!("Target info refresh failed: {e}");
            }
        });
    }

    async fn refresh_target_info(&self) -> Result<(), RelayError> {
        let Some(session_id) = self.session_id() else {
            return Ok(());
        };
        let url = self
            .evaluate_string("window.location.href", &session_id)
            .await?;
        let title = self.evaluate_string("document.title", &session_id).await?;

        let mut state = self.lock_state();
        if let Some(slot) = state.agent.as_mut() {
            let info = slot.target_info.get_or_insert_with(TargetInfo::new);
            if info.get("url").and_then(Value::as_str) != Some(url.as_str()) {
                tracing::debug!(%url, %title, "Target info refreshed after navigation");
                info.insert("url".to_owned(), Value::String(url));
                info.insert("title".to_owned(), Value::String(title));
            }
        }
        Ok(())
    }

    async fn evaluate_string(
        &self,
        expression: &str,
        session_id: &str,
    ) -> Result<String, RelayError> {
        let result = self
            .send_command(
                "Runtime.evaluate",
                Some(json!({ "expression": expression, "returnByValue": true })),
                Some(session_id),
            )
            .await?;
        Ok(result
            .pointer("/result/value")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned())
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.lock_state().pending.len()
    }
}

/// Fail a batch of drained pending entries after the agent went away.
/// Relay-initiated entries reject their waiter; driver-originated entries
/// get a synthesized error response on the driver socket.
fn fail_pending(entries: Vec<(u32, PendingRequest)>, driver: Option<&Outbox>) {
    for (id, entry) in entries {
        match entry.waiter {
            Some(waiter) => {
                let _ = waiter.send(Err(RelayError::ConnectionClosed));
            }
            None => {
                if let Some(driver) = driver {
                    let frame = error_envelope(
                        id,
                        entry.session_id.as_deref(),
                        -32000,
                        "Extension connection closed",
                    );
                    let _ = driver.send(Message::Text(frame.to_string().into()));
                }
            }
        }
    }
}

// ── End-to-end tests ──
//
// These bind a real relay on an ephemeral port and talk to both endpoints
// with a plain tokio-tungstenite client, so they exercise the wire behavior
// drivers and extensions actually observe.
