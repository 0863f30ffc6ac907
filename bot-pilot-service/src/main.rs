// Copyright (C) 2026 Marionette
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use marionette_common::{
    BotInfo, BotStatus, CHAT_HISTORY_CAP, ChatEntry, ClientId, ClientMessage, ConnectRequest,
    ControlAction, MAX_STAT_VALUE, MoveDirection, SERVER_CHAT_USERNAME, ServerAddress, ServerPush,
    SessionId, describe_connection_failure, describe_kick_reason, extract_mismatched_version,
    parse_server_address, validate_connect_request,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio::time::{MissedTickBehavior, interval};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    registry: ClientRegistry,
    manager: SessionManager,
    directory: Arc<dyn BotDirectory>,
}

#[derive(Clone)]
struct ServiceSettings {
    default_game_version: String,
    spawn_timeout: Duration,
    jump_release_delay: Duration,
    version_retry_delay: Duration,
    keepalive_interval: Duration,
}

impl ServiceSettings {
    fn from_env() -> Self {
        Self {
            default_game_version: std::env::var("BOT_PILOT_DEFAULT_GAME_VERSION")
                .unwrap_or_else(|_| "1.21.1".to_string()),
            spawn_timeout: env_duration_ms("BOT_PILOT_SPAWN_TIMEOUT_MS", 20_000),
            jump_release_delay: env_duration_ms("BOT_PILOT_JUMP_RELEASE_MS", 100),
            version_retry_delay: env_duration_ms("BOT_PILOT_VERSION_RETRY_DELAY_MS", 1_000),
            keepalive_interval: Duration::from_secs(
                std::env::var("BOT_PILOT_KEEPALIVE_SECONDS")
                    .ok()
                    .and_then(|raw| raw.parse::<u64>().ok())
                    .unwrap_or(30),
            ),
        }
    }
}

fn env_duration_ms(var_name: &str, default_ms: u64) -> Duration {
    Duration::from_millis(
        std::env::var(var_name)
            .ok()
            .and_then(|raw| raw.parse::<u64>().ok())
            .unwrap_or(default_ms),
    )
}

fn parse_bind_addr(var_name: &str, default_addr: &str) -> anyhow::Result<SocketAddr> {
    let raw = std::env::var(var_name).unwrap_or_else(|_| default_addr.to_string());
    raw.parse::<SocketAddr>()
        .with_context(|| format!("invalid listen address in {}: {}", var_name, raw))
}

/// One piloted bot, keyed by session id in the manager's table.
struct BotSession {
    session_id: SessionId,
    client_id: ClientId,
    bot_name: String,
    bot_count: u32,
    record_id: String,
    server: ServerAddress,
    status: BotStatus,
    chat_history: VecDeque<ChatEntry>,
    pending_reconnect: bool,
    controls: Arc<dyn GameControls>,
    worker: Option<SessionWorkerHandle>,
}

impl BotSession {
    fn bot_info(&self) -> BotInfo {
        BotInfo {
            name: self.bot_name.clone(),
            count: self.bot_count,
            server_ip: self.server.to_string(),
            health: self.status.health.round() as u8,
            food: self.status.food.round() as u8,
        }
    }
}

struct SessionWorkerHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    join: tokio::task::JoinHandle<()>,
}

/// Immutable facts a session worker needs without touching the table.
#[derive(Clone)]
struct SessionContext {
    session_id: SessionId,
    client_id: ClientId,
    bot_name: String,
    record_id: String,
    server: ServerAddress,
}

/// Lifecycle notifications a game connection emits, consumed one at a time
/// by the owning session worker.
#[derive(Debug)]
enum GameEvent {
    Login,
    Spawn,
    Health { health: f32, food: f32 },
    Chat { username: Option<String>, content: String },
    Kicked { reason: Value },
    Error { message: String },
    End { reason: String },
}

#[derive(Debug, Clone)]
struct ConnectOptions {
    host: String,
    port: u16,
    username: String,
    version: String,
}

/// One live connection to the game server: a command surface plus the
/// event stream the connection produces.
struct GameSession {
    controls: Arc<dyn GameControls>,
    events: mpsc::UnboundedReceiver<GameEvent>,
}

#[async_trait]
trait GameConnector: Send + Sync {
    async fn connect(&self, options: &ConnectOptions) -> anyhow::Result<GameSession>;
}

#[async_trait]
trait GameControls: Send + Sync {
    /// Clears every held movement intent, then holds `direction` if present.
    async fn steer(&self, direction: Option<MoveDirection>) -> anyhow::Result<()>;
    async fn set_jump(&self, active: bool) -> anyhow::Result<()>;
    async fn grounded(&self) -> anyhow::Result<bool>;
    async fn attack_nearest(&self) -> anyhow::Result<()>;
    async fn use_held_item(&self) -> anyhow::Result<()>;
    async fn send_chat(&self, text: &str) -> anyhow::Result<()>;
    async fn quit(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BotRecord {
    bot_id: String,
    name: String,
    server_address: String,
    connected: bool,
    health: u8,
    food: u8,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[async_trait]
trait BotDirectory: Send + Sync {
    async fn create(&self, record: BotRecord) -> anyhow::Result<()>;
    async fn get(&self, bot_id: &str) -> anyhow::Result<Option<BotRecord>>;
    async fn list(&self) -> anyhow::Result<Vec<BotRecord>>;
    async fn set_connected(&self, bot_id: &str, connected: bool) -> anyhow::Result<()>;
    async fn update_vitals(&self, bot_id: &str, health: u8, food: u8) -> anyhow::Result<()>;
    async fn delete(&self, bot_id: &str) -> anyhow::Result<bool>;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "bot_pilot_service=debug,tower_http=info".to_string()),
        )
        .init();

    let settings = ServiceSettings::from_env();
    let registry = ClientRegistry::default();
    let directory: Arc<dyn BotDirectory> = Arc::new(InMemoryDirectory::default());
    let connector: Arc<dyn GameConnector> = Arc::new(DriverConnector::from_env());
    let manager = SessionManager::new(settings, connector, directory.clone(), registry.clone());

    let state = AppState {
        registry,
        manager: manager.clone(),
        directory,
    };
    let app = build_router(state);

    let bind_addr = parse_bind_addr("BOT_PILOT_BIND", "0.0.0.0:8093")?;
    info!(%bind_addr, "bot-pilot-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.disconnect_all().await;
    info!("bot-pilot-service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(error = %error, "failed to listen for shutdown signal");
    }
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .route("/v1/bots", get(list_bots_handler))
        .route("/v1/bots/{bot_id}", get(get_bot_handler).delete(delete_bot_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "bot-pilot-service"}))
}

async fn list_bots_handler(State(state): State<AppState>) -> Result<Json<Vec<BotRecord>>, ApiError> {
    let records = state
        .directory
        .list()
        .await
        .map_err(|error| ApiError::internal(format!("failed to list bot records: {:#}", error)))?;
    Ok(Json(records))
}

async fn get_bot_handler(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
) -> Result<Json<BotRecord>, ApiError> {
    let record = state
        .directory
        .get(&bot_id)
        .await
        .map_err(|error| ApiError::internal(format!("failed to load bot record: {:#}", error)))?
        .ok_or_else(|| ApiError::not_found(format!("bot {} not found", bot_id)))?;
    Ok(Json(record))
}

#[derive(Debug, Serialize)]
struct DeleteBotResponse {
    deleted: bool,
    bot_id: String,
}

async fn delete_bot_handler(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
) -> Result<Json<DeleteBotResponse>, ApiError> {
    let deleted = state
        .directory
        .delete(&bot_id)
        .await
        .map_err(|error| ApiError::internal(format!("failed to delete bot record: {:#}", error)))?;
    if deleted {
        info!(bot_id = %bot_id, "bot record deleted");
    }
    Ok(Json(DeleteBotResponse { deleted, bot_id }))
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Runs one browser connection: pushes outbound events, answers inbound
/// commands, and keeps the socket alive with periodic pings. Closing the
/// socket for any reason tears down whatever session the client owned.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let client_id = Uuid::new_v4().to_string();
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<ServerPush>();
    state.registry.register(&client_id, push_tx).await;
    info!(client_id = %client_id, "browser client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut active_session: Option<SessionId> = None;

    let mut keepalive = interval(state.manager.settings.keepalive_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately; consume it so pings start one
    // interval from now
    keepalive.tick().await;

    loop {
        tokio::select! {
            maybe_push = push_rx.recv() => {
                let Some(push) = maybe_push else { break; };
                let payload = match serde_json::to_string(&push) {
                    Ok(payload) => payload,
                    Err(error) => {
                        warn!(client_id = %client_id, error = %error, "failed to encode push");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(payload.into())).await.is_err() {
                    debug!(client_id = %client_id, "push send failed; dropping connection");
                    break;
                }
            }
            _ = keepalive.tick() => {
                if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                    debug!(client_id = %client_id, "keepalive ping failed; dropping connection");
                    break;
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&state, &client_id, &mut active_session, text.as_str())
                            .await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        debug!(client_id = %client_id, error = %error, "websocket receive failed");
                        break;
                    }
                }
            }
        }
    }

    state.manager.disconnect_client(&client_id).await;
    info!(client_id = %client_id, "browser client disconnected");
}

async fn handle_client_message(
    state: &AppState,
    client_id: &str,
    active_session: &mut Option<SessionId>,
    raw: &str,
) {
    let message = match serde_json::from_str::<ClientMessage>(raw) {
        Ok(message) => message,
        Err(error) => {
            debug!(client_id = %client_id, error = %error, "unparseable client message");
            state
                .registry
                .send(client_id, ServerPush::Error {
                    message: "unrecognized message payload".to_string(),
                })
                .await;
            return;
        }
    };

    match message {
        ClientMessage::Connect { data } => {
            if let Err(invalid) = validate_connect_request(&data) {
                state
                    .registry
                    .send(client_id, ServerPush::Error { message: invalid.as_str().to_string() })
                    .await;
                return;
            }
            state
                .registry
                .send(client_id, ServerPush::Info {
                    message: format!(
                        "spawning {} on {}",
                        data.bot_name.trim(),
                        data.server_ip.trim()
                    ),
                })
                .await;
            match state.manager.create_session(client_id, &data).await {
                Ok(session_id) => {
                    *active_session = Some(session_id);
                }
                Err(error) => {
                    warn!(
                        client_id = %client_id,
                        error = %format!("{:#}", error),
                        "session creation failed"
                    );
                    state
                        .registry
                        .send(client_id, ServerPush::Error {
                            message: format!("could not create bot: {:#}", error),
                        })
                        .await;
                }
            }
        }
        ClientMessage::Disconnect => {
            if let Some(session_id) = active_session.take() {
                state.manager.disconnect_session(&session_id).await;
            }
            // acked even when nothing was connected so the browser can
            // settle its state machine
            state.registry.send(client_id, ServerPush::Disconnected).await;
        }
        ClientMessage::Cancel => {
            if let Some(session_id) = active_session.take() {
                state.manager.disconnect_session(&session_id).await;
            }
        }
        ClientMessage::GetBotInfo => {
            let info = match active_session.as_deref() {
                Some(session_id) => state.manager.bot_info(session_id).await,
                None => None,
            };
            if let Some(data) = info {
                state.registry.send(client_id, ServerPush::BotInfo { data }).await;
            }
        }
        ClientMessage::Control { action } => {
            let delivered = match active_session.as_deref() {
                Some(session_id) => state.manager.control_bot(session_id, &action).await,
                None => false,
            };
            if !delivered {
                debug!(client_id = %client_id, action = %action, "control not delivered");
            }
        }
        ClientMessage::Chat { message } => {
            let delivered = match active_session.as_deref() {
                Some(session_id) => state.manager.send_chat(session_id, &message).await,
                None => false,
            };
            if !delivered {
                debug!(client_id = %client_id, "chat not delivered");
            }
        }
    }
}

/// Push channels for connected browser clients, keyed by client id.
#[derive(Clone, Default)]
struct ClientRegistry {
    clients: Arc<Mutex<HashMap<ClientId, mpsc::UnboundedSender<ServerPush>>>>,
}

impl ClientRegistry {
    async fn register(&self, client_id: &str, push_tx: mpsc::UnboundedSender<ServerPush>) {
        self.clients.lock().await.insert(client_id.to_string(), push_tx);
    }

    async fn unregister(&self, client_id: &str) {
        self.clients.lock().await.remove(client_id);
    }

    /// Best-effort push. A missing or closed channel means the browser is
    /// gone; the event is dropped without surfacing an error.
    async fn send(&self, client_id: &str, push: ServerPush) {
        let push_tx = { self.clients.lock().await.get(client_id).cloned() };
        let Some(push_tx) = push_tx else {
            debug!(client_id = %client_id, "dropping push for unregistered client");
            return;
        };
        if push_tx.send(push).is_err() {
            debug!(client_id = %client_id, "dropping push for closed client channel");
        }
    }
}

/// Owns the session table and drives every bot lifecycle transition.
#[derive(Clone)]
struct SessionManager {
    settings: ServiceSettings,
    connector: Arc<dyn GameConnector>,
    directory: Arc<dyn BotDirectory>,
    registry: ClientRegistry,
    sessions: Arc<Mutex<HashMap<SessionId, BotSession>>>,
}

enum EventOutcome {
    Continue,
    ReplaceAdapter(mpsc::UnboundedReceiver<GameEvent>),
    Teardown,
    Stale,
}

impl SessionManager {
    fn new(
        settings: ServiceSettings,
        connector: Arc<dyn GameConnector>,
        directory: Arc<dyn BotDirectory>,
        registry: ClientRegistry,
    ) -> Self {
        Self {
            settings,
            connector,
            directory,
            registry,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Creates a bot session for `client_id` and starts connecting in the
    /// background. Returns once the record and worker exist; spawn progress
    /// is reported through the client's push channel.
    async fn create_session(
        &self,
        client_id: &str,
        request: &ConnectRequest,
    ) -> anyhow::Result<SessionId> {
        let bot_name = request.bot_name.trim().to_string();
        if bot_name.is_empty() {
            anyhow::bail!("bot name must not be empty");
        }
        let server = parse_server_address(&request.server_ip)
            .with_context(|| format!("malformed server address {:?}", request.server_ip))?;

        // one bot per client: a fresh connect supersedes the previous session
        if let Some(existing) = self.session_for_client(client_id).await {
            info!(
                client_id = %client_id,
                session_id = %existing,
                "client reconnecting; dropping previous session"
            );
            self.disconnect_session(&existing).await;
        }

        let session_id = format!("{}-{}", bot_name, Utc::now().timestamp_millis());
        let record_id = format!("bot-{}", Uuid::new_v4());
        let now = Utc::now();
        self.directory
            .create(BotRecord {
                bot_id: record_id.clone(),
                name: bot_name.clone(),
                server_address: server.to_string(),
                connected: false,
                health: MAX_STAT_VALUE as u8,
                food: MAX_STAT_VALUE as u8,
                created_at: now,
                updated_at: now,
            })
            .await
            .context("failed to record bot entry")?;

        let options = ConnectOptions {
            host: server.host.clone(),
            port: server.port,
            username: bot_name.clone(),
            version: self.settings.default_game_version.clone(),
        };
        let game = match self.connector.connect(&options).await {
            Ok(game) => game,
            Err(error) => {
                if let Err(delete_error) = self.directory.delete(&record_id).await {
                    warn!(
                        record_id = %record_id,
                        error = %delete_error,
                        "failed to remove record for dead session"
                    );
                }
                return Err(error)
                    .with_context(|| format!("failed to open game connection to {}", server));
            }
        };
        let GameSession { controls, events } = game;

        let ctx = SessionContext {
            session_id: session_id.clone(),
            client_id: client_id.to_string(),
            bot_name: bot_name.clone(),
            record_id: record_id.clone(),
            server: server.clone(),
        };
        let session = BotSession {
            session_id: session_id.clone(),
            client_id: client_id.to_string(),
            bot_name,
            bot_count: request.bot_count,
            record_id,
            server: server.clone(),
            status: BotStatus {
                health: MAX_STAT_VALUE,
                food: MAX_STAT_VALUE,
                server_host: server.host.clone(),
                server_port: server.port,
            },
            chat_history: VecDeque::new(),
            pending_reconnect: false,
            controls,
            worker: None,
        };
        // insert before spawning the worker so a fast first event finds the
        // table entry
        self.sessions.lock().await.insert(session_id.clone(), session);

        let worker = spawn_session_worker(self.clone(), ctx, events);
        if let Some(session) = self.sessions.lock().await.get_mut(&session_id) {
            session.worker = Some(worker);
        } else {
            // torn down before the worker slot was filled
            let mut worker = worker;
            if let Some(stop_tx) = worker.stop_tx.take() {
                let _ = stop_tx.send(());
            }
            worker.join.abort();
        }

        info!(
            session_id = %session_id,
            client_id = %client_id,
            server = %server,
            "bot session created"
        );
        Ok(session_id)
    }

    async fn session_for_client(&self, client_id: &str) -> Option<SessionId> {
        self.sessions
            .lock()
            .await
            .iter()
            .find(|(_, session)| session.client_id == client_id)
            .map(|(session_id, _)| session_id.clone())
    }

    async fn status(&self, session_id: &str) -> Option<BotStatus> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .map(|session| session.status.clone())
    }

    async fn chat_history(&self, session_id: &str) -> Vec<ChatEntry> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .map(|session| session.chat_history.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn bot_info(&self, session_id: &str) -> Option<BotInfo> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .map(|session| session.bot_info())
    }

    /// Applies a raw control action to the session's bot. Unknown actions
    /// are ignored and still count as delivered; a missing session or a
    /// rejected command reports failure.
    async fn control_bot(&self, session_id: &str, action: &str) -> bool {
        let controls = {
            self.sessions
                .lock()
                .await
                .get(session_id)
                .map(|session| session.controls.clone())
        };
        let Some(controls) = controls else {
            debug!(session_id = %session_id, action = %action, "control for unknown session");
            return false;
        };
        let Some(parsed) = ControlAction::parse(action) else {
            debug!(session_id = %session_id, action = %action, "ignoring unrecognized control action");
            return true;
        };
        match self.dispatch_control(&controls, session_id, parsed).await {
            Ok(()) => true,
            Err(error) => {
                warn!(
                    session_id = %session_id,
                    action = %action,
                    error = %format!("{:#}", error),
                    "control dispatch failed"
                );
                false
            }
        }
    }

    async fn dispatch_control(
        &self,
        controls: &Arc<dyn GameControls>,
        session_id: &str,
        action: ControlAction,
    ) -> anyhow::Result<()> {
        match action {
            ControlAction::Forward => controls.steer(Some(MoveDirection::Forward)).await,
            ControlAction::Backward => controls.steer(Some(MoveDirection::Back)).await,
            ControlAction::Left => controls.steer(Some(MoveDirection::Left)).await,
            ControlAction::Right => controls.steer(Some(MoveDirection::Right)).await,
            ControlAction::Stop => controls.steer(None).await,
            ControlAction::Jump => self.start_jump(controls, session_id).await,
            ControlAction::Attack => controls.attack_nearest().await,
            ControlAction::Use => controls.use_held_item().await,
        }
    }

    /// Jumps are fire-and-forget: the intent is held briefly and released
    /// by a timer instead of a matching client command.
    async fn start_jump(
        &self,
        controls: &Arc<dyn GameControls>,
        session_id: &str,
    ) -> anyhow::Result<()> {
        if !controls.grounded().await? {
            debug!(session_id = %session_id, "jump ignored while airborne");
            return Ok(());
        }
        controls.set_jump(true).await?;
        let manager = self.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(manager.settings.jump_release_delay).await;
            release_jump_if_live(&manager, &session_id).await;
        });
        Ok(())
    }

    async fn send_chat(&self, session_id: &str, text: &str) -> bool {
        let controls = {
            self.sessions
                .lock()
                .await
                .get(session_id)
                .map(|session| session.controls.clone())
        };
        let Some(controls) = controls else {
            debug!(session_id = %session_id, "chat for unknown session");
            return false;
        };
        match controls.send_chat(text).await {
            Ok(()) => true,
            Err(error) => {
                warn!(
                    session_id = %session_id,
                    error = %format!("{:#}", error),
                    "chat dispatch failed"
                );
                false
            }
        }
    }

    /// External teardown: stops the worker, closes the game connection, and
    /// forgets the session. Safe to call twice; the second call reports false.
    async fn disconnect_session(&self, session_id: &str) -> bool {
        let removed = { self.sessions.lock().await.remove(session_id) };
        let Some(mut session) = removed else {
            debug!(session_id = %session_id, "disconnect for unknown session");
            return false;
        };
        if let Some(mut worker) = session.worker.take() {
            if let Some(stop_tx) = worker.stop_tx.take() {
                let _ = stop_tx.send(());
            }
            worker.join.abort();
        }
        self.close_game_half(&session).await;
        true
    }

    /// Teardown driven from inside the session's own worker. The worker is
    /// about to return on its own, so only the game half is closed here;
    /// aborting the join handle would cancel the caller mid-cleanup.
    async fn finish_session(&self, session_id: &str) {
        let removed = { self.sessions.lock().await.remove(session_id) };
        let Some(session) = removed else {
            return;
        };
        self.close_game_half(&session).await;
    }

    async fn close_game_half(&self, session: &BotSession) {
        if let Err(error) = session.controls.quit().await {
            debug!(
                session_id = %session.session_id,
                error = %error,
                "game connection quit failed"
            );
        }
        if let Err(error) = self.directory.set_connected(&session.record_id, false).await {
            warn!(
                session_id = %session.session_id,
                error = %error,
                "failed to mark bot record disconnected"
            );
        }
        info!(
            session_id = %session.session_id,
            client_id = %session.client_id,
            "bot session removed"
        );
    }

    /// Connection-close path: tears down the client's session, if any, and
    /// forgets its push channel.
    async fn disconnect_client(&self, client_id: &str) {
        if let Some(session_id) = self.session_for_client(client_id).await {
            self.disconnect_session(&session_id).await;
        }
        self.registry.unregister(client_id).await;
    }

    async fn disconnect_all(&self) {
        let session_ids: Vec<SessionId> =
            { self.sessions.lock().await.keys().cloned().collect() };
        if session_ids.is_empty() {
            return;
        }
        info!(session_count = session_ids.len(), "disconnecting all bot sessions");
        for session_id in session_ids {
            self.disconnect_session(&session_id).await;
        }
    }

    async fn handle_game_event(
        &self,
        ctx: &SessionContext,
        event: GameEvent,
        awaiting_spawn: &mut bool,
    ) -> EventOutcome {
        match event {
            GameEvent::Login => {
                debug!(session_id = %ctx.session_id, "bot finished the protocol handshake");
                EventOutcome::Continue
            }
            GameEvent::Spawn => {
                *awaiting_spawn = false;
                info!(
                    session_id = %ctx.session_id,
                    bot_name = %ctx.bot_name,
                    server = %ctx.server,
                    "bot spawned in world"
                );
                if let Err(error) = self.directory.set_connected(&ctx.record_id, true).await {
                    warn!(
                        session_id = %ctx.session_id,
                        error = %error,
                        "failed to mark bot record connected"
                    );
                }
                self.registry.send(&ctx.client_id, ServerPush::Connected).await;
                EventOutcome::Continue
            }
            GameEvent::Health { health, food } => {
                let health = health.clamp(0.0, MAX_STAT_VALUE);
                let food = food.clamp(0.0, MAX_STAT_VALUE);
                let snapshot = {
                    let mut sessions = self.sessions.lock().await;
                    let Some(session) = sessions.get_mut(&ctx.session_id) else {
                        return EventOutcome::Stale;
                    };
                    session.status.health = health;
                    session.status.food = food;
                    session.bot_info()
                };
                if let Err(error) = self
                    .directory
                    .update_vitals(&ctx.record_id, snapshot.health, snapshot.food)
                    .await
                {
                    warn!(
                        session_id = %ctx.session_id,
                        error = %error,
                        "failed to persist bot vitals"
                    );
                }
                self.registry
                    .send(&ctx.client_id, ServerPush::BotInfo { data: snapshot })
                    .await;
                EventOutcome::Continue
            }
            GameEvent::Chat { username, content } => {
                let entry = ChatEntry {
                    username: username.unwrap_or_else(|| SERVER_CHAT_USERNAME.to_string()),
                    content,
                    timestamp_millis: Utc::now().timestamp_millis(),
                };
                {
                    let mut sessions = self.sessions.lock().await;
                    let Some(session) = sessions.get_mut(&ctx.session_id) else {
                        return EventOutcome::Stale;
                    };
                    session.chat_history.push_back(entry.clone());
                    while session.chat_history.len() > CHAT_HISTORY_CAP {
                        session.chat_history.pop_front();
                    }
                }
                self.registry
                    .send(&ctx.client_id, ServerPush::Chat { message: entry })
                    .await;
                EventOutcome::Continue
            }
            GameEvent::Kicked { reason } => {
                let detail = describe_kick_reason(&reason);
                warn!(
                    session_id = %ctx.session_id,
                    reason = %detail,
                    "bot kicked from server"
                );
                self.registry
                    .send(&ctx.client_id, ServerPush::Error {
                        message: format!("kicked by {}: {}", ctx.server, detail),
                    })
                    .await;
                EventOutcome::Teardown
            }
            GameEvent::End { reason } => {
                let reason = if reason.trim().is_empty() {
                    "connection closed".to_string()
                } else {
                    reason
                };
                info!(session_id = %ctx.session_id, reason = %reason, "game connection ended");
                self.registry
                    .send(&ctx.client_id, ServerPush::Error {
                        message: format!("disconnected from {}: {}", ctx.server, reason),
                    })
                    .await;
                EventOutcome::Teardown
            }
            GameEvent::Error { message } => {
                // any error settles the connect attempt, so the spawn
                // timeout must not fire on top of it
                *awaiting_spawn = false;
                if let Some(version) = extract_mismatched_version(&message) {
                    self.retry_with_version(ctx, version).await
                } else {
                    warn!(
                        session_id = %ctx.session_id,
                        error = %message,
                        "game connection error"
                    );
                    self.registry
                        .send(&ctx.client_id, ServerPush::Error {
                            message: describe_connection_failure(&message, &ctx.server),
                        })
                        .await;
                    EventOutcome::Teardown
                }
            }
        }
    }

    /// Version-mismatch recovery: tear down the outdated connection, wait a
    /// beat, and reconnect speaking the version the server reported. The
    /// session keeps its id; only the adapter underneath is replaced.
    async fn retry_with_version(&self, ctx: &SessionContext, version: String) -> EventOutcome {
        info!(
            session_id = %ctx.session_id,
            version = %version,
            "game version mismatch; scheduling reconnect"
        );
        self.registry
            .send(&ctx.client_id, ServerPush::Error {
                message: format!(
                    "game version mismatch; retrying {} as version {}",
                    ctx.server, version
                ),
            })
            .await;

        let old_controls = {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(&ctx.session_id) else {
                return EventOutcome::Stale;
            };
            session.pending_reconnect = true;
            session.controls.clone()
        };
        if let Err(error) = old_controls.quit().await {
            debug!(
                session_id = %ctx.session_id,
                error = %error,
                "failed to close outdated game connection"
            );
        }

        tokio::time::sleep(self.settings.version_retry_delay).await;

        let options = ConnectOptions {
            host: ctx.server.host.clone(),
            port: ctx.server.port,
            username: ctx.bot_name.clone(),
            version: version.clone(),
        };
        let replacement = match self.connector.connect(&options).await {
            Ok(replacement) => replacement,
            Err(error) => {
                warn!(
                    session_id = %ctx.session_id,
                    version = %version,
                    error = %format!("{:#}", error),
                    "version retry failed"
                );
                self.registry
                    .send(&ctx.client_id, ServerPush::Error {
                        message: format!("reconnect to {} failed: {:#}", ctx.server, error),
                    })
                    .await;
                return EventOutcome::Teardown;
            }
        };
        let GameSession { controls, events } = replacement;
        let installed = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(&ctx.session_id) {
                Some(session) => {
                    session.controls = controls.clone();
                    session.pending_reconnect = false;
                    true
                }
                None => false,
            }
        };
        if !installed {
            // torn down while reconnecting; don't leak the fresh child
            if let Err(error) = controls.quit().await {
                debug!(
                    session_id = %ctx.session_id,
                    error = %error,
                    "failed to close orphaned replacement connection"
                );
            }
            return EventOutcome::Stale;
        }
        info!(
            session_id = %ctx.session_id,
            version = %version,
            "installed replacement game connection"
        );
        EventOutcome::ReplaceAdapter(events)
    }
}

fn spawn_session_worker(
    manager: SessionManager,
    ctx: SessionContext,
    events: mpsc::UnboundedReceiver<GameEvent>,
) -> SessionWorkerHandle {
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(run_session_worker(manager, ctx, events, stop_rx));
    SessionWorkerHandle {
        stop_tx: Some(stop_tx),
        join,
    }
}

/// Single dispatch point for one session's lifecycle: game events arrive
/// here in order, the spawn timeout is armed here, and every teardown path
/// funnels through the manager.
async fn run_session_worker(
    manager: SessionManager,
    ctx: SessionContext,
    mut events: mpsc::UnboundedReceiver<GameEvent>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let spawn_deadline = tokio::time::sleep(manager.settings.spawn_timeout);
    tokio::pin!(spawn_deadline);
    let mut awaiting_spawn = true;

    debug!(
        session_id = %ctx.session_id,
        client_id = %ctx.client_id,
        server = %ctx.server,
        "session worker started"
    );

    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                debug!(session_id = %ctx.session_id, "session worker stopping");
                break;
            }
            _ = &mut spawn_deadline, if awaiting_spawn => {
                warn!(
                    session_id = %ctx.session_id,
                    server = %ctx.server,
                    "bot never spawned within the connect window"
                );
                manager
                    .registry
                    .send(&ctx.client_id, ServerPush::Error {
                        message: format!(
                            "{} did not respond before the connect timeout",
                            ctx.server
                        ),
                    })
                    .await;
                manager.finish_session(&ctx.session_id).await;
                break;
            }
            maybe_event = events.recv() => {
                let Some(event) = maybe_event else {
                    warn!(
                        session_id = %ctx.session_id,
                        "game connection closed without a lifecycle event"
                    );
                    manager
                        .registry
                        .send(&ctx.client_id, ServerPush::Error {
                            message: format!("connection to {} closed unexpectedly", ctx.server),
                        })
                        .await;
                    manager.finish_session(&ctx.session_id).await;
                    break;
                };
                match manager.handle_game_event(&ctx, event, &mut awaiting_spawn).await {
                    EventOutcome::Continue => {}
                    EventOutcome::ReplaceAdapter(next_events) => {
                        events = next_events;
                    }
                    EventOutcome::Teardown => {
                        manager.finish_session(&ctx.session_id).await;
                        break;
                    }
                    EventOutcome::Stale => break,
                }
            }
        }
    }
}

/// The release timer re-reads the table so a session torn down or swapped
/// to a fresh adapter in the meantime is left alone.
async fn release_jump_if_live(manager: &SessionManager, session_id: &str) {
    let controls = {
        manager
            .sessions
            .lock()
            .await
            .get(session_id)
            .map(|session| session.controls.clone())
    };
    let Some(controls) = controls else {
        debug!(session_id = %session_id, "skipping jump release for removed session");
        return;
    };
    if let Err(error) = controls.set_jump(false).await {
        debug!(session_id = %session_id, error = %error, "failed to release jump intent");
    }
}

/// Spawns the out-of-process protocol driver that actually speaks to the
/// game server. Commands go to its stdin as JSON lines; lifecycle events
/// come back on stdout the same way.
struct DriverConnector {
    driver_bin: String,
    driver_script: String,
}

impl DriverConnector {
    fn from_env() -> Self {
        Self {
            driver_bin: std::env::var("BOT_PILOT_DRIVER_BIN")
                .unwrap_or_else(|_| "node".to_string()),
            driver_script: std::env::var("BOT_PILOT_DRIVER_SCRIPT")
                .unwrap_or_else(|_| "/app/driver/bot-driver.js".to_string()),
        }
    }
}

#[async_trait]
impl GameConnector for DriverConnector {
    async fn connect(&self, options: &ConnectOptions) -> anyhow::Result<GameSession> {
        let mut command = Command::new(&self.driver_bin);
        command
            .arg(&self.driver_script)
            .arg("--host")
            .arg(&options.host)
            .arg("--port")
            .arg(options.port.to_string())
            .arg("--username")
            .arg(&options.username)
            .arg("--version")
            .arg(&options.version)
            .arg("--offline")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn game driver {}", self.driver_bin))?;
        let stdin = child.stdin.take().context("game driver stdin unavailable")?;
        let stdout = child.stdout.take().context("game driver stdout unavailable")?;

        let grounded = Arc::new(AtomicBool::new(false));
        let (events_tx, events_rx) = mpsc::unbounded_channel::<GameEvent>();
        tokio::spawn(pump_driver_events(stdout, events_tx, grounded.clone()));

        let controls = Arc::new(DriverControls {
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            grounded,
        });
        Ok(GameSession {
            controls,
            events: events_rx,
        })
    }
}

/// Reads driver stdout line by line. Physics ticks only refresh the shared
/// grounded flag; everything else is forwarded to the session worker.
async fn pump_driver_events(
    stdout: ChildStdout,
    events_tx: mpsc::UnboundedSender<GameEvent>,
    grounded: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let parsed = match serde_json::from_str::<DriverLine>(trimmed) {
                    Ok(parsed) => parsed,
                    Err(error) => {
                        debug!(error = %error, "ignoring unparseable driver line");
                        continue;
                    }
                };
                if let DriverLine::Physics { grounded: on_ground } = &parsed {
                    grounded.store(*on_ground, Ordering::Relaxed);
                    continue;
                }
                if let Some(event) = parsed.into_event() {
                    if events_tx.send(event).is_err() {
                        break;
                    }
                }
            }
            Ok(None) => break,
            Err(error) => {
                debug!(error = %error, "driver stdout read failed");
                break;
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum DriverLine {
    Login,
    Spawn,
    Health {
        health: f32,
        food: f32,
    },
    Chat {
        #[serde(default)]
        username: Option<String>,
        content: String,
    },
    Kicked {
        reason: Value,
    },
    Error {
        message: String,
    },
    End {
        #[serde(default)]
        reason: String,
    },
    Physics {
        grounded: bool,
    },
}

impl DriverLine {
    fn into_event(self) -> Option<GameEvent> {
        match self {
            DriverLine::Login => Some(GameEvent::Login),
            DriverLine::Spawn => Some(GameEvent::Spawn),
            DriverLine::Health { health, food } => Some(GameEvent::Health { health, food }),
            DriverLine::Chat { username, content } => {
                Some(GameEvent::Chat { username, content })
            }
            DriverLine::Kicked { reason } => Some(GameEvent::Kicked { reason }),
            DriverLine::Error { message } => Some(GameEvent::Error { message }),
            DriverLine::End { reason } => Some(GameEvent::End { reason }),
            DriverLine::Physics { .. } => None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum DriverCommand<'a> {
    Steer { direction: Option<MoveDirection> },
    Jump { active: bool },
    Attack,
    UseItem,
    Chat { text: &'a str },
    Quit,
}

struct DriverControls {
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    grounded: Arc<AtomicBool>,
}

impl DriverControls {
    async fn write_command(&self, command: &DriverCommand<'_>) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(command).context("failed to encode driver command")?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .context("failed to write driver command")?;
        stdin.flush().await.context("failed to flush driver command")?;
        Ok(())
    }
}

#[async_trait]
impl GameControls for DriverControls {
    async fn steer(&self, direction: Option<MoveDirection>) -> anyhow::Result<()> {
        self.write_command(&DriverCommand::Steer { direction }).await
    }

    async fn set_jump(&self, active: bool) -> anyhow::Result<()> {
        self.write_command(&DriverCommand::Jump { active }).await
    }

    async fn grounded(&self) -> anyhow::Result<bool> {
        Ok(self.grounded.load(Ordering::Relaxed))
    }

    async fn attack_nearest(&self) -> anyhow::Result<()> {
        self.write_command(&DriverCommand::Attack).await
    }

    async fn use_held_item(&self) -> anyhow::Result<()> {
        self.write_command(&DriverCommand::UseItem).await
    }

    async fn send_chat(&self, text: &str) -> anyhow::Result<()> {
        self.write_command(&DriverCommand::Chat { text }).await
    }

    /// Best effort: ask the driver to leave cleanly, then make sure the
    /// child is gone either way.
    async fn quit(&self) -> anyhow::Result<()> {
        let _ = self.write_command(&DriverCommand::Quit).await;
        let mut child = self.child.lock().await;
        let _ = child.kill().await;
        let _ = child.wait().await;
        Ok(())
    }
}

/// Process-local bot record store behind the directory trait.
#[derive(Default)]
struct InMemoryDirectory {
    records: RwLock<HashMap<String, BotRecord>>,
}

#[async_trait]
impl BotDirectory for InMemoryDirectory {
    async fn create(&self, record: BotRecord) -> anyhow::Result<()> {
        self.records.write().await.insert(record.bot_id.clone(), record);
        Ok(())
    }

    async fn get(&self, bot_id: &str) -> anyhow::Result<Option<BotRecord>> {
        Ok(self.records.read().await.get(bot_id).cloned())
    }

    async fn list(&self) -> anyhow::Result<Vec<BotRecord>> {
        let mut records: Vec<BotRecord> =
            self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    async fn set_connected(&self, bot_id: &str, connected: bool) -> anyhow::Result<()> {
        if let Some(record) = self.records.write().await.get_mut(bot_id) {
            record.connected = connected;
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_vitals(&self, bot_id: &str, health: u8, food: u8) -> anyhow::Result<()> {
        if let Some(record) = self.records.write().await.get_mut(bot_id) {
            record.health = health;
            record.food = food;
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn delete(&self, bot_id: &str) -> anyhow::Result<bool> {
        Ok(self.records.write().await.remove(bot_id).is_some())
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
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
        warn!(status = %self.status, message = %self.message, "bot-pilot-service request failed");
        (self.status, Json(serde_json::json!({"error": self.message}))).into_response()
    }
}
