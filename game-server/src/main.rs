// Copyright (C) 2026 StarHuntingGames
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

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use igo_common::{
    AI_SECRET_LEN, ChatMessage, ChatThread, ClientMessage, Color, ErrorKind, Game, GameView,
    KEY_LEN, KeySet, MANAGER_ID_LEN, Move, ServerMessage,
};
use rand::{Rng, distr::Alphanumeric};
use sqlx::{
    Row,
    postgres::{PgListener, PgPool, PgPoolOptions},
};
use tokio::sync::{Mutex, mpsc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

/// Listen port when `PORT` is unset.
const DEFAULT_PORT: u16 = 8765;

/// How many times to remint player keys on a (vanishingly unlikely) key
/// collision before giving up on the request.
const KEY_MINT_ATTEMPTS: usize = 5;

const STORE_RETRY_ATTEMPTS: u32 = 4;
const STORE_RETRY_BASE: Duration = Duration::from_millis(100);

#[derive(Clone)]
struct AppState {
    store: Arc<dyn GameStore>,
    subscriptions: Subscriptions,
    manager_id: Arc<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateKind {
    GameStatus,
    Chat,
    OpponentConnected,
}

/// One store notification, routed to the session subscribed to its channel.
#[derive(Debug, Clone)]
struct Update {
    kind: UpdateKind,
    payload: String,
}

const CHANNEL_PREFIXES: [(UpdateKind, &str); 3] = [
    (UpdateKind::GameStatus, "game_status_"),
    (UpdateKind::Chat, "chat_"),
    (UpdateKind::OpponentConnected, "opponent_connected_"),
];

fn channel_kind(channel: &str) -> Option<UpdateKind> {
    CHANNEL_PREFIXES
        .iter()
        .find(|(_, prefix)| channel.starts_with(prefix))
        .map(|(kind, _)| *kind)
}

#[derive(Debug)]
enum ListenerCommand {
    Listen(String),
    Unlisten(String),
}

/// Maps notification channels to the single session subscribed to each, and
/// forwards LISTEN/UNLISTEN requests to the process-wide listener task.
#[derive(Clone)]
struct Subscriptions {
    routes: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Update>>>>,
    commands: mpsc::UnboundedSender<ListenerCommand>,
}

impl Subscriptions {
    fn new(commands: mpsc::UnboundedSender<ListenerCommand>) -> Self {
        Self {
            routes: Arc::new(Mutex::new(HashMap::new())),
            commands,
        }
    }

    async fn subscribe(&self, key: &str, updates: mpsc::UnboundedSender<Update>) {
        let mut routes = self.routes.lock().await;
        for (_, prefix) in CHANNEL_PREFIXES {
            let channel = format!("{prefix}{key}");
            routes.insert(channel.clone(), updates.clone());
            let _ = self.commands.send(ListenerCommand::Listen(channel));
        }
    }

    async fn unsubscribe(&self, key: &str) {
        let mut routes = self.routes.lock().await;
        for (_, prefix) in CHANNEL_PREFIXES {
            let channel = format!("{prefix}{key}");
            routes.remove(&channel);
            let _ = self.commands.send(ListenerCommand::Unlisten(channel));
        }
    }

    async fn route(&self, channel: &str, payload: &str) {
        let Some(kind) = channel_kind(channel) else {
            debug!(channel, "notification on an unrecognised channel");
            return;
        };
        let routes = self.routes.lock().await;
        if let Some(updates) = routes.get(channel) {
            let _ = updates.send(Update {
                kind,
                payload: payload.to_string(),
            });
        }
    }

    /// Push synthetic game and chat updates to every subscribed session.
    /// Postgres does not replay notifications issued while a listener
    /// connection was down, so after a reconnect each session must re-read
    /// the game row and the chat thread as if it had been notified.
    async fn broadcast_resync(&self) {
        let routes = self.routes.lock().await;
        for (channel, updates) in routes.iter() {
            let Some(kind) = channel_kind(channel) else {
                continue;
            };
            if matches!(kind, UpdateKind::GameStatus | UpdateKind::Chat) {
                let _ = updates.send(Update {
                    kind,
                    payload: String::new(),
                });
            }
        }
    }
}

/// Drives the shared `PgListener`: applies LISTEN/UNLISTEN requests from
/// sessions and routes incoming notifications. A dropped connection loses
/// every NOTIFY issued until the re-LISTEN completes, so both edges of the
/// gap trigger a resync broadcast: once when the loss is detected (covering
/// notifications dropped before we noticed) and once when the stream comes
/// back (covering writes that landed while we were reconnecting).
async fn run_update_listener(
    mut listener: PgListener,
    mut commands: mpsc::UnboundedReceiver<ListenerCommand>,
    subscriptions: Subscriptions,
) {
    // `try_recv` yields Ok(None) when the connection is lost and reconnects
    // on the next call, which is exactly the hook the resync needs.
    let mut resync_pending = false;
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(ListenerCommand::Listen(channel)) => {
                    if let Err(error) = listener.listen(&channel).await {
                        warn!(channel = %channel, error = %error, "failed to listen on channel");
                    }
                }
                Some(ListenerCommand::Unlisten(channel)) => {
                    if let Err(error) = listener.unlisten(&channel).await {
                        warn!(channel = %channel, error = %error, "failed to unlisten from channel");
                    }
                }
                None => break,
            },
            notification = listener.try_recv() => match notification {
                Ok(Some(notification)) => {
                    if resync_pending {
                        info!("store notification stream recovered; resyncing subscribed keys");
                        subscriptions.broadcast_resync().await;
                        resync_pending = false;
                    }
                    subscriptions
                        .route(notification.channel(), notification.payload())
                        .await;
                }
                Ok(None) => {
                    warn!("store notification connection lost; resyncing subscribed keys");
                    subscriptions.broadcast_resync().await;
                    resync_pending = true;
                }
                Err(error) => {
                    warn!(error = %error, "store notification stream interrupted");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            },
        }
    }
}

/// The persisted row for one game, as read back by a session.
#[derive(Debug, Clone)]
struct GameRecord {
    blob: Vec<u8>,
    time_played: f64,
    version: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CreateOutcome {
    Created,
    KeyCollision,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum JoinOutcome {
    Dne,
    InUse,
    AiOnly,
    Success { white_key: String, black_key: String },
}

struct CreateGameRequest<'a> {
    blob: &'a [u8],
    white_key: &'a str,
    black_key: &'a str,
    joining_color: Option<Color>,
    manager_id: &'a str,
    unsubscribe_key: Option<&'a str>,
    white_ai_secret: Option<&'a str>,
    black_ai_secret: Option<&'a str>,
}

/// The store contract. All writes go through stored procedures; the version
/// column linearises concurrent writers and the per-key notification
/// channels carry change signals between processes.
#[async_trait]
trait GameStore: Send + Sync {
    async fn create_game(&self, request: CreateGameRequest<'_>) -> anyhow::Result<CreateOutcome>;
    async fn join_game(
        &self,
        key: &str,
        manager_id: &str,
        ai_secret: Option<&str>,
    ) -> anyhow::Result<JoinOutcome>;
    /// `new_version` must be exactly one past the version the caller loaded;
    /// returns the updated time_played, or None on a version conflict.
    async fn write_game(
        &self,
        key: &str,
        blob: &[u8],
        new_version: i32,
    ) -> anyhow::Result<Option<f64>>;
    async fn write_chat(
        &self,
        timestamp: f64,
        message: &str,
        key: &str,
    ) -> anyhow::Result<Option<i64>>;
    async fn unsubscribe(&self, key: &str, manager_id: &str) -> anyhow::Result<bool>;
    async fn get_game_status(&self, key: &str) -> anyhow::Result<Option<GameRecord>>;
    async fn get_chat_updates(
        &self,
        key: &str,
        since_id: Option<i64>,
    ) -> anyhow::Result<Vec<ChatMessage>>;
    async fn get_opponent_connected(&self, key: &str) -> anyhow::Result<bool>;
    async fn cleanup(&self, manager_id: &str) -> anyhow::Result<()>;
    async fn trigger_update_all(&self, key: &str) -> anyhow::Result<()>;
}

struct PgGameStore {
    pool: PgPool,
}

impl PgGameStore {
    fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_store_color(raw: &str) -> anyhow::Result<Color> {
    match raw {
        "white" => Ok(Color::White),
        "black" => Ok(Color::Black),
        other => anyhow::bail!("unknown color {other:?} in store row"),
    }
}

#[async_trait]
impl GameStore for PgGameStore {
    async fn create_game(&self, request: CreateGameRequest<'_>) -> anyhow::Result<CreateOutcome> {
        let result = sqlx::query("CALL new_game($1, $2, $3, $4, $5, $6, $7, $8)")
            .bind(request.blob)
            .bind(request.white_key)
            .bind(request.black_key)
            .bind(request.joining_color.map(|color| color.to_string()))
            .bind(request.manager_id)
            .bind(request.unsubscribe_key)
            .bind(request.white_ai_secret)
            .bind(request.black_ai_secret)
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(sqlx::Error::Database(db_error)) if db_error.code().as_deref() == Some("23505") => {
                Ok(CreateOutcome::KeyCollision)
            }
            Err(error) => Err(error).context("new_game call failed"),
        }
    }

    async fn join_game(
        &self,
        key: &str,
        manager_id: &str,
        ai_secret: Option<&str>,
    ) -> anyhow::Result<JoinOutcome> {
        let row = sqlx::query("SELECT result, white_key, black_key FROM join_game($1, $2, $3)")
            .bind(key)
            .bind(manager_id)
            .bind(ai_secret)
            .fetch_one(&self.pool)
            .await
            .context("join_game call failed")?;
        let result: String = row.try_get("result")?;
        match result.as_str() {
            "dne" => Ok(JoinOutcome::Dne),
            "in_use" => Ok(JoinOutcome::InUse),
            "ai_only" => Ok(JoinOutcome::AiOnly),
            "success" => Ok(JoinOutcome::Success {
                white_key: row.try_get("white_key")?,
                black_key: row.try_get("black_key")?,
            }),
            other => anyhow::bail!("join_game returned unknown result {other:?}"),
        }
    }

    async fn write_game(
        &self,
        key: &str,
        blob: &[u8],
        new_version: i32,
    ) -> anyhow::Result<Option<f64>> {
        sqlx::query_scalar::<_, Option<f64>>("SELECT write_game($1, $2, $3)")
            .bind(key)
            .bind(blob)
            .bind(new_version)
            .fetch_one(&self.pool)
            .await
            .context("write_game call failed")
    }

    async fn write_chat(
        &self,
        timestamp: f64,
        message: &str,
        key: &str,
    ) -> anyhow::Result<Option<i64>> {
        sqlx::query_scalar::<_, Option<i64>>("SELECT write_chat($1, $2, $3)")
            .bind(timestamp)
            .bind(message)
            .bind(key)
            .fetch_one(&self.pool)
            .await
            .context("write_chat call failed")
    }

    async fn unsubscribe(&self, key: &str, manager_id: &str) -> anyhow::Result<bool> {
        sqlx::query_scalar::<_, bool>("SELECT unsubscribe($1, $2)")
            .bind(key)
            .bind(manager_id)
            .fetch_one(&self.pool)
            .await
            .context("unsubscribe call failed")
    }

    async fn get_game_status(&self, key: &str) -> anyhow::Result<Option<GameRecord>> {
        let row = sqlx::query("SELECT data, time_played, version FROM get_game_status($1)")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context("get_game_status call failed")?;
        match row {
            Some(row) => Ok(Some(GameRecord {
                blob: row.try_get("data")?,
                time_played: row.try_get("time_played")?,
                version: row.try_get("version")?,
            })),
            None => Ok(None),
        }
    }

    async fn get_chat_updates(
        &self,
        key: &str,
        since_id: Option<i64>,
    ) -> anyhow::Result<Vec<ChatMessage>> {
        let rows = sqlx::query("SELECT id, stamp, color, message FROM get_chat_updates($1, $2)")
            .bind(key)
            .bind(since_id)
            .fetch_all(&self.pool)
            .await
            .context("get_chat_updates call failed")?;
        rows.into_iter()
            .map(|row| {
                let color: String = row.try_get("color")?;
                Ok(ChatMessage {
                    id: Some(row.try_get::<i64, _>("id")?),
                    timestamp: row.try_get("stamp")?,
                    color: parse_store_color(&color)?,
                    message: row.try_get("message")?,
                })
            })
            .collect()
    }

    async fn get_opponent_connected(&self, key: &str) -> anyhow::Result<bool> {
        sqlx::query_scalar::<_, bool>("SELECT get_opponent_connected($1)")
            .bind(key)
            .fetch_one(&self.pool)
            .await
            .context("get_opponent_connected call failed")
    }

    async fn cleanup(&self, manager_id: &str) -> anyhow::Result<()> {
        sqlx::query("CALL do_cleanup($1)")
            .bind(manager_id)
            .execute(&self.pool)
            .await
            .context("do_cleanup call failed")?;
        Ok(())
    }

    async fn trigger_update_all(&self, key: &str) -> anyhow::Result<()> {
        sqlx::query("CALL trigger_update_all($1)")
            .bind(key)
            .execute(&self.pool)
            .await
            .context("trigger_update_all call failed")?;
        Ok(())
    }
}

fn mint_player_key() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(KEY_LEN)
        .map(char::from)
        .collect()
}

fn mint_ai_secret() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(AI_SECRET_LEN)
        .map(char::from)
        .collect()
}

fn mint_manager_id() -> String {
    let mut rng = rand::rng();
    format!("{:032x}{:032x}", rng.random::<u128>(), rng.random::<u128>())
}

fn epoch_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Retry a store call with bounded exponential backoff. Transient failures
/// are absorbed here; whatever survives the last attempt is the caller's
/// problem.
async fn with_backoff<T, F, Fut>(operation: &'static str, mut call: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut delay = STORE_RETRY_BASE;
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < STORE_RETRY_ATTEMPTS => {
                warn!(operation, attempt, error = %error, "store call failed; backing off");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "game_server=debug,tower_http=info".to_string()),
        )
        .init();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let manager_id = std::env::var("MANAGER_ID")
        .ok()
        .filter(|id| id.len() == MANAGER_ID_LEN)
        .unwrap_or_else(mint_manager_id);

    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(&database_url)
        .await
        .context("failed to connect to the game store")?;
    let store = Arc::new(PgGameStore::new(pool.clone()));

    // A restarted process may still be recorded as managing keys; release
    // them before accepting connections under the same id.
    if let Err(error) = store.cleanup(&manager_id).await {
        warn!(error = %error, "startup key cleanup failed");
    }

    let listener = PgListener::connect_with(&pool)
        .await
        .context("failed to open the store notification listener")?;
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let subscriptions = Subscriptions::new(commands_tx);
    tokio::spawn(run_update_listener(
        listener,
        commands_rx,
        subscriptions.clone(),
    ));

    let state = AppState {
        store,
        subscriptions,
        manager_id: Arc::new(manager_id),
    };
    let app = build_router(state.clone());

    let port = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);
    let bind_addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%bind_addr, manager_id = %state.manager_id, "game-server listening");
    let tcp_listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(tcp_listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "game-server"}))
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel();
    let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
    let mut session = Session::new(state, outbox_tx, updates_tx);

    loop {
        tokio::select! {
            frame = ws_receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => session.handle_frame(text.as_str()).await,
                Some(Ok(Message::Binary(_))) => {
                    session.send_error(ErrorKind::ClientProtocol, "frames must be JSON text");
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    debug!(error = %error, "websocket receive error");
                    break;
                }
                None => break,
            },
            Some(message) = outbox_rx.recv() => {
                if !forward(&mut ws_sender, &message).await {
                    break;
                }
            },
            Some(update) = updates_rx.recv() => session.handle_update(update).await,
        }
        if session.closed() {
            break;
        }
    }

    // Flush whatever is still queued (a final error, usually) before the
    // finaliser releases the key.
    while let Ok(message) = outbox_rx.try_recv() {
        if !forward(&mut ws_sender, &message).await {
            break;
        }
    }
    session.finalize().await;
}

async fn forward(
    ws_sender: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> bool {
    match serde_json::to_string(message) {
        Ok(text) => ws_sender.send(Message::Text(text.into())).await.is_ok(),
        Err(error) => {
            error!(error = %error, "failed to encode an outbound message");
            true
        }
    }
}

/// Per-connection state machine. Inbound frames are handled strictly in
/// arrival order; game state is never cached across actions — every action
/// loads the authoritative row, mutates, and writes back optimistically.
struct Session {
    store: Arc<dyn GameStore>,
    subscriptions: Subscriptions,
    manager_id: Arc<String>,
    outbox: mpsc::UnboundedSender<ServerMessage>,
    updates: mpsc::UnboundedSender<Update>,
    key: Option<String>,
    color: Option<Color>,
    last_version: i32,
    last_chat_id: i64,
    closed: bool,
}

impl Session {
    fn new(
        state: AppState,
        outbox: mpsc::UnboundedSender<ServerMessage>,
        updates: mpsc::UnboundedSender<Update>,
    ) -> Self {
        Session {
            store: state.store,
            subscriptions: state.subscriptions,
            manager_id: state.manager_id,
            outbox,
            updates,
            key: None,
            color: None,
            last_version: -1,
            last_chat_id: 0,
            closed: false,
        }
    }

    fn closed(&self) -> bool {
        self.closed
    }

    fn send(&self, message: ServerMessage) {
        let _ = self.outbox.send(message);
    }

    fn send_error(&self, kind: ErrorKind, message: impl Into<String>) {
        self.send(ServerMessage::Error {
            kind,
            message: message.into(),
        });
    }

    fn store_failure(&mut self, operation: &'static str, error: anyhow::Error) {
        error!(operation, error = %error, "store unavailable; closing session");
        self.send_error(
            ErrorKind::ServerError,
            "the game store is unavailable; please reconnect",
        );
        self.closed = true;
    }

    fn internal_failure(&mut self, operation: &'static str, error: anyhow::Error) {
        error!(operation, error = %error, "internal invariant violated; closing session");
        self.send_error(ErrorKind::ServerError, "internal server error");
        self.closed = true;
    }

    async fn handle_frame(&mut self, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => self.handle_message(message).await,
            Err(error) => {
                debug!(error = %error, "rejected a malformed client frame");
                self.send_error(
                    ErrorKind::ClientProtocol,
                    format!("malformed message: {error}"),
                );
            }
        }
    }

    async fn handle_message(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::NewGame {
                size,
                komi,
                handicap,
                your_color,
                vs_ai,
            } => {
                self.handle_new_game(
                    size,
                    komi,
                    handicap.unwrap_or(0),
                    your_color,
                    vs_ai.unwrap_or(false),
                )
                .await;
            }
            ClientMessage::JoinGame { key, ai_secret } => {
                self.handle_join_game(key, ai_secret).await;
            }
            ClientMessage::GameAction { action } => self.handle_game_action(action).await,
            ClientMessage::Chat { message } => self.handle_chat(message).await,
        }
    }

    async fn handle_new_game(
        &mut self,
        size: usize,
        komi: Option<f64>,
        handicap: u32,
        your_color: Color,
        vs_ai: bool,
    ) {
        let game = match Game::new(size, komi, handicap) {
            Ok(game) => game,
            Err(error) => {
                self.send(ServerMessage::NewGameResponse {
                    success: false,
                    explanation: error.to_string(),
                    keys: None,
                    your_color: None,
                });
                return;
            }
        };
        let blob = match game.to_blob() {
            Ok(blob) => blob,
            Err(error) => return self.internal_failure("serialise new game", error.into()),
        };

        for _ in 0..KEY_MINT_ATTEMPTS {
            let white_key = mint_player_key();
            let black_key = mint_player_key();
            // When playing the computer, the opposing key carries a secret
            // that only the AI worker will know.
            let (white_ai_secret, black_ai_secret) = if vs_ai {
                match your_color {
                    Color::White => (None, Some(mint_ai_secret())),
                    Color::Black => (Some(mint_ai_secret()), None),
                }
            } else {
                (None, None)
            };

            let store = self.store.clone();
            let manager_id = self.manager_id.clone();
            let old_key = self.key.clone();
            let outcome = with_backoff("create_game", || {
                store.create_game(CreateGameRequest {
                    blob: &blob,
                    white_key: &white_key,
                    black_key: &black_key,
                    joining_color: Some(your_color),
                    manager_id: &manager_id,
                    unsubscribe_key: old_key.as_deref(),
                    white_ai_secret: white_ai_secret.as_deref(),
                    black_ai_secret: black_ai_secret.as_deref(),
                })
            })
            .await;

            match outcome {
                Ok(CreateOutcome::Created) => {
                    if let Some(old) = self.key.take() {
                        info!(old_key = %old, "released the previous key for a new game");
                        self.subscriptions.unsubscribe(&old).await;
                    }
                    let own_key = match your_color {
                        Color::White => white_key.clone(),
                        Color::Black => black_key.clone(),
                    };
                    self.key = Some(own_key.clone());
                    self.color = Some(your_color);
                    self.last_version = 0;
                    self.last_chat_id = 0;
                    self.subscriptions
                        .subscribe(&own_key, self.updates.clone())
                        .await;

                    info!(key = %own_key, color = %your_color, "created a new game");
                    let opponent_note = if vs_ai {
                        "The AI player will join shortly"
                    } else {
                        "Give the other key to your opponent so they can join"
                    };
                    self.send(ServerMessage::NewGameResponse {
                        success: true,
                        explanation: format!(
                            "Created a new game. Your key is {own_key}; keep it to pause and \
                             resume later. {opponent_note}."
                        ),
                        keys: Some(KeySet {
                            white: white_key,
                            black: black_key,
                        }),
                        your_color: Some(your_color),
                    });
                    self.send(ServerMessage::GameStatus {
                        version: 0,
                        time_played: 0.0,
                        game: GameView::from(&game),
                    });
                    self.send(ServerMessage::Chat {
                        thread: ChatThread::complete(Vec::new()),
                    });
                    self.send(ServerMessage::OpponentConnected { connected: false });
                    return;
                }
                Ok(CreateOutcome::KeyCollision) => {
                    debug!("player key collision; reminting");
                }
                Err(error) => return self.store_failure("create_game", error),
            }
        }
        self.send_error(
            ErrorKind::ServerError,
            "could not allocate unique player keys",
        );
    }

    async fn handle_join_game(&mut self, key: String, ai_secret: Option<String>) {
        if self.key.as_deref() == Some(key.as_str()) {
            self.send(ServerMessage::JoinGameResponse {
                success: false,
                explanation: format!("You are already playing using that key ({key})"),
                keys: None,
                your_color: None,
            });
            return;
        }

        let store = self.store.clone();
        let manager_id = self.manager_id.clone();
        let outcome =
            match with_backoff("join_game", || {
                store.join_game(&key, &manager_id, ai_secret.as_deref())
            })
            .await
            {
                Ok(outcome) => outcome,
                Err(error) => return self.store_failure("join_game", error),
            };

        let failure = |explanation: String| ServerMessage::JoinGameResponse {
            success: false,
            explanation,
            keys: None,
            your_color: None,
        };
        match outcome {
            JoinOutcome::Dne => self.send(failure(format!(
                "No game was found for key {key}; double-check it and try again"
            ))),
            JoinOutcome::InUse => self.send(failure(format!(
                "Someone else is already playing using that key ({key})"
            ))),
            JoinOutcome::AiOnly => self.send(failure(format!(
                "Key {key} belongs to a computer player and cannot be joined without its secret"
            ))),
            JoinOutcome::Success {
                white_key,
                black_key,
            } => {
                if let Some(old) = self.key.take() {
                    info!(old_key = %old, "released the previous key to join another game");
                    let store = self.store.clone();
                    let manager_id = self.manager_id.clone();
                    if let Err(error) =
                        with_backoff("unsubscribe", || store.unsubscribe(&old, &manager_id)).await
                    {
                        warn!(
                            key = %old,
                            error = %error,
                            "failed to release the previous key; startup cleanup will reclaim it"
                        );
                    }
                    self.subscriptions.unsubscribe(&old).await;
                }

                let color = if white_key == key {
                    Color::White
                } else {
                    Color::Black
                };
                self.key = Some(key.clone());
                self.color = Some(color);
                self.last_version = -1;
                self.last_chat_id = 0;
                self.subscriptions.subscribe(&key, self.updates.clone()).await;

                info!(key = %key, color = %color, "joined a game");
                self.send(ServerMessage::JoinGameResponse {
                    success: true,
                    explanation: format!("Successfully (re)joined the game as {color}"),
                    keys: Some(KeySet {
                        white: white_key,
                        black: black_key,
                    }),
                    your_color: Some(color),
                });

                // The current game, chat, and opponent status arrive through
                // this session's own notification channels.
                let store = self.store.clone();
                if let Err(error) =
                    with_backoff("trigger_update_all", || store.trigger_update_all(&key)).await
                {
                    warn!(key = %key, error = %error, "failed to trigger a refresh after joining");
                }
            }
        }
    }

    async fn handle_game_action(&mut self, action: Move) {
        let Some(key) = self.key.clone() else {
            return self.send_error(ErrorKind::Unauthorized, "join a game before sending actions");
        };
        if self.color != Some(action.color()) {
            return self.send_error(ErrorKind::Unauthorized, "you may only act for your own color");
        }

        let store = self.store.clone();
        let record = match with_backoff("get_game_status", || store.get_game_status(&key)).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return self.internal_failure(
                    "load game",
                    anyhow::anyhow!("no game behind bound key {key}"),
                );
            }
            Err(error) => return self.store_failure("get_game_status", error),
        };
        let mut game = match Game::from_blob(&record.blob) {
            Ok(game) => game,
            Err(error) => return self.internal_failure("decode game blob", error.into()),
        };

        if let Err(error) = game.apply(action) {
            info!(key = %key, error = %error, "rejected an illegal action");
            return self.send_error(ErrorKind::IllegalMove, error.to_string());
        }

        let blob = match game.to_blob() {
            Ok(blob) => blob,
            Err(error) => return self.internal_failure("serialise game", error.into()),
        };
        let new_version = record.version + 1;
        let store = self.store.clone();
        match with_backoff("write_game", || store.write_game(&key, &blob, new_version)).await {
            Ok(Some(time_played)) => {
                self.last_version = new_version;
                self.send(ServerMessage::GameActionResponse {
                    success: true,
                    explanation: "action applied".to_string(),
                });
                self.send(ServerMessage::GameStatus {
                    version: new_version,
                    time_played,
                    game: GameView::from(&game),
                });
            }
            Ok(None) => {
                info!(key = %key, version = new_version, "write preempted by a concurrent update");
                self.send(ServerMessage::GameActionResponse {
                    success: false,
                    explanation: "the game changed under you; catching up".to_string(),
                });
                self.refresh_game_status().await;
            }
            Err(error) => self.store_failure("write_game", error),
        }
    }

    async fn handle_chat(&mut self, message: String) {
        let Some(key) = self.key.clone() else {
            return self.send_error(ErrorKind::Unauthorized, "join a game before chatting");
        };
        let timestamp = epoch_seconds();
        let store = self.store.clone();
        // No local echo: the session answers its own chat NOTIFY, which
        // carries the database-assigned message id.
        match with_backoff("write_chat", || store.write_chat(timestamp, &message, &key)).await {
            Ok(Some(id)) => debug!(key = %key, id, "chat message written"),
            Ok(None) => warn!(key = %key, "chat write found no game for the key"),
            Err(error) => self.store_failure("write_chat", error),
        }
    }

    async fn handle_update(&mut self, update: Update) {
        match update.kind {
            UpdateKind::GameStatus => self.refresh_game_status().await,
            UpdateKind::Chat => {
                self.refresh_chat(update.payload.trim().parse().ok()).await;
            }
            UpdateKind::OpponentConnected => match update.payload.as_str() {
                "true" => self.send(ServerMessage::OpponentConnected { connected: true }),
                "false" => self.send(ServerMessage::OpponentConnected { connected: false }),
                _ => {
                    let Some(key) = self.key.clone() else { return };
                    let store = self.store.clone();
                    match with_backoff("get_opponent_connected", || {
                        store.get_opponent_connected(&key)
                    })
                    .await
                    {
                        Ok(connected) => {
                            self.send(ServerMessage::OpponentConnected { connected });
                        }
                        Err(error) => self.store_failure("get_opponent_connected", error),
                    }
                }
            },
        }
    }

    /// Fetch the latest game row and push it iff it is strictly newer than
    /// whatever this session last sent; older or duplicate notifications are
    /// absorbed here.
    async fn refresh_game_status(&mut self) {
        let Some(key) = self.key.clone() else { return };
        let store = self.store.clone();
        let record = match with_backoff("get_game_status", || store.get_game_status(&key)).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(key = %key, "status refresh found no game");
                return;
            }
            Err(error) => return self.store_failure("get_game_status", error),
        };
        if record.version <= self.last_version {
            return;
        }
        let game = match Game::from_blob(&record.blob) {
            Ok(game) => game,
            Err(error) => return self.internal_failure("decode game blob", error.into()),
        };
        self.last_version = record.version;
        self.send(ServerMessage::GameStatus {
            version: record.version,
            time_played: record.time_played,
            game: GameView::from(&game),
        });
    }

    async fn refresh_chat(&mut self, notified_id: Option<i64>) {
        let Some(key) = self.key.clone() else { return };
        if let Some(id) = notified_id
            && id <= self.last_chat_id
        {
            // At-least-once delivery; this row already went out.
            return;
        }

        let store = self.store.clone();
        let since = notified_id;
        let messages =
            match with_backoff("get_chat_updates", || store.get_chat_updates(&key, since)).await {
                Ok(messages) => messages,
                Err(error) => return self.store_failure("get_chat_updates", error),
            };
        if let Some(max_id) = messages.iter().filter_map(|message| message.id).max() {
            self.last_chat_id = self.last_chat_id.max(max_id);
        }
        let thread = match notified_id {
            Some(_) => {
                if messages.is_empty() {
                    return;
                }
                ChatThread::partial(messages)
            }
            None => ChatThread::complete(messages),
        };
        self.send(ServerMessage::Chat { thread });
    }

    async fn finalize(&mut self) {
        let Some(key) = self.key.take() else {
            debug!("client with no subscriptions disconnected");
            return;
        };
        self.subscriptions.unsubscribe(&key).await;
        let store = self.store.clone();
        let manager_id = self.manager_id.clone();
        match with_backoff("unsubscribe", || store.unsubscribe(&key, &manager_id)).await {
            Ok(true) => info!(key = %key, "released key on disconnect"),
            Ok(false) => warn!(key = %key, "disconnect found no managed record for the key"),
            Err(error) => warn!(
                key = %key,
                error = %error,
                "failed to release key on disconnect; startup cleanup will reclaim it"
            ),
        }
    }
}
