use crate::quiz::InMemoryQuiz;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
#[allow(unused)]
use metrics::{counter, gauge, histogram};
use stagger_core::{ClientMessage, QuizProgress, QuizService, ServerMessage};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

const LEADERBOARD_CHANNEL_CAPACITY: usize = 64;

/// Knobs for shaping the mock's behaviour under load.
#[derive(Clone, Debug)]
pub struct ServerOptions {
    /// Artificial delay before each request is handled.
    pub delay: Duration,
    /// Requests per second handled before replying with `rate_limited` errors.
    pub max_rps: Option<NonZeroU32>,
    /// Entries per `leaderboard_update`; zero disables the broadcasts.
    pub leaderboard_size: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            max_rps: None,
            leaderboard_size: 10,
        }
    }
}

impl ServerOptions {
    /// `MOCK_DELAY_MS`, `MOCK_MAX_RPS` and `MOCK_LEADERBOARD_SIZE`, each optional.
    pub fn from_env() -> Self {
        let read = |key: &str| std::env::var(key).ok().and_then(|raw| raw.trim().parse::<u64>().ok());
        let defaults = Self::default();
        Self {
            delay: read("MOCK_DELAY_MS").map_or(defaults.delay, Duration::from_millis),
            max_rps: read("MOCK_MAX_RPS")
                .and_then(|rps| u32::try_from(rps).ok())
                .and_then(NonZeroU32::new),
            leaderboard_size: read("MOCK_LEADERBOARD_SIZE")
                .map_or(defaults.leaderboard_size, |size| size as usize),
        }
    }
}

#[derive(Clone)]
struct AppState {
    quiz: Arc<InMemoryQuiz>,
    sessions: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
    limiter: Option<Arc<DefaultDirectRateLimiter>>,
    options: ServerOptions,
}

pub fn router(quiz: Arc<InMemoryQuiz>, options: ServerOptions) -> Router {
    let state = AppState {
        quiz,
        sessions: Arc::new(Mutex::new(HashMap::new())),
        limiter: options
            .max_rps
            .map(|rps| Arc::new(RateLimiter::direct(Quota::per_second(rps)))),
        options,
    };

    Router::new()
        .route("/", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on an already bound listener until the process is stopped.
pub async fn serve(
    listener: TcpListener,
    quiz: Arc<InMemoryQuiz>,
    options: ServerOptions,
) -> std::io::Result<()> {
    axum::serve(listener, router(quiz, options)).await
}

/// Bind `addr`, announce readiness and serve.
pub async fn run(
    addr: SocketAddr,
    quiz: Arc<InMemoryQuiz>,
    options: ServerOptions,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    let port = listener.local_addr()?.port();
    info!(
        event = "server_started",
        port,
        questions = quiz.question_count(),
        "Quiz server listening"
    );
    serve(listener, quiz, options).await?;
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

#[derive(Default)]
struct Connection {
    session_id: Option<String>,
    leaderboard: Option<JoinHandle<()>>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = self.leaderboard.take() {
            task.abort();
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    counter!("mock_service.connections").increment(1);
    let (mut sink, mut stream) = socket.split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut connection = Connection::default();
    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Message::Close(_) => break,
            _ => continue,
        };
        state.handle_text(&text, &mut connection, &outbound).await;
    }

    debug!("Connection closed (session {:?})", connection.session_id);
    drop(connection);
    drop(outbound);
    let _ = writer.await;
    state.prune_sessions();
}

impl AppState {
    async fn handle_text(
        &self,
        text: &str,
        connection: &mut Connection,
        outbound: &mpsc::UnboundedSender<String>,
    ) {
        let reply = |message: ServerMessage| match serde_json::to_string(&message) {
            Ok(text) => {
                let _ = outbound.send(text);
            }
            Err(err) => warn!("Failed to encode reply: {err}"),
        };

        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                debug!("Unparseable payload: {err}");
                return reply(ServerMessage::error("parse_error", "Invalid JSON payload."));
            }
        };
        let Ok(request) = serde_json::from_value::<ClientMessage>(value) else {
            return reply(ServerMessage::error("invalid_message", "Unsupported message shape."));
        };

        if !self.options.delay.is_zero() {
            tokio::time::sleep(self.options.delay).await;
        }
        if let Some(limiter) = &self.limiter {
            if limiter.check().is_err() {
                counter!("mock_service.rate_limited").increment(1);
                return reply(ServerMessage::error("rate_limited", "Too many requests."));
            }
        }

        match request {
            ClientMessage::Join {
                session_id,
                user_id,
            } => {
                counter!("mock_service.joins").increment(1);
                self.attach(connection, &session_id, outbound);
                match self.quiz.join(&session_id, &user_id) {
                    Ok(progress) => {
                        reply(ServerMessage::Joined {
                            session_id: session_id.clone(),
                            user_id: user_id.clone(),
                        });
                        self.broadcast_leaderboard(&session_id);
                        reply(self.next_step(&session_id, &user_id, progress));
                    }
                    Err(err) => reply(ServerMessage::error("internal", err.to_string())),
                }
            }
            ClientMessage::Answer {
                session_id,
                user_id,
                question_id,
                choice_id,
            } => {
                counter!("mock_service.answers").increment(1);
                if connection
                    .session_id
                    .as_ref()
                    .is_some_and(|joined| *joined != session_id)
                {
                    return reply(ServerMessage::error(
                        "quiz_mismatch",
                        "Quiz ID does not match session.",
                    ));
                }
                let sent_at = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64;
                match self
                    .quiz
                    .answer(&session_id, &user_id, &question_id, &choice_id, sent_at)
                {
                    Ok(progress) => {
                        self.broadcast_leaderboard(&session_id);
                        reply(self.next_step(&session_id, &user_id, progress));
                    }
                    Err(err) => reply(ServerMessage::error("internal", err.to_string())),
                }
            }
        }
    }

    /// Subscribe the connection to `session_id`'s leaderboard updates.
    fn attach(
        &self,
        connection: &mut Connection,
        session_id: &str,
        outbound: &mpsc::UnboundedSender<String>,
    ) {
        if connection.session_id.as_deref() == Some(session_id) {
            return;
        }
        connection.session_id = Some(session_id.to_string());
        if let Some(task) = connection.leaderboard.take() {
            task.abort();
        }
        if self.options.leaderboard_size == 0 {
            return;
        }

        let Ok(mut sessions) = self.sessions.lock() else {
            return;
        };
        let mut updates = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(LEADERBOARD_CHANNEL_CAPACITY).0)
            .subscribe();
        let outbound = outbound.clone();
        connection.leaderboard = Some(tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(text) => {
                        if outbound.send(text).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Leaderboard subscriber skipped {skipped} updates");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    fn broadcast_leaderboard(&self, session_id: &str) {
        if self.options.leaderboard_size == 0 {
            return;
        }
        let sender = match self.sessions.lock() {
            Ok(sessions) => sessions.get(session_id).cloned(),
            Err(_) => None,
        };
        let Some(sender) = sender else {
            return;
        };
        let leaderboard = match self.quiz.leaderboard(session_id, self.options.leaderboard_size) {
            Ok(leaderboard) => leaderboard,
            Err(err) => {
                warn!("Failed to build leaderboard: {err}");
                return;
            }
        };
        let update = ServerMessage::LeaderboardUpdate {
            session_id: session_id.to_string(),
            leaderboard,
        };
        if let Ok(text) = serde_json::to_string(&update) {
            let _ = sender.send(text);
        }
    }

    fn next_step(&self, session_id: &str, user_id: &str, progress: QuizProgress) -> ServerMessage {
        match progress.next_question {
            Some(question) => ServerMessage::from(question),
            None => ServerMessage::QuizComplete {
                score: self.quiz.score(session_id, user_id).unwrap_or_default(),
            },
        }
    }

    /// Forget sessions nobody is subscribed to anymore.
    fn prune_sessions(&self) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.retain(|_, sender| sender.receiver_count() > 0);
        }
    }
}
