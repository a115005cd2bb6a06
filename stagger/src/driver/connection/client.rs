//! One persistent WebSocket connection with at most one outstanding request.
use crate::error::DriverError;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use stagger_core::{ClientMessage, OperationOutcome, RequestKind};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};

/// How an outstanding request ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Completion {
    Question,
    QuizComplete,
    Error,
    Timeout,
    Close,
}

impl Completion {
    pub fn is_ok(&self) -> bool {
        matches!(self, Completion::Question | Completion::QuizComplete)
    }

    /// The completion a frame of type `kind` resolves, if it is a reply at all.
    fn for_reply(kind: &str) -> Option<Self> {
        match kind {
            "question" => Some(Completion::Question),
            "quiz_complete" => Some(Completion::QuizComplete),
            "error" => Some(Completion::Error),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Reply {
    pub completion: Completion,
    pub latency: Duration,
}

impl Reply {
    /// A request that was never sent.
    fn refused() -> Self {
        Self {
            completion: Completion::Close,
            latency: Duration::ZERO,
        }
    }

    pub fn outcome(&self) -> OperationOutcome {
        OperationOutcome::from(self.completion.is_ok()).with_latency(self.latency)
    }
}

struct PendingRequest {
    kind: RequestKind,
    ticket: u64,
    started_at: Instant,
    resolve: oneshot::Sender<Reply>,
}

impl PendingRequest {
    fn resolve(self, completion: Completion) {
        let latency = self.started_at.elapsed();
        trace!("{:?} request #{} resolved as {completion:?}", self.kind, self.ticket);
        // NOTE: The waiter may already have given up; the first resolution is the only one.
        let _ = self.resolve.send(Reply {
            completion,
            latency,
        });
    }
}

#[derive(Default)]
struct ClientState {
    open: bool,
    closed: bool,
    user_id: String,
    current_question_id: Option<String>,
    pending: Option<PendingRequest>,
    next_ticket: u64,
}

impl ClientState {
    fn mark_closed(&mut self) {
        self.open = false;
        self.closed = true;
        if let Some(pending) = self.pending.take() {
            pending.resolve(Completion::Close);
        }
    }
}

pub(crate) struct StressClient {
    id: u64,
    state: Arc<Mutex<ClientState>>,
    outbound: mpsc::UnboundedSender<Message>,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: JoinHandle<()>,
    response_timeout: Duration,
}

impl StressClient {
    /// Open a connection to `url`, giving up after `response_timeout`.
    pub async fn connect(
        id: u64,
        url: &str,
        response_timeout: Duration,
    ) -> Result<Self, DriverError> {
        let (stream, _response) = timeout(response_timeout, connect_async(url))
            .await
            .map_err(|_| DriverError::ConnectTimeout(url.to_string()))??;
        let (mut sink, mut stream) = stream.split();

        let state = Arc::new(Mutex::new(ClientState {
            open: true,
            ..ClientState::default()
        }));

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(err) = sink.send(message).await {
                    debug!("Connection #{id} write failed: {err}");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader = {
            let state = state.clone();
            tokio::spawn(async move {
                while let Some(message) = stream.next().await {
                    match message {
                        Ok(Message::Text(text)) => handle_text(&state, &text),
                        Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                            Ok(text) => handle_text(&state, &text),
                            Err(_) => trace!("Connection #{id} ignoring non-UTF-8 frame"),
                        },
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(err) => {
                            debug!("Connection #{id} read failed: {err}");
                            break;
                        }
                    }
                }
                if let Ok(mut state) = state.lock() {
                    state.mark_closed();
                }
            })
        };

        trace!("Connection #{id} open to {url}");
        Ok(Self {
            id,
            state,
            outbound,
            reader: Mutex::new(Some(reader)),
            writer,
            response_timeout,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Open with nothing outstanding.
    pub fn is_idle(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.open && !state.closed && state.pending.is_none())
            .unwrap_or(false)
    }

    pub fn is_open(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.open && !state.closed)
            .unwrap_or(false)
    }

    pub fn user_id(&self) -> Option<String> {
        self.state.lock().ok().map(|state| state.user_id.clone())
    }

    pub fn current_question_id(&self) -> Option<String> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.current_question_id.clone())
    }

    /// Join as `user_id`, which becomes this connection's identity.
    pub async fn join(&self, session_id: &str, user_id: &str) -> Result<Reply, DriverError> {
        self.state.lock()?.user_id = user_id.to_string();
        self.send_and_wait(&ClientMessage::Join {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
        })
        .await
    }

    /// Send `message` and wait for the next reply, the response timeout or the connection closing.
    ///
    /// A connection that is closed or already has a request outstanding refuses immediately
    /// without touching the network.
    pub async fn send_and_wait(&self, message: &ClientMessage) -> Result<Reply, DriverError> {
        let payload = serde_json::to_string(message)?;
        let (resolve, mut reply) = oneshot::channel();
        let started_at = Instant::now();

        let ticket = {
            let mut state = self.state.lock()?;
            if !state.open || state.closed || state.pending.is_some() {
                return Ok(Reply::refused());
            }
            state.next_ticket += 1;
            let ticket = state.next_ticket;
            state.pending = Some(PendingRequest {
                kind: message.kind(),
                ticket,
                started_at,
                resolve,
            });
            if self.outbound.send(Message::Text(payload)).is_err() {
                state.mark_closed();
            }
            ticket
        };

        match timeout(self.response_timeout, &mut reply).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Ok(Reply {
                completion: Completion::Close,
                latency: started_at.elapsed(),
            }),
            Err(_) => {
                let mut state = self.state.lock()?;
                let ours = state
                    .pending
                    .as_ref()
                    .is_some_and(|pending| pending.ticket == ticket);
                if ours {
                    if let Some(pending) = state.pending.take() {
                        pending.resolve(Completion::Timeout);
                    }
                }
                drop(state);
                // NOTE: Whichever of the reader and the timer resolved first is already queued.
                Ok(reply.try_recv().unwrap_or(Reply {
                    completion: Completion::Timeout,
                    latency: started_at.elapsed(),
                }))
            }
        }
    }

    /// Request a close and wait up to `grace` for the server to finish it.
    pub async fn close(&self, grace: Duration) {
        if !self.is_open() {
            return;
        }
        let _ = self.outbound.send(Message::Close(None));

        let reader = self.reader.lock().ok().and_then(|mut reader| reader.take());
        if let Some(mut reader) = reader {
            if timeout(grace, &mut reader).await.is_err() {
                debug!("Connection #{} did not close within {grace:?}", self.id);
                reader.abort();
            }
        }

        if let Ok(mut state) = self.state.lock() {
            state.mark_closed();
        }
    }
}

impl Drop for StressClient {
    fn drop(&mut self) {
        self.writer.abort();
        if let Ok(reader) = self.reader.get_mut() {
            if let Some(reader) = reader.take() {
                reader.abort();
            }
        }
    }
}

/// Track the current question and resolve the outstanding request from a server frame.
///
/// Frames are classified by their `type` alone so that a sparse reply still resolves the request.
fn handle_text(state: &Mutex<ClientState>, text: &str) {
    let frame: Value = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            trace!("Ignoring unparseable server message: {err}");
            return;
        }
    };
    let Some(kind) = frame.get("type").and_then(Value::as_str) else {
        trace!("Ignoring server message without a type");
        return;
    };
    let completion = Completion::for_reply(kind);

    let Ok(mut state) = state.lock() else {
        return;
    };

    match completion {
        Some(Completion::Question) => {
            if let Some(question_id) = frame.get("questionId").and_then(Value::as_str) {
                state.current_question_id = Some(question_id.to_string());
            }
        }
        Some(Completion::QuizComplete) => state.current_question_id = None,
        _ => {}
    }

    if let Some(completion) = completion {
        if let Some(pending) = state.pending.take() {
            pending.resolve(completion);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
    use axum::extract::State;
    use axum::response::Response;
    use axum::routing::get;
    use axum::Router;
    use serde_json::json;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    #[derive(Clone, Copy)]
    enum Behavior {
        /// Replies to joins with the first question and to answers with `quiz_complete`.
        Echo,
        /// Replies after a delay.
        Slow(Duration),
        /// Reads one frame and hangs up.
        HangUp,
        /// Replies to every frame with the given raw text.
        Raw(&'static str),
    }

    #[derive(Clone)]
    struct TestServer {
        behavior: Behavior,
        /// Text frames received across all connections.
        frames: Arc<AtomicUsize>,
    }

    async fn ws_handler(ws: WebSocketUpgrade, State(server): State<TestServer>) -> Response {
        ws.on_upgrade(move |socket| handle_socket(socket, server))
    }

    async fn handle_socket(mut socket: WebSocket, server: TestServer) {
        while let Some(Ok(message)) = socket.recv().await {
            let AxumMessage::Text(text) = message else {
                continue;
            };
            server.frames.fetch_add(1, Ordering::SeqCst);
            let request: ClientMessage = serde_json::from_str(&text).unwrap();
            let reply = match (server.behavior, request) {
                (Behavior::HangUp, _) => return,
                (Behavior::Raw(frame), _) => {
                    if socket.send(AxumMessage::Text(frame.to_string())).await.is_err() {
                        return;
                    }
                    continue;
                }
                (Behavior::Slow(delay), _) => {
                    tokio::time::sleep(delay).await;
                    json!({"type": "quiz_complete", "score": 0})
                }
                (Behavior::Echo, ClientMessage::Join { session_id, user_id }) => {
                    let joined = json!({"type": "joined", "sessionId": session_id, "userId": user_id});
                    socket.send(AxumMessage::Text(joined.to_string())).await.unwrap();
                    json!({"type": "question", "questionId": "q1", "prompt": "?", "options": []})
                }
                (Behavior::Echo, ClientMessage::Answer { .. }) => {
                    json!({"type": "quiz_complete", "score": 1})
                }
            };
            if socket.send(AxumMessage::Text(reply.to_string())).await.is_err() {
                return;
            }
        }
    }

    async fn serve(behavior: Behavior) -> String {
        serve_counted(behavior).await.0
    }

    /// Like `serve`, also returning the count of frames the server has received.
    async fn serve_counted(behavior: Behavior) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let frames = Arc::new(AtomicUsize::new(0));
        let server = TestServer {
            behavior,
            frames: frames.clone(),
        };
        let app = Router::new().route("/", get(ws_handler)).with_state(server);
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("ws://{addr}/"), frames)
    }

    fn answer() -> ClientMessage {
        ClientMessage::Answer {
            session_id: "quiz".to_string(),
            user_id: "u1".to_string(),
            question_id: "q1".to_string(),
            choice_id: "q1_b".to_string(),
        }
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn join_then_answer() {
        let url = serve(Behavior::Echo).await;
        let client = StressClient::connect(1, &url, Duration::from_secs(3)).await.unwrap();

        let reply = client.join("quiz", "u1").await.unwrap();
        assert_eq!(reply.completion, Completion::Question);
        assert!(reply.outcome().ok);
        assert_eq!(client.current_question_id().as_deref(), Some("q1"));
        assert_eq!(client.user_id().as_deref(), Some("u1"));
        assert!(client.is_idle());

        let reply = client.send_and_wait(&answer()).await.unwrap();
        assert_eq!(reply.completion, Completion::QuizComplete);
        assert_eq!(client.current_question_id(), None);

        client.close(Duration::from_secs(1)).await;
        assert!(!client.is_open());
    }

    #[tokio::test]
    #[ntest::timeout(10_000)]
    async fn refuses_second_request_while_pending() {
        let (url, frames) = serve_counted(Behavior::Slow(Duration::from_millis(300))).await;
        let client = StressClient::connect(2, &url, Duration::from_secs(3)).await.unwrap();

        let message = answer();
        let (first, second) = tokio::join!(client.send_and_wait(&message), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            client.send_and_wait(&message).await
        });

        let second = second.unwrap();
        assert_eq!(second.completion, Completion::Close);
        assert_eq!(second.latency, Duration::ZERO);
        assert!(!second.outcome().ok);

        let first = first.unwrap();
        assert_eq!(first.completion, Completion::QuizComplete);
        assert!(first.latency >= Duration::from_millis(300));

        // The refused request never reached the server.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(frames.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    #[ntest::timeout(10_000)]
    async fn error_without_code_resolves_as_error() {
        let url = serve(Behavior::Raw(r#"{"type":"error","message":"Quiz is closed."}"#)).await;
        let client = StressClient::connect(5, &url, Duration::from_secs(3)).await.unwrap();

        let reply = client.send_and_wait(&answer()).await.unwrap();
        assert_eq!(reply.completion, Completion::Error);
        assert!(reply.latency < Duration::from_secs(3));
        assert!(!reply.outcome().ok);
        assert!(client.is_idle());
    }

    #[tokio::test]
    #[ntest::timeout(10_000)]
    async fn sparse_question_resolves_and_tracks_id() {
        let url = serve(Behavior::Raw(r#"{"type":"question","quizId":"quiz","questionId":"q2"}"#)).await;
        let client = StressClient::connect(6, &url, Duration::from_secs(3)).await.unwrap();

        let reply = client.join("quiz", "u1").await.unwrap();
        assert_eq!(reply.completion, Completion::Question);
        assert!(reply.latency < Duration::from_secs(3));
        assert_eq!(client.current_question_id().as_deref(), Some("q2"));
    }

    #[test]
    fn only_reply_types_resolve() {
        assert_eq!(Completion::for_reply("question"), Some(Completion::Question));
        assert_eq!(Completion::for_reply("quiz_complete"), Some(Completion::QuizComplete));
        assert_eq!(Completion::for_reply("error"), Some(Completion::Error));
        assert_eq!(Completion::for_reply("joined"), None);
        assert_eq!(Completion::for_reply("leaderboard_update"), None);
    }

    #[tokio::test]
    async fn slow_reply_times_out() {
        let url = serve(Behavior::Slow(Duration::from_millis(500))).await;
        let client = StressClient::connect(3, &url, Duration::from_millis(100)).await.unwrap();

        let reply = client.send_and_wait(&answer()).await.unwrap();
        assert_eq!(reply.completion, Completion::Timeout);
        assert!(reply.latency >= Duration::from_millis(100));
        assert!(client.is_idle());

        // The late reply arrives with nothing pending and is dropped.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(client.is_idle());
    }

    #[tokio::test]
    async fn hang_up_resolves_as_close() {
        let url = serve(Behavior::HangUp).await;
        let client = StressClient::connect(4, &url, Duration::from_secs(3)).await.unwrap();

        let reply = client.send_and_wait(&answer()).await.unwrap();
        assert_eq!(reply.completion, Completion::Close);
        assert!(!client.is_open());

        let reply = client.send_and_wait(&answer()).await.unwrap();
        assert_eq!(reply.latency, Duration::ZERO);
    }
}
