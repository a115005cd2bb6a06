use super::{should_join, Choice, Driver};
use crate::error::DriverError;
use client::{Completion, Reply, StressClient};
use futures_util::future::join_all;
use rand::Rng;
use stagger_core::{
    BenchmarkConfig, ClientMessage, ConnectionConfig, Mode, OperationOutcome, StageNotes,
    TrafficMix, CLIENT_PICK_RETRIES,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};

mod client;

#[derive(Default)]
struct Pool {
    clients: Vec<Arc<StressClient>>,
    /// Connections being opened; they count against the cap before they exist.
    opening: usize,
}

#[derive(Default)]
struct ConnectionCounters {
    join_ops: AtomicU64,
    answer_ops: AtomicU64,
    create_join_ops: AtomicU64,
    reuse_join_ops: AtomicU64,
    timeouts: AtomicU64,
    protocol_errors: AtomicU64,
}

/// Drives a running quiz server through a capped pool of WebSocket connections.
///
/// Joins open a new connection while the pool has room and otherwise re-join on an idle one.
/// Answers go to a random idle connection that has a current question.
pub struct ConnectionDriver {
    url: String,
    session_id: String,
    traffic: TrafficMix,
    config: ConnectionConfig,
    pool: Mutex<Pool>,
    next_client: AtomicU64,
    next_user: AtomicU64,
    counters: ConnectionCounters,
}

impl ConnectionDriver {
    pub fn new(url: impl Into<String>, benchmark: &BenchmarkConfig, config: ConnectionConfig) -> Self {
        Self {
            url: url.into(),
            session_id: benchmark.session_id.clone(),
            traffic: benchmark.traffic,
            config,
            pool: Mutex::new(Pool::default()),
            next_client: AtomicU64::new(0),
            next_user: AtomicU64::new(0),
            counters: ConnectionCounters::default(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Connections in the pool that are still open.
    pub fn active_clients(&self) -> usize {
        self.pool
            .lock()
            .map(|pool| pool.clients.iter().filter(|client| client.is_open()).count())
            .unwrap_or(0)
    }

    fn next_user_id(&self) -> String {
        let idx = self.next_user.fetch_add(1, Ordering::Relaxed) + 1;
        format!("ws-stress-user-{idx:08}")
    }

    async fn connect(&self) -> Result<StressClient, DriverError> {
        let id = self.next_client.fetch_add(1, Ordering::Relaxed) + 1;
        StressClient::connect(id, &self.url, self.config.response_timeout).await
    }

    fn reserve_slot(&self) -> Result<bool, DriverError> {
        let mut pool = self.pool.lock()?;
        if pool.clients.len() + pool.opening < self.config.max_clients {
            pool.opening += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn release_slot(&self, client: Option<Arc<StressClient>>) -> Result<(), DriverError> {
        let mut pool = self.pool.lock()?;
        pool.opening = pool.opening.saturating_sub(1);
        if let Some(client) = client {
            pool.clients.push(client);
        }
        Ok(())
    }

    fn pick_idle(&self) -> Result<Option<Arc<StressClient>>, DriverError> {
        let pool = self.pool.lock()?;
        if pool.clients.is_empty() {
            return Ok(None);
        }
        let mut rng = rand::thread_rng();
        Ok((0..CLIENT_PICK_RETRIES)
            .map(|_| &pool.clients[rng.gen_range(0..pool.clients.len())])
            .find(|client| client.is_idle())
            .cloned())
    }

    fn tally(&self, reply: &Reply) {
        match reply.completion {
            Completion::Timeout => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            Completion::Error => {
                self.counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    async fn join(&self) -> Result<OperationOutcome, DriverError> {
        self.counters.join_ops.fetch_add(1, Ordering::Relaxed);
        let user_id = self.next_user_id();

        let (reply, joined) = if self.reserve_slot()? {
            (self.join_new(&user_id).await?, &self.counters.create_join_ops)
        } else {
            match self.pick_idle()? {
                Some(client) => (
                    client.join(&self.session_id, &user_id).await?,
                    &self.counters.reuse_join_ops,
                ),
                None => return Ok(OperationOutcome::failure().with_latency(Duration::ZERO)),
            }
        };

        if reply.completion.is_ok() {
            joined.fetch_add(1, Ordering::Relaxed);
        }
        self.tally(&reply);
        Ok(reply.outcome())
    }

    /// Join on a fresh connection. The slot reserved by the caller is always released.
    async fn join_new(&self, user_id: &str) -> Result<Reply, DriverError> {
        let client = match self.connect().await {
            Ok(client) => Arc::new(client),
            Err(err) => {
                self.release_slot(None)?;
                return Err(err);
            }
        };

        let reply = client.join(&self.session_id, user_id).await;
        let keep = matches!(&reply, Ok(reply) if reply.completion.is_ok());
        self.release_slot(keep.then(|| client.clone()))?;
        if !keep {
            client.close(self.config.close_grace).await;
        }
        reply
    }

    async fn answer(&self) -> Result<OperationOutcome, DriverError> {
        self.counters.answer_ops.fetch_add(1, Ordering::Relaxed);

        let target = self.pick_idle()?.and_then(|client| {
            let question_id = client.current_question_id()?;
            let user_id = client.user_id()?;
            Some((client, user_id, question_id))
        });
        let Some((client, user_id, question_id)) = target else {
            return self.join().await;
        };

        let choice_id = Choice::draw(&mut rand::thread_rng()).option_id(&question_id);
        let reply = client
            .send_and_wait(&ClientMessage::Answer {
                session_id: self.session_id.clone(),
                user_id,
                question_id,
                choice_id,
            })
            .await?;

        self.tally(&reply);
        Ok(reply.outcome())
    }
}

impl Driver for ConnectionDriver {
    fn mode(&self) -> Mode {
        Mode::Ws
    }

    async fn warmup_one(&self) -> Result<(), DriverError> {
        let client = Arc::new(self.connect().await?);
        let reply = client.join(&self.session_id, &self.next_user_id()).await?;
        if reply.completion.is_ok() {
            self.pool.lock()?.clients.push(client);
        } else {
            debug!(
                "Warmup connection #{} rejected with {:?}",
                client.id(),
                reply.completion
            );
            client.close(self.config.close_grace).await;
        }
        Ok(())
    }

    async fn operation(&self) -> Result<OperationOutcome, DriverError> {
        let join = should_join(&mut rand::thread_rng(), self.traffic.join_ratio());
        if join {
            self.join().await
        } else {
            self.answer().await
        }
    }

    fn take_notes(&self) -> StageNotes {
        let counters = &self.counters;
        StageNotes::from([
            ("joinOps".to_string(), counters.join_ops.swap(0, Ordering::Relaxed)),
            ("answerOps".to_string(), counters.answer_ops.swap(0, Ordering::Relaxed)),
            ("createJoinOps".to_string(), counters.create_join_ops.swap(0, Ordering::Relaxed)),
            ("reuseJoinOps".to_string(), counters.reuse_join_ops.swap(0, Ordering::Relaxed)),
            ("activeClients".to_string(), self.active_clients() as u64),
            ("timeouts".to_string(), counters.timeouts.swap(0, Ordering::Relaxed)),
            ("protocolErrors".to_string(), counters.protocol_errors.swap(0, Ordering::Relaxed)),
        ])
    }

    async fn shutdown(&self) {
        let clients = match self.pool.lock() {
            Ok(mut pool) => std::mem::take(&mut pool.clients),
            Err(err) => {
                error!("Connection pool is poisoned, dropping connections: {err}");
                return;
            }
        };
        debug!("Closing {} connections", clients.len());
        join_all(
            clients
                .iter()
                .map(|client| client.close(self.config.close_grace)),
        )
        .await;
    }
}
