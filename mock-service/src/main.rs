use mock_service::{InMemoryQuiz, ServerOptions};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const DEFAULT_PORT: u16 = 3000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .json()
        .flatten_event(true)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mock_service=info")),
        )
        .init();

    let port = match std::env::var("PORT") {
        Ok(port) => port.trim().parse()?,
        Err(_) => DEFAULT_PORT,
    };
    let quiz = match std::env::var_os("DB_PATH") {
        Some(path) => InMemoryQuiz::open(&PathBuf::from(path))?,
        None => InMemoryQuiz::new(mock_service::DEFAULT_QUESTION_COUNT),
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    mock_service::run(addr, Arc::new(quiz), ServerOptions::from_env()).await
}
