use mock_service::{InMemoryQuiz, ServerOptions};
use stagger_core::{BenchmarkConfig, Mode};
use std::net::SocketAddr;
use std::num::{NonZeroU32, NonZeroUsize};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, Level};
use tracing_subscriber::FmtSubscriber;

#[allow(unused)]
pub fn init() {
    static ONCE_LOCK: OnceLock<()> = OnceLock::new();

    ONCE_LOCK.get_or_init(|| {
        let default_panic = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            default_panic(info);
            error!("Panic occurred: {info:?}");
        }));

        FmtSubscriber::builder()
            .with_max_level(Level::DEBUG)
            .with_env_filter("stagger=debug,stagger_runtime=debug,mock_service=info")
            .init();
    });
}

/// Serve a fresh quiz on a loopback port and return its WebSocket URL.
#[allow(unused)]
pub async fn quiz_server(options: ServerOptions) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let quiz = Arc::new(InMemoryQuiz::new(5));
    tokio::spawn(async move {
        if let Err(err) = mock_service::serve(listener, quiz, options).await {
            error!("Quiz server stopped: {err}");
        }
    });
    format!("ws://{addr}")
}

/// A short run: `rates` stages of `stage_ms` each.
#[allow(unused)]
pub fn quick_config(mode: Mode, rates: &[u32], stage_ms: u64) -> BenchmarkConfig {
    let mut config = BenchmarkConfig::new(mode);
    config.stage_rps = rates.iter().copied().filter_map(NonZeroU32::new).collect();
    config.stage_duration = Duration::from_millis(stage_ms);
    config.warmup = Duration::from_millis(100);
    config.warmup_population = 4;
    config.concurrency = NonZeroUsize::new(16).unwrap();
    config.session_id = "integration".to_string();
    config
}
