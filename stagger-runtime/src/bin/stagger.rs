use mock_service::InMemoryQuiz;
use stagger_runtime::StaggerRuntime;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const DEFAULT_LOG_FILTER: &str = "stagger=info,stagger_runtime=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    FmtSubscriber::builder().with_env_filter(filter).init();

    StaggerRuntime::new(InMemoryQuiz::open)
        .with_args()
        .run()
        .await?;
    Ok(())
}
