//! Default Stagger runtime
//!
//! Runs one mode, or both in sequence, end to end: configuration, setup of the system under test,
//! the benchmark itself, cleanup and the JSON report.
use crate::error::RuntimeError;
use crate::output::{write_report, AllSummary, TempDbPath, DEFAULT_RESULTS_DIR};
use crate::process::{TargetCommand, TargetProcess};
use clap::Parser;
use stagger::{run_benchmark, ConnectionDriver, ServiceDriver};
use stagger_core::{
    BenchmarkConfig, BenchmarkRunOutput, ConnectionConfig, Mode, QuizService,
    DEFAULT_SERVER_STOP_GRACE,
};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::net::TcpListener;
#[allow(unused)]
use tracing::{debug, error, info, instrument, warn};

const DEFAULT_SERVER_CMD: &str = "mock-service";

#[derive(Parser, Debug)]
#[command(version, about = "Staged SLO load tests for the quiz service")]
struct StaggerCli {
    /// Which workload to run: service, ws or all.
    mode: Mode,

    /// Directory the JSON reports are written to.
    #[arg(short, long, default_value = DEFAULT_RESULTS_DIR)]
    results_dir: PathBuf,

    /// Command that starts the quiz server for ws runs.
    #[arg(long, default_value = DEFAULT_SERVER_CMD)]
    server_cmd: TargetCommand,

    /// Working directory for the server command.
    #[arg(long)]
    server_dir: Option<PathBuf>,
}

/// Report of a single mode and where it was written.
#[derive(Clone, Debug)]
pub struct ModeRun {
    pub output: BenchmarkRunOutput,
    pub output_path: PathBuf,
}

/// Default Stagger runtime.
///
/// `service` opens the in-process quiz service against a scratch database path. Connection runs
/// spawn the server command instead.
///
/// # Example
///
/// ```ignore
/// use stagger_runtime::StaggerRuntime;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     StaggerRuntime::new(MyQuiz::open)
///         .with_args()
///         .run()
///         .await?;
///     Ok(())
/// }
/// ```
pub struct StaggerRuntime<F> {
    mode: Mode,
    results_dir: PathBuf,
    server: TargetCommand,
    open_service: F,
}

impl<F, S, E> StaggerRuntime<F>
where
    F: Fn(&Path) -> Result<S, E>,
    S: QuizService,
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new(open_service: F) -> Self {
        Self {
            mode: Mode::All,
            results_dir: PathBuf::from(DEFAULT_RESULTS_DIR),
            server: TargetCommand::new(DEFAULT_SERVER_CMD),
            open_service,
        }
    }

    /// Use the default CLI arguments for Stagger.
    ///
    /// ```ignore
    /// $ stagger ws --server-cmd "cargo run --release -p mock-service"
    /// $ stagger all --results-dir /tmp/stress-results
    /// ```
    pub fn with_args(mut self) -> Self {
        let args = StaggerCli::parse();
        self.mode = args.mode;
        self.results_dir = args.results_dir;
        self.server = match args.server_dir {
            Some(dir) => args.server_cmd.current_dir(dir),
            None => args.server_cmd,
        };
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn results_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.results_dir = dir.into();
        self
    }

    pub fn server_command(mut self, command: TargetCommand) -> Self {
        self.server = command;
        self
    }

    /// Run the configured mode and return the paths of the reports written.
    #[instrument(name = "stagger", skip_all, fields(mode = %self.mode))]
    pub async fn run(self) -> Result<Vec<PathBuf>, RuntimeError> {
        match self.mode {
            Mode::Service => Ok(vec![self.run_service().await?.output_path]),
            Mode::Ws => Ok(vec![self.run_ws().await?.output_path]),
            Mode::All => {
                let started_at = OffsetDateTime::now_utc();
                let service = self.run_service().await?;
                let ws = self.run_ws().await?;

                let summary = AllSummary::new(
                    started_at,
                    (&service.output, &service.output_path),
                    (&ws.output, &ws.output_path),
                );
                let summary_path = write_report(&self.results_dir, Mode::All.as_str(), &summary).await?;
                info!("[all] output={}", summary_path.display());
                Ok(vec![service.output_path, ws.output_path, summary_path])
            }
        }
    }

    pub async fn run_service(&self) -> Result<ModeRun, RuntimeError> {
        let db = TempDbPath::new(Mode::Service);
        let mut config = BenchmarkConfig::from_env(Mode::Service);
        config.db_path = Some(db.path().to_path_buf());

        let service = (self.open_service)(db.path()).map_err(|err| RuntimeError::Service(Box::new(err)))?;
        let driver = ServiceDriver::new(service, &config);
        let output = run_benchmark(&driver, &config).await?;

        self.finish(output).await
    }

    pub async fn run_ws(&self) -> Result<ModeRun, RuntimeError> {
        let db = TempDbPath::new(Mode::Ws);
        let mut config = BenchmarkConfig::from_env(Mode::Ws);
        config.db_path = Some(db.path().to_path_buf());
        let connection = ConnectionConfig::from_env();

        let port = free_port().await?;
        let target =
            TargetProcess::start(&self.server, port, db.path(), connection.server_start_timeout)
                .await?;

        let driver = ConnectionDriver::new(format!("ws://127.0.0.1:{port}"), &config, connection);
        let output = run_benchmark(&driver, &config).await;

        if let Err(err) = target.stop(DEFAULT_SERVER_STOP_GRACE).await {
            warn!("Failed to stop server cleanly: {err}");
        }
        self.finish(output?).await
    }

    async fn finish(&self, output: BenchmarkRunOutput) -> Result<ModeRun, RuntimeError> {
        let output_path = write_report(&self.results_dir, output.mode.as_str(), &output).await?;
        info!(
            "[{}] maxSustainableRps={} thresholds(error<={:.2}%, p95<={}ms) output={}",
            output.mode,
            output.max_sustainable_rps,
            output.thresholds.max_error_rate * 100.,
            output.thresholds.max_p95_ms,
            output_path.display()
        );
        Ok(ModeRun {
            output,
            output_path,
        })
    }
}

/// A port that was free a moment ago on the loopback interface.
pub async fn free_port() -> Result<u16, RuntimeError> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(RuntimeError::Port)?;
    let port = listener.local_addr().map_err(RuntimeError::Port)?.port();
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_modes_and_server() {
        let cli = StaggerCli::try_parse_from([
            "stagger",
            "ws",
            "--server-cmd",
            "cargo run -p mock-service",
            "--server-dir",
            "/srv/quiz",
        ])
        .unwrap();
        assert_eq!(cli.mode, Mode::Ws);
        assert_eq!(cli.results_dir, PathBuf::from("stress-results"));
        assert_eq!(cli.server_cmd.program(), "cargo");
        assert_eq!(cli.server_dir, Some(PathBuf::from("/srv/quiz")));

        assert!(StaggerCli::try_parse_from(["stagger", "bogus"]).is_err());
        assert!(StaggerCli::try_parse_from(["stagger"]).is_err());
    }

    #[tokio::test]
    async fn allocates_loopback_port() {
        let port = free_port().await.unwrap();
        assert_ne!(port, 0);
        TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    }
}
