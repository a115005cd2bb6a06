//! The quiz server as a child process.
//!
//! The server receives `PORT` and `DB_PATH` in its environment and is considered ready once a
//! stdout line contains the `server_started` marker. Stderr is forwarded to the log for the
//! lifetime of the process.
use crate::error::ProcessError;
use stagger_core::SERVER_STARTED_MARKER;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
#[allow(unused)]
use tracing::{debug, error, info, instrument, trace, warn};

/// Program, arguments and working directory used to start the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetCommand {
    program: String,
    args: Vec<String>,
    dir: Option<PathBuf>,
}

impl TargetCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

/// Whitespace-separated program and arguments. No shell quoting is applied.
impl FromStr for TargetCommand {
    type Err = ProcessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let program = parts.next().ok_or(ProcessError::EmptyCommand)?;
        Ok(parts.fold(TargetCommand::new(program), |command, arg| command.arg(arg)))
    }
}

pub struct TargetProcess {
    child: Child,
    port: u16,
    stdout_task: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
}

enum Startup {
    Ready,
    StdoutClosed,
    Exited(ExitStatus),
}

impl TargetProcess {
    /// Spawn the server and wait until it reports readiness.
    ///
    /// Fails if the server exits first or `startup_timeout` elapses; the child is killed in
    /// either case.
    #[instrument(name = "target", skip_all, fields(port = port))]
    pub async fn start(
        command: &TargetCommand,
        port: u16,
        db_path: &Path,
        startup_timeout: Duration,
    ) -> Result<Self, ProcessError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .env("PORT", port.to_string())
            .env("DB_PATH", db_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: command.program.clone(),
            source,
        })?;
        let stdout = child.stdout.take().ok_or(ProcessError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(ProcessError::MissingPipe("stderr"))?;

        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if !line.is_empty() {
                    warn!("[server] {line}");
                }
            }
        });

        let mut stdout = BufReader::new(stdout).lines();
        let ready = timeout(startup_timeout, wait_until_ready(&mut child, &mut stdout)).await;
        let failure = match ready {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(_) => Some(ProcessError::StartTimeout(startup_timeout)),
        };
        if let Some(err) = failure {
            stderr_task.abort();
            if let Err(kill_err) = child.kill().await {
                debug!("Failed to kill server after failed start: {kill_err}");
            }
            return Err(err);
        }

        // NOTE: Keep draining stdout so the server never blocks on a full pipe.
        let stdout_task = tokio::spawn(async move {
            while let Ok(Some(line)) = stdout.next_line().await {
                trace!("[server] {line}");
            }
        });

        info!("Server `{}` ready on port {port}", command.program);
        Ok(Self {
            child,
            port,
            stdout_task,
            stderr_task,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Ask the server to exit and force it after `grace`.
    ///
    /// Returns the exit status, or `None` if the server had to be killed.
    pub async fn stop(mut self, grace: Duration) -> Result<Option<ExitStatus>, ProcessError> {
        if let Some(status) = self.child.try_wait()? {
            debug!("Server already exited ({status})");
            return Ok(Some(status));
        }

        self.terminate()?;
        match timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!("Server exited ({status})");
                Ok(Some(status))
            }
            Err(_) => {
                warn!("Server did not exit within {grace:?}, killing it");
                self.child.kill().await?;
                Ok(None)
            }
        }
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> Result<(), ProcessError> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(std::io::Error::from)?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> Result<(), ProcessError> {
        self.child.start_kill()?;
        Ok(())
    }
}

impl Drop for TargetProcess {
    fn drop(&mut self) {
        self.stdout_task.abort();
        self.stderr_task.abort();
    }
}

async fn wait_until_ready(
    child: &mut Child,
    stdout: &mut Lines<BufReader<ChildStdout>>,
) -> Result<(), ProcessError> {
    loop {
        let startup = tokio::select! {
            line = stdout.next_line() => match line? {
                Some(line) if line.contains(SERVER_STARTED_MARKER) => Startup::Ready,
                Some(line) => {
                    trace!("[server] {line}");
                    continue;
                }
                None => Startup::StdoutClosed,
            },
            status = child.wait() => Startup::Exited(status?),
        };

        return match startup {
            Startup::Ready => Ok(()),
            Startup::StdoutClosed => Err(ProcessError::Exited(child.wait().await?)),
            Startup::Exited(status) => Err(ProcessError::Exited(status)),
        };
    }
}
