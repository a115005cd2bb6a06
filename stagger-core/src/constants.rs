use std::num::NonZeroUsize;
use std::time::Duration;

/// The target rates tried when `STRESS_STAGE_RPS` is not set.
pub const DEFAULT_STAGE_RPS: [u32; 8] = [250, 500, 750, 1000, 1250, 1500, 1750, 2000];

pub const DEFAULT_STAGE_DURATION: Duration = Duration::from_secs(60);
pub const DEFAULT_WARMUP: Duration = Duration::from_secs(15);

/// The default ceiling on a stage's error rate.
pub const DEFAULT_MAX_ERROR_RATE: f64 = 0.01;

/// The default ceiling on a stage's p95 latency, in milliseconds.
pub const DEFAULT_MAX_P95_MS: f64 = 200.;

pub const DEFAULT_JOIN_RATIO: f64 = 0.1;
pub const DEFAULT_QUIZ_ID: &str = "stress-quiz";

pub const SERVICE_WARMUP_USERS: usize = 500;
pub const SERVICE_CONCURRENCY: NonZeroUsize = unsafe { NonZeroUsize::new_unchecked(512) };

pub const WS_WARMUP_CLIENTS: usize = 300;
pub const WS_CONCURRENCY: NonZeroUsize = unsafe { NonZeroUsize::new_unchecked(400) };
pub const WS_MAX_CLIENTS: usize = 2000;

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(3000);
pub const DEFAULT_SERVER_START_TIMEOUT: Duration = Duration::from_millis(15_000);
pub const DEFAULT_SERVER_STOP_GRACE: Duration = Duration::from_millis(5000);
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_millis(1000);

/// How often the resource sampler polls resident memory.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Polling granularity of the stage runner's pacing loop.
pub const PACING_INTERVAL: Duration = Duration::from_millis(2);

/// Random draws before an answer falls back to creating a new user.
pub const ANSWER_PICK_RETRIES: usize = 25;

/// Random draws before giving up on finding an idle connection.
pub const CLIENT_PICK_RETRIES: usize = 40;

/// Substring of the target's structured startup log line.
pub const SERVER_STARTED_MARKER: &str = r#""event":"server_started""#;
