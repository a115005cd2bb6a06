use crate::{
    DEFAULT_CLOSE_GRACE, DEFAULT_JOIN_RATIO, DEFAULT_MAX_ERROR_RATE, DEFAULT_MAX_P95_MS,
    DEFAULT_QUIZ_ID, DEFAULT_RESPONSE_TIMEOUT, DEFAULT_SERVER_START_TIMEOUT, DEFAULT_STAGE_DURATION,
    DEFAULT_STAGE_RPS, DEFAULT_WARMUP, SERVICE_CONCURRENCY, SERVICE_WARMUP_USERS, WS_CONCURRENCY,
    WS_MAX_CLIENTS, WS_WARMUP_CLIENTS,
};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr, DurationMilliSeconds};
use std::fmt;
use std::num::{NonZeroU32, NonZeroUsize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown mode `{0}` (expected one of: service, ws, all)")]
    UnknownMode(String),

    #[error("Invalid traffic mix `{0}`")]
    InvalidTraffic(String),
}

/// Which target a run drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// The quiz service called in-process.
    Service,
    /// A spawned quiz server reached over WebSocket connections.
    Ws,
    /// `Service` followed by `Ws`.
    All,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Service => "service",
            Mode::Ws => "ws",
            Mode::All => "all",
        }
    }

    fn warmup_key(&self) -> &'static str {
        match self {
            Mode::Ws => "STRESS_WARMUP_CLIENTS",
            Mode::Service | Mode::All => "STRESS_WARMUP_USERS",
        }
    }

    fn default_warmup_population(&self) -> usize {
        match self {
            Mode::Ws => WS_WARMUP_CLIENTS,
            Mode::Service | Mode::All => SERVICE_WARMUP_USERS,
        }
    }

    fn default_concurrency(&self) -> NonZeroUsize {
        match self {
            Mode::Ws => WS_CONCURRENCY,
            Mode::Service | Mode::All => SERVICE_CONCURRENCY,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "service" => Ok(Mode::Service),
            "ws" => Ok(Mode::Ws),
            "all" => Ok(Mode::All),
            _ => Err(ConfigError::UnknownMode(s.to_string())),
        }
    }
}

/// SLO ceilings a stage must stay under to pass.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thresholds {
    pub max_error_rate: f64,
    pub max_p95_ms: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            max_error_rate: DEFAULT_MAX_ERROR_RATE,
            max_p95_ms: DEFAULT_MAX_P95_MS,
        }
    }
}

impl Thresholds {
    pub fn from_lookup<L>(lookup: &L) -> Self
    where
        L: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let max_error_rate = lookup_number(lookup, "STRESS_SLO_MAX_ERROR_RATE")
            .filter(|rate| in_range(*rate, 0.0..=1.0, "STRESS_SLO_MAX_ERROR_RATE"))
            .unwrap_or(defaults.max_error_rate);
        let max_p95_ms = lookup_number(lookup, "STRESS_SLO_MAX_P95_MS")
            .filter(|p95| in_range(*p95, 0.0..=f64::MAX, "STRESS_SLO_MAX_P95_MS"))
            .unwrap_or(defaults.max_p95_ms);

        Self {
            max_error_rate,
            max_p95_ms,
        }
    }

    pub fn passes(&self, error_rate: f64, p95_ms: f64) -> bool {
        error_rate <= self.max_error_rate && p95_ms <= self.max_p95_ms
    }
}

/// Parameters of one fixed-duration stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageConfig {
    pub target_rps: NonZeroU32,
    pub duration: Duration,
    pub concurrency_limit: NonZeroUsize,
}

impl StageConfig {
    pub fn new(target_rps: NonZeroU32, duration: Duration, concurrency_limit: NonZeroUsize) -> Self {
        Self {
            target_rps,
            duration,
            concurrency_limit,
        }
    }
}

/// Join/answer split of the generated traffic.
///
/// Serialized as `join=<ratio>,answer=<1 - ratio>`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrafficMix {
    join_ratio: f64,
}

impl TrafficMix {
    pub fn new(join_ratio: f64) -> Self {
        Self {
            join_ratio: join_ratio.clamp(0., 1.),
        }
    }

    pub fn join_ratio(&self) -> f64 {
        self.join_ratio
    }
}

impl Default for TrafficMix {
    fn default() -> Self {
        Self::new(DEFAULT_JOIN_RATIO)
    }
}

impl fmt::Display for TrafficMix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "join={},answer={:.2}", self.join_ratio, 1. - self.join_ratio)
    }
}

impl FromStr for TrafficMix {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .find_map(|part| part.trim().strip_prefix("join="))
            .and_then(|ratio| ratio.parse::<f64>().ok())
            .filter(|ratio| ratio.is_finite())
            .map(TrafficMix::new)
            .ok_or_else(|| ConfigError::InvalidTraffic(s.to_string()))
    }
}

/// Run-wide configuration, echoed verbatim into the report.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkConfig {
    pub stage_rps: Vec<NonZeroU32>,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "stageDurationMs")]
    pub stage_duration: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "warmupMs")]
    pub warmup: Duration,
    pub warmup_population: usize,
    pub thresholds: Thresholds,
    pub concurrency: NonZeroUsize,
    #[serde_as(as = "DisplayFromStr")]
    pub traffic: TrafficMix,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
}

impl BenchmarkConfig {
    pub fn new(mode: Mode) -> Self {
        Self {
            stage_rps: default_stage_rps(),
            stage_duration: DEFAULT_STAGE_DURATION,
            warmup: DEFAULT_WARMUP,
            warmup_population: mode.default_warmup_population(),
            thresholds: Thresholds::default(),
            concurrency: mode.default_concurrency(),
            traffic: TrafficMix::default(),
            session_id: DEFAULT_QUIZ_ID.to_string(),
            db_path: None,
        }
    }

    /// Read the `STRESS_*` environment, falling back to defaults for anything unset or unusable.
    pub fn from_env(mode: Mode) -> Self {
        Self::from_lookup(mode, &|key: &str| std::env::var(key).ok())
    }

    pub fn from_lookup<L>(mode: Mode, lookup: &L) -> Self
    where
        L: Fn(&str) -> Option<String>,
    {
        let defaults = Self::new(mode);

        let stage_rps = lookup("STRESS_STAGE_RPS")
            .filter(|raw| !raw.is_empty())
            .map(|raw| parse_stage_rps(&raw))
            .filter(|parsed| !parsed.is_empty())
            .unwrap_or(defaults.stage_rps);

        let stage_duration = lookup_duration(lookup, "STRESS_STAGE_DURATION_MS")
            .filter(|dur| !dur.is_zero())
            .unwrap_or(defaults.stage_duration);

        let warmup = lookup_duration(lookup, "STRESS_WARMUP_MS").unwrap_or(defaults.warmup);

        let warmup_population = lookup_count(lookup, mode.warmup_key())
            .unwrap_or(defaults.warmup_population);

        let concurrency = lookup_count(lookup, "STRESS_CONCURRENCY")
            .and_then(NonZeroUsize::new)
            .unwrap_or(defaults.concurrency);

        let traffic = lookup_number(lookup, "STRESS_JOIN_RATIO")
            .map(TrafficMix::new)
            .unwrap_or(defaults.traffic);

        let session_id = lookup("STRESS_QUIZ_ID")
            .filter(|id| !id.is_empty())
            .unwrap_or(defaults.session_id);

        Self {
            stage_rps,
            stage_duration,
            warmup,
            warmup_population,
            thresholds: Thresholds::from_lookup(lookup),
            concurrency,
            traffic,
            session_id,
            db_path: None,
        }
    }

    /// One `StageConfig` per configured target rate, in order.
    pub fn stages(&self) -> impl Iterator<Item = StageConfig> + '_ {
        self.stage_rps
            .iter()
            .map(|rps| StageConfig::new(*rps, self.stage_duration, self.concurrency))
    }

    /// Delay between warmup creations so the whole population lands within `warmup`.
    pub fn warmup_interval(&self) -> Duration {
        if self.warmup_population == 0 {
            Duration::ZERO
        } else {
            self.warmup / self.warmup_population as u32
        }
    }
}

/// Settings specific to the connection driver and the spawned target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub max_clients: usize,
    pub response_timeout: Duration,
    pub server_start_timeout: Duration,
    pub close_grace: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_clients: WS_MAX_CLIENTS,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            server_start_timeout: DEFAULT_SERVER_START_TIMEOUT,
            close_grace: DEFAULT_CLOSE_GRACE,
        }
    }
}

impl ConnectionConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(&|key: &str| std::env::var(key).ok())
    }

    pub fn from_lookup<L>(lookup: &L) -> Self
    where
        L: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            max_clients: lookup_count(lookup, "STRESS_MAX_CLIENTS").unwrap_or(defaults.max_clients),
            response_timeout: lookup_duration(lookup, "STRESS_RESPONSE_TIMEOUT_MS")
                .filter(|dur| !dur.is_zero())
                .unwrap_or(defaults.response_timeout),
            server_start_timeout: lookup_duration(lookup, "STRESS_SERVER_START_TIMEOUT_MS")
                .filter(|dur| !dur.is_zero())
                .unwrap_or(defaults.server_start_timeout),
            close_grace: defaults.close_grace,
        }
    }
}

pub fn default_stage_rps() -> Vec<NonZeroU32> {
    DEFAULT_STAGE_RPS
        .iter()
        .filter_map(|rps| NonZeroU32::new(*rps))
        .collect()
}

/// Parse a comma separated rate list, dropping entries that are not positive numbers.
pub fn parse_stage_rps(raw: &str) -> Vec<NonZeroU32> {
    raw.split(',')
        .filter_map(|value| value.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite() && *value > 0.)
        .filter_map(|value| NonZeroU32::new(value.floor().min(u32::MAX as f64) as u32))
        .collect()
}

fn lookup_number<L>(lookup: &L, key: &str) -> Option<f64>
where
    L: Fn(&str) -> Option<String>,
{
    let raw = lookup(key).filter(|raw| !raw.is_empty())?;
    match raw.trim().parse::<f64>() {
        Ok(value) if value.is_finite() => Some(value),
        _ => {
            warn!("Ignoring {key}={raw:?}: not a finite number.");
            None
        }
    }
}

fn lookup_count<L>(lookup: &L, key: &str) -> Option<usize>
where
    L: Fn(&str) -> Option<String>,
{
    lookup_number(lookup, key)
        .filter(|value| in_range(*value, 0.0..=f64::MAX, key))
        .map(|value| value.floor() as usize)
}

fn lookup_duration<L>(lookup: &L, key: &str) -> Option<Duration>
where
    L: Fn(&str) -> Option<String>,
{
    lookup_number(lookup, key)
        .filter(|ms| in_range(*ms, 0.0..=1e12, key))
        .map(|ms| Duration::from_secs_f64(ms / 1000.))
}

fn in_range(value: f64, range: std::ops::RangeInclusive<f64>, key: &str) -> bool {
    if range.contains(&value) {
        true
    } else {
        warn!("Ignoring {key}={value}: out of range.");
        false
    }
}
