use crate::{max_sustainable_rps, BenchmarkConfig, Mode, StageResult, Thresholds};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Memory and CPU consumed by the harness process over a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSample {
    pub rss_mb_start: f64,
    pub rss_mb_end: f64,
    pub rss_mb_peak: f64,
    pub cpu_user_ms: f64,
    pub cpu_system_ms: f64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInfo {
    pub harness_version: String,
    pub platform: String,
    pub arch: String,
    pub cpus: usize,
}

impl RuntimeInfo {
    pub fn current() -> Self {
        Self {
            harness_version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            cpus: std::thread::available_parallelism()
                .map(|count| count.get())
                .unwrap_or(1),
        }
    }
}

/// The full report of one run. Written once, at completion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkRunOutput {
    pub mode: Mode,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub max_sustainable_rps: u32,
    pub thresholds: Thresholds,
    pub config: BenchmarkConfig,
    pub stages: Vec<StageResult>,
    pub resources: ProcessSample,
    pub runtime: RuntimeInfo,
}

impl BenchmarkRunOutput {
    pub fn new(
        mode: Mode,
        started_at: OffsetDateTime,
        config: BenchmarkConfig,
        stages: Vec<StageResult>,
        resources: ProcessSample,
    ) -> Self {
        Self {
            mode,
            started_at,
            finished_at: OffsetDateTime::now_utc(),
            max_sustainable_rps: max_sustainable_rps(&stages),
            thresholds: config.thresholds,
            config,
            stages,
            resources,
            runtime: RuntimeInfo::current(),
        }
    }
}
