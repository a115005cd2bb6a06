use crate::{StageConfig, Thresholds};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Driver-specific counters attached to a stage result.
pub type StageNotes = BTreeMap<String, u64>;

/// Result of a single issued operation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OperationOutcome {
    pub ok: bool,
    /// Measured by the operation itself. When absent the runner uses issue-to-completion time.
    pub latency: Option<Duration>,
}

impl OperationOutcome {
    pub fn success() -> Self {
        Self {
            ok: true,
            latency: None,
        }
    }

    pub fn failure() -> Self {
        Self {
            ok: false,
            latency: None,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

impl From<bool> for OperationOutcome {
    fn from(ok: bool) -> Self {
        Self { ok, latency: None }
    }
}

/// Raw per-stage accumulator. Owned by exactly one stage execution.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StageTotals {
    pub total: u64,
    pub ok: u64,
    pub errors: u64,
    pub latencies_ms: Vec<f64>,
}

impl StageTotals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, ok: bool, latency: Duration) {
        if ok {
            self.ok += 1;
        } else {
            self.errors += 1;
        }
        self.latencies_ms.push(latency.as_secs_f64() * 1000.);
        self.total += 1;
    }

    pub fn error_rate(&self) -> f64 {
        if self.total == 0 {
            0.
        } else {
            self.errors as f64 / self.total as f64
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

/// Nearest-rank percentiles of `latencies_ms`.
///
/// For quantile `q` over `n` sorted samples the selected index is `ceil(n * q) - 1`, clamped to
/// the sample range, so the p50 of two samples is the larger one. Values are rounded to two
/// decimal places. The input is left untouched.
pub fn summarize(latencies_ms: &[f64]) -> LatencySummary {
    if latencies_ms.is_empty() {
        return LatencySummary::default();
    }

    let mut sorted = latencies_ms.to_vec();
    sorted.sort_by(f64::total_cmp);

    LatencySummary {
        p50: percentile(&sorted, 0.5),
        p95: percentile(&sorted, 0.95),
        p99: percentile(&sorted, 0.99),
        max: round_to(sorted[sorted.len() - 1], 2),
    }
}

fn percentile(sorted: &[f64], quantile: f64) -> f64 {
    let rank = (sorted.len() as f64 * quantile).ceil() as usize;
    let index = rank.saturating_sub(1).min(sorted.len() - 1);
    round_to(sorted[index], 2)
}

/// Round `value` to `places` decimal places.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Immutable verdict for one stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    pub mode: String,
    pub stage: usize,
    pub target_rps: u32,
    pub actual_rps: f64,
    pub total: u64,
    pub ok: u64,
    pub errors: u64,
    pub error_rate: f64,
    pub latency_ms: LatencySummary,
    pub pass: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub notes: StageNotes,
}

impl StageResult {
    /// Evaluate `totals` against `thresholds`.
    ///
    /// A stage that issued nothing has an error rate and p95 of zero and is judged by the same
    /// formula, so it passes whenever the thresholds are non-negative.
    pub fn build(
        mode: &str,
        stage: usize,
        config: &StageConfig,
        totals: &StageTotals,
        thresholds: &Thresholds,
        notes: StageNotes,
    ) -> Self {
        let error_rate = totals.error_rate();
        let latency_ms = summarize(&totals.latencies_ms);
        let duration_secs = config.duration.as_secs_f64();
        let actual_rps = if duration_secs > 0. {
            round_to(totals.total as f64 / duration_secs, 2)
        } else {
            0.
        };

        Self {
            mode: mode.to_string(),
            stage,
            target_rps: config.target_rps.get(),
            actual_rps,
            total: totals.total,
            ok: totals.ok,
            errors: totals.errors,
            error_rate: round_to(error_rate, 4),
            latency_ms,
            pass: thresholds.passes(error_rate, latency_ms.p95),
            duration_ms: config.duration.as_millis() as u64,
            notes,
        }
    }
}

impl fmt::Display for StageResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] stage={} targetRps={} actualRps={} total={} errorRate={:.2}% p95={}ms status={}",
            self.mode,
            self.stage,
            self.target_rps,
            self.actual_rps,
            self.total,
            self.error_rate * 100.,
            self.latency_ms.p95,
            if self.pass { "PASS" } else { "FAIL" },
        )
    }
}

/// Highest target rate among passing stages, or 0 when none passed.
pub fn max_sustainable_rps(stages: &[StageResult]) -> u32 {
    stages
        .iter()
        .filter(|stage| stage.pass)
        .map(|stage| stage.target_rps)
        .max()
        .unwrap_or(0)
}
