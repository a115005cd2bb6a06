//! Run orchestration: warmup, stages in order, drain, report.
use crate::driver::Driver;
use crate::error::RunError;
use crate::runner::run_stage;
use crate::sampler::ResourceSampler;
use governor::{Quota, RateLimiter};
use stagger_core::{BenchmarkConfig, BenchmarkRunOutput, StageResult, DEFAULT_SAMPLE_INTERVAL};
use std::fmt;
use time::OffsetDateTime;
#[allow(unused)]
use tracing::{debug, error, info, instrument, trace, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Warmup,
    Stage(usize),
    Drain,
    Report,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Warmup => write!(f, "warmup"),
            Phase::Stage(idx) => write!(f, "stage {idx}"),
            Phase::Drain => write!(f, "drain"),
            Phase::Report => write!(f, "report"),
        }
    }
}

/// Warm `driver` up, run every configured stage against it and assemble the report.
///
/// Every stage runs regardless of earlier verdicts. The driver is shut down whether or not the
/// run succeeds.
#[instrument(name = "benchmark", skip_all, fields(mode = %driver.mode()))]
pub async fn run_benchmark<D: Driver>(
    driver: &D,
    config: &BenchmarkConfig,
) -> Result<BenchmarkRunOutput, RunError> {
    let started_at = OffsetDateTime::now_utc();
    let sampler = ResourceSampler::start(DEFAULT_SAMPLE_INTERVAL);

    let stages = run_phases(driver, config).await;

    enter(Phase::Drain);
    driver.shutdown().await;
    let stages = stages?;
    let resources = sampler.stop();

    enter(Phase::Report);
    let output = BenchmarkRunOutput::new(
        driver.mode(),
        started_at,
        config.clone(),
        stages,
        resources,
    );
    info!(
        "Finished {} stages, maxSustainableRps={}",
        output.stages.len(),
        output.max_sustainable_rps
    );
    Ok(output)
}

async fn run_phases<D: Driver>(
    driver: &D,
    config: &BenchmarkConfig,
) -> Result<Vec<StageResult>, RunError> {
    enter(Phase::Warmup);
    warmup(driver, config).await?;
    // Warmup activity does not belong to the first stage.
    let _ = driver.take_notes();

    let mut results = Vec::with_capacity(config.stage_rps.len());
    for (idx, stage) in config.stages().enumerate() {
        let number = idx + 1;
        enter(Phase::Stage(number));
        info!(
            "Stage {number}: targetRps={} for {}",
            stage.target_rps,
            humantime::format_duration(stage.duration)
        );

        let totals = run_stage(&stage, || driver.operation()).await;
        let result = StageResult::build(
            driver.mode().as_str(),
            number,
            &stage,
            &totals,
            &config.thresholds,
            driver.take_notes(),
        );
        info!("{result}");
        results.push(result);
    }
    Ok(results)
}

/// Build the population, spread evenly over the configured warmup window.
async fn warmup<D: Driver>(driver: &D, config: &BenchmarkConfig) -> Result<(), RunError> {
    let limiter = Quota::with_period(config.warmup_interval()).map(RateLimiter::direct);

    for joined in 0..config.warmup_population {
        if let Some(limiter) = &limiter {
            limiter.until_ready().await;
        }
        driver
            .warmup_one()
            .await
            .map_err(|source| RunError::Warmup { joined, source })?;
    }
    debug!("Warmed up {} participants", config.warmup_population);
    Ok(())
}

fn enter(phase: Phase) {
    debug!("Entering {phase}");
}
