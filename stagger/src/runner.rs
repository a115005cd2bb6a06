//! Rate-paced stage execution.
//!
//! A stage issues operations on a fixed schedule: by elapsed time `t` the runner has attempted to
//! start `floor(t * target_rps)` operations. When the concurrency limit is reached it waits for
//! any in-flight operation to finish before starting the next one, so a saturated target shows
//! up as an `actual_rps` below the target rather than as unbounded queueing.
use futures_util::stream::{FuturesUnordered, StreamExt};
use stagger_core::{OperationOutcome, StageConfig, StageTotals, PACING_INTERVAL};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
#[allow(unused)]
use tracing::{debug, error, info, instrument, trace, warn};

/// Run one stage to completion and return its raw totals.
///
/// Operations returning `Err` are counted as failures with their wall-clock latency. Every
/// issued operation is recorded exactly once; in-flight work is drained before returning.
#[instrument(name = "stage", skip_all, fields(target_rps = config.target_rps.get()))]
pub async fn run_stage<T, F, E>(config: &StageConfig, operation: T) -> StageTotals
where
    T: Fn() -> F,
    F: Future<Output = Result<OperationOutcome, E>>,
    E: Display,
{
    let limit = config.concurrency_limit.get();
    let target_rps = f64::from(config.target_rps.get());

    let mut totals = StageTotals::new();
    let mut in_flight = FuturesUnordered::new();
    let mut scheduled: u64 = 0;
    let mut peak_in_flight = 0;

    let start = Instant::now();
    'pacing: loop {
        let elapsed = start.elapsed();
        if elapsed >= config.duration {
            break;
        }

        let should_have_scheduled = (elapsed.as_secs_f64() * target_rps).floor() as u64;
        while scheduled < should_have_scheduled {
            if in_flight.len() >= limit {
                // NOTE: Only one slot is awaited; other in-flight operations keep progressing.
                if let Some((ok, latency)) = in_flight.next().await {
                    record(&mut totals, ok, latency);
                }
                if start.elapsed() >= config.duration {
                    break 'pacing;
                }
            }

            in_flight.push(issue(Instant::now(), operation()));
            scheduled += 1;
            peak_in_flight = peak_in_flight.max(in_flight.len());
        }

        tokio::select! {
            Some((ok, latency)) = in_flight.next(), if !in_flight.is_empty() => {
                record(&mut totals, ok, latency);
            }
            _ = sleep(PACING_INTERVAL) => {}
        }
    }

    let draining = in_flight.len();
    while let Some((ok, latency)) = in_flight.next().await {
        record(&mut totals, ok, latency);
    }

    debug!(
        "Stage finished in {}: scheduled={scheduled}, recorded={}, peak_in_flight={peak_in_flight}, drained={draining}",
        humantime::format_duration(start.elapsed()),
        totals.total,
    );
    totals
}

async fn issue<F, E>(issued_at: Instant, operation: F) -> (bool, Duration)
where
    F: Future<Output = Result<OperationOutcome, E>>,
    E: Display,
{
    match operation.await {
        Ok(outcome) => (
            outcome.ok,
            outcome.latency.unwrap_or_else(|| issued_at.elapsed()),
        ),
        Err(err) => {
            trace!("Operation failed: {err}");
            (false, issued_at.elapsed())
        }
    }
}

fn record(totals: &mut StageTotals, ok: bool, latency: Duration) {
    totals.record(ok, latency);

    #[cfg(feature = "metrics")]
    {
        if ok {
            metrics::counter!("stagger_operation_ok").increment(1);
        } else {
            metrics::counter!("stagger_operation_error").increment(1);
        }
        metrics::histogram!("stagger_operation_latency").record(latency.as_secs_f64() * 1000.);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::convert::Infallible;
    use std::num::{NonZeroU32, NonZeroUsize};
    use std::rc::Rc;

    fn stage(target_rps: u32, duration: Duration, limit: usize) -> StageConfig {
        StageConfig::new(
            NonZeroU32::new(target_rps).unwrap(),
            duration,
            NonZeroUsize::new(limit).unwrap(),
        )
    }

    #[tracing_test::traced_test]
    #[tokio::test(start_paused = true)]
    async fn paces_to_target_rate() {
        let config = stage(200, Duration::from_secs(1), 16);

        let totals = run_stage(&config, || async {
            sleep(Duration::from_millis(5)).await;
            Ok::<_, Infallible>(OperationOutcome::success())
        })
        .await;

        assert!((195..=200).contains(&totals.total), "total={}", totals.total);
        assert_eq!(totals.errors, 0);
        assert_eq!(totals.latencies_ms.len() as u64, totals.total);
        assert!(totals.latencies_ms.iter().all(|ms| *ms >= 5.));
    }

    #[tracing_test::traced_test]
    #[tokio::test(start_paused = true)]
    async fn never_exceeds_concurrency_limit() {
        let config = stage(1000, Duration::from_millis(500), 4);
        let active = Rc::new(Cell::new(0usize));
        let peak = Rc::new(Cell::new(0usize));

        let totals = run_stage(&config, || {
            let active = active.clone();
            let peak = peak.clone();
            async move {
                active.set(active.get() + 1);
                peak.set(peak.get().max(active.get()));
                sleep(Duration::from_millis(50)).await;
                active.set(active.get() - 1);
                Ok::<_, Infallible>(OperationOutcome::success())
            }
        })
        .await;

        assert_eq!(peak.get(), 4);
        assert_eq!(active.get(), 0);
        // Four slots of 50ms over half a second, plus whatever was in flight at the end.
        assert!((36..=44).contains(&totals.total), "total={}", totals.total);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_count_as_failures() {
        let config = stage(100, Duration::from_secs(1), 8);
        let calls = Cell::new(0u64);

        let totals = run_stage(&config, || {
            calls.set(calls.get() + 1);
            let fail = calls.get() % 2 == 0;
            async move {
                sleep(Duration::from_millis(3)).await;
                if fail {
                    Err("boom")
                } else {
                    Ok(OperationOutcome::success())
                }
            }
        })
        .await;

        assert_eq!(totals.total, calls.get());
        assert_eq!(totals.ok + totals.errors, totals.total);
        assert_eq!(totals.errors, totals.total / 2);
        assert_eq!(totals.latencies_ms.len() as u64, totals.total);
    }

    #[tokio::test(start_paused = true)]
    async fn reported_latency_wins() {
        let config = stage(50, Duration::from_millis(200), 2);

        let totals = run_stage(&config, || async {
            Ok::<_, Infallible>(OperationOutcome::failure().with_latency(Duration::from_millis(42)))
        })
        .await;

        assert!(totals.total > 0);
        assert_eq!(totals.ok, 0);
        assert!(totals.latencies_ms.iter().all(|ms| (*ms - 42.).abs() < 1e-9));
    }

    #[tokio::test(start_paused = true)]
    async fn drains_in_flight_work() {
        let config = stage(10, Duration::from_millis(350), 8);

        let totals = run_stage(&config, || async {
            sleep(Duration::from_secs(2)).await;
            Ok::<_, Infallible>(OperationOutcome::success())
        })
        .await;

        assert_eq!(totals.total, 3);
        assert_eq!(totals.ok, 3);
    }
}
