//! Memory and CPU accounting for the harness process.
use stagger_core::{round_to, ProcessSample};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{get_current_pid, Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};

const BYTES_PER_MB: f64 = 1024. * 1024.;

/// Tracks resident memory over a run and CPU time consumed since it started.
///
/// A background task polls RSS on a fixed interval to keep a running peak. Dropping the sampler
/// stops the task, so an aborted run does not leak it.
pub struct ResourceSampler {
    probe: RssProbe,
    rss_start: u64,
    cpu_start: CpuTimes,
    peak: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl ResourceSampler {
    /// Must be called from within a Tokio runtime.
    pub fn start(sample_interval: Duration) -> Self {
        let mut probe = RssProbe::new();
        let rss_start = probe.rss_bytes();
        let cpu_start = CpuTimes::now();
        let peak = Arc::new(AtomicU64::new(rss_start));

        let task = {
            let peak = peak.clone();
            let mut probe = RssProbe::new();
            tokio::spawn(async move {
                let mut ticker = interval(sample_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // NOTE: First tick completes instantly
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let rss = probe.rss_bytes();
                    let previous = peak.fetch_max(rss, Ordering::Relaxed);
                    trace!("RSS sample: {:.2}MB (peak {:.2}MB)", to_mb(rss), to_mb(previous.max(rss)));
                }
            })
        };

        Self {
            probe,
            rss_start,
            cpu_start,
            peak,
            task,
        }
    }

    pub fn stop(mut self) -> ProcessSample {
        self.task.abort();

        let rss_end = self.probe.rss_bytes();
        let rss_peak = self.peak.fetch_max(rss_end, Ordering::Relaxed).max(rss_end);
        let cpu = CpuTimes::now().since(self.cpu_start);

        let sample = ProcessSample {
            rss_mb_start: to_mb(self.rss_start),
            rss_mb_end: to_mb(rss_end),
            rss_mb_peak: to_mb(rss_peak),
            cpu_user_ms: round_to(cpu.user.as_secs_f64() * 1000., 2),
            cpu_system_ms: round_to(cpu.system.as_secs_f64() * 1000., 2),
        };
        debug!("Process resources: {sample:?}");
        sample
    }
}

impl Drop for ResourceSampler {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn to_mb(bytes: u64) -> f64 {
    round_to(bytes as f64 / BYTES_PER_MB, 2)
}

struct RssProbe {
    system: System,
    pid: Option<Pid>,
}

impl RssProbe {
    fn new() -> Self {
        let pid = match get_current_pid() {
            Ok(pid) => Some(pid),
            Err(err) => {
                warn!("Unable to determine own pid, memory will read as zero: {err}");
                None
            }
        };
        Self {
            system: System::new(),
            pid,
        }
    }

    fn rss_bytes(&mut self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        self.system
            .process(pid)
            .map(|process| process.memory())
            .unwrap_or(0)
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct CpuTimes {
    user: Duration,
    system: Duration,
}

impl CpuTimes {
    #[cfg(unix)]
    fn now() -> Self {
        use nix::sys::resource::{getrusage, UsageWho};
        use nix::sys::time::TimeValLike;

        match getrusage(UsageWho::RUSAGE_SELF) {
            Ok(usage) => Self {
                user: micros(usage.user_time().num_microseconds()),
                system: micros(usage.system_time().num_microseconds()),
            },
            Err(err) => {
                warn!("getrusage failed, CPU time will read as zero: {err}");
                Self::default()
            }
        }
    }

    #[cfg(not(unix))]
    fn now() -> Self {
        Self::default()
    }

    fn since(self, earlier: CpuTimes) -> CpuTimes {
        CpuTimes {
            user: self.user.saturating_sub(earlier.user),
            system: self.system.saturating_sub(earlier.system),
        }
    }
}

#[cfg(unix)]
fn micros(value: i64) -> Duration {
    Duration::from_micros(value.max(0) as u64)
}
