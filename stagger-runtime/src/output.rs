use crate::error::RuntimeError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use stagger_core::{BenchmarkRunOutput, Mode, RuntimeInfo, Thresholds};
use std::io;
use std::path::{Path, PathBuf};
use time::macros::format_description;
use time::OffsetDateTime;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};

pub const DEFAULT_RESULTS_DIR: &str = "stress-results";

/// `<UTC timestamp with ':' and '.' replaced by '-'>-<label>.json`
pub fn report_file_name(label: &str, at: OffsetDateTime) -> Result<String, RuntimeError> {
    let timestamp = at.to_offset(time::UtcOffset::UTC).format(format_description!(
        "[year]-[month]-[day]T[hour]-[minute]-[second]-[subsecond digits:3]Z"
    ))?;
    Ok(format!("{timestamp}-{label}.json"))
}

/// Write `report` as pretty JSON into `dir`, creating it if needed.
pub async fn write_report<T: Serialize>(
    dir: &Path,
    label: &str,
    report: &T,
) -> Result<PathBuf, RuntimeError> {
    let path = dir.join(report_file_name(label, OffsetDateTime::now_utc())?);
    let mut body = serde_json::to_string_pretty(report)?;
    body.push('\n');

    let report_err = |source| RuntimeError::Report {
        path: path.clone(),
        source,
    };
    tokio::fs::create_dir_all(dir).await.map_err(report_err)?;
    tokio::fs::write(&path, body).await.map_err(report_err)?;
    debug!("Wrote {}", path.display());
    Ok(path)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerMode<T> {
    pub service: T,
    pub ws: T,
}

/// Summary written after `all` runs both modes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllSummary {
    pub mode: Mode,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub runtime: RuntimeInfo,
    pub outputs: PerMode<PathBuf>,
    pub max_sustainable_rps: PerMode<u32>,
    pub thresholds: PerMode<Thresholds>,
}

impl AllSummary {
    pub fn new(
        started_at: OffsetDateTime,
        service: (&BenchmarkRunOutput, &Path),
        ws: (&BenchmarkRunOutput, &Path),
    ) -> Self {
        let (service, service_path) = service;
        let (ws, ws_path) = ws;
        Self {
            mode: Mode::All,
            started_at,
            finished_at: OffsetDateTime::now_utc(),
            runtime: RuntimeInfo::current(),
            outputs: PerMode {
                service: service_path.to_path_buf(),
                ws: ws_path.to_path_buf(),
            },
            max_sustainable_rps: PerMode {
                service: service.max_sustainable_rps,
                ws: ws.max_sustainable_rps,
            },
            thresholds: PerMode {
                service: service.thresholds,
                ws: ws.thresholds,
            },
        }
    }
}

/// A unique scratch database path, removed together with its `-wal` and `-shm` companions on drop.
#[derive(Debug)]
pub struct TempDbPath {
    path: PathBuf,
}

impl TempDbPath {
    pub fn new(mode: Mode) -> Self {
        Self::in_dir(&std::env::temp_dir(), mode)
    }

    pub fn in_dir(dir: &Path, mode: Mode) -> Self {
        let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        let suffix: u32 = rand::thread_rng().gen_range(0..0x100_0000);
        Self {
            path: dir.join(format!("quiz-stress-{mode}-{millis}-{suffix:06x}.sqlite")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn companions(&self) -> [PathBuf; 3] {
        let mut wal = self.path.clone().into_os_string();
        wal.push("-wal");
        let mut shm = self.path.clone().into_os_string();
        shm.push("-shm");
        [self.path.clone(), wal.into(), shm.into()]
    }
}

impl Drop for TempDbPath {
    fn drop(&mut self) {
        for path in self.companions() {
            match std::fs::remove_file(&path) {
                Ok(()) => trace!("Removed {}", path.display()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!("Failed to remove {}: {err}", path.display()),
            }
        }
    }
}
