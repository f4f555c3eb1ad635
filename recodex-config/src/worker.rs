//! Worker settings: identity, working storage, encode tuning, job
//! acceptance, and the PGS toolchain.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{NaiveTime, Timelike};
use clap::{Args, ValueEnum};
use thiserror::Error;

/// Job classes a worker can consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum JobType {
    Encode,
    #[value(name = "pgstosrt")]
    PgsToSrt,
}

/// A wall-clock `HH:MM` boundary for acceptance windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockTime {
    pub hour: u32,
    pub minute: u32,
}

#[derive(Debug, Error)]
#[error("invalid HH:MM time: {0}")]
pub struct ClockTimeError(String);

impl FromStr for ClockTime {
    type Err = ClockTimeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (hour, minute) = value
            .split_once(':')
            .ok_or_else(|| ClockTimeError(value.to_string()))?;
        let hour: u32 = hour.parse().map_err(|_| ClockTimeError(value.to_string()))?;
        let minute: u32 = minute.parse().map_err(|_| ClockTimeError(value.to_string()))?;
        if hour > 23 || minute > 59 {
            return Err(ClockTimeError(value.to_string()));
        }
        Ok(Self { hour, minute })
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

#[derive(Debug, Clone, Args)]
pub struct WorkerConfig {
    /// Worker name, used for queue addressing and event attribution
    #[arg(long = "worker-name", env = "RECODEX_WORKER_NAME", default_value = "worker")]
    pub name: String,

    /// Root directory for per-job working directories
    #[arg(long = "worker-temporal-path", env = "RECODEX_WORKER_TEMPORAL_PATH", default_value = "/tmp/recodex")]
    pub temporal_path: PathBuf,

    /// Threads handed to the encoder (0 lets the encoder decide)
    #[arg(long = "worker-threads", env = "RECODEX_WORKER_THREADS", default_value_t = 0)]
    pub threads: u8,

    /// Job classes this worker consumes
    #[arg(long = "worker-accepted-jobs", env = "RECODEX_WORKER_ACCEPTED_JOBS", value_delimiter = ',', default_values = ["encode"])]
    pub accepted_jobs: Vec<JobType>,

    /// Maximum concurrent encode jobs in the encode stage
    #[arg(long = "worker-encode-jobs", env = "RECODEX_WORKER_ENCODE_JOBS", default_value_t = 1)]
    pub encode_jobs: usize,

    /// Maximum concurrent PGS conversions
    #[arg(long = "worker-pgs-jobs", env = "RECODEX_WORKER_PGS_JOBS", default_value_t = 1)]
    pub pgs_jobs: usize,

    /// Highest task priority accepted from the encode queue; requeued
    /// tasks (priority 9) are always accepted
    #[arg(long = "worker-priority", env = "RECODEX_WORKER_PRIORITY", default_value_t = 9)]
    pub priority: u8,

    /// Stop accepting new jobs without shutting down
    #[arg(long = "worker-paused", env = "RECODEX_WORKER_PAUSED", default_value_t = false)]
    pub paused: bool,

    /// Accept new jobs only after this local time (HH:MM)
    #[arg(long = "worker-start-after", env = "RECODEX_WORKER_START_AFTER")]
    pub start_after: Option<ClockTime>,

    /// Accept new jobs only before this local time (HH:MM)
    #[arg(long = "worker-stop-after", env = "RECODEX_WORKER_STOP_AFTER")]
    pub stop_after: Option<ClockTime>,

    /// Path of the PGS-to-SRT tool assembly
    #[arg(long = "worker-pgs-dll-path", env = "RECODEX_WORKER_PGS_DLL_PATH", default_value = "/opt/pgstosrt/PgsToSrt.dll")]
    pub pgs_to_srt_dll_path: PathBuf,

    /// Tesseract trained-data directory for the PGS tool
    #[arg(long = "worker-tesseract-data-path", env = "RECODEX_WORKER_TESSERACT_DATA_PATH", default_value = "/opt/pgstosrt/tessdata")]
    pub tesseract_data_path: PathBuf,

    /// Dotnet runtime executable running the PGS tool
    #[arg(long = "worker-dotnet-path", env = "RECODEX_WORKER_DOTNET_PATH", default_value = "dotnet")]
    pub dotnet_path: PathBuf,
}

impl WorkerConfig {
    pub fn accepts(&self, job_type: JobType) -> bool {
        self.accepted_jobs.contains(&job_type)
    }

    fn window(&self) -> Option<(ClockTime, ClockTime)> {
        Some((self.start_after?, self.stop_after?))
    }

    /// Whether the acceptance window (if configured) contains `now`.
    pub fn within_window(&self, now: NaiveTime) -> bool {
        let Some((start, stop)) = self.window() else {
            return true;
        };
        let minutes = now.hour() * 60 + now.minute();
        let start = start.hour * 60 + start.minute;
        let stop = stop.hour * 60 + stop.minute;
        minutes >= start && minutes < stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Probe {
        #[command(flatten)]
        worker: WorkerConfig,
    }

    #[test]
    fn clock_time_parses_and_rejects() {
        assert_eq!("06:30".parse::<ClockTime>().unwrap(), ClockTime { hour: 6, minute: 30 });
        assert!("25:00".parse::<ClockTime>().is_err());
        assert!("0630".parse::<ClockTime>().is_err());
    }

    #[test]
    fn window_gates_acceptance() {
        let probe = Probe::parse_from([
            "probe",
            "--worker-start-after",
            "22:00",
            "--worker-stop-after",
            "06:00",
        ]);
        // Inverted windows never match; operators configure start < stop.
        assert!(!probe.worker.within_window(NaiveTime::from_hms_opt(23, 0, 0).unwrap()));

        let probe = Probe::parse_from([
            "probe",
            "--worker-start-after",
            "08:00",
            "--worker-stop-after",
            "18:00",
        ]);
        assert!(probe.worker.within_window(NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
        assert!(!probe.worker.within_window(NaiveTime::from_hms_opt(19, 0, 0).unwrap()));
    }

    #[test]
    fn no_window_always_accepts() {
        let probe = Probe::parse_from(["probe"]);
        assert!(probe.worker.within_window(NaiveTime::from_hms_opt(3, 0, 0).unwrap()));
        assert!(probe.worker.accepts(JobType::Encode));
        assert!(!probe.worker.accepts(JobType::PgsToSrt));
    }
}
