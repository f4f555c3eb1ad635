//! Scheduler settings: storage roots, timeouts, and the public domain the
//! workers reach the server under.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use url::Url;

use crate::parse_duration;

#[derive(Debug, Clone, Args)]
pub struct SchedulerConfig {
    /// Base URL workers use for download/upload/checksum requests
    #[arg(long = "scheduler-domain", env = "RECODEX_SCHEDULER_DOMAIN", default_value = "http://localhost:8080")]
    pub domain: Url,

    /// Interval of the timeout-requeue loop
    #[arg(long = "scheduler-schedule-time", env = "RECODEX_SCHEDULER_SCHEDULE_TIME", value_parser = parse_duration, default_value = "5m")]
    pub schedule_time: Duration,

    /// Requeue jobs progressing for longer than this
    #[arg(long = "scheduler-job-timeout", env = "RECODEX_SCHEDULER_JOB_TIMEOUT", value_parser = parse_duration, default_value = "24h")]
    pub job_timeout: Duration,

    /// Root directory holding source files
    #[arg(long = "scheduler-download-path", env = "RECODEX_SCHEDULER_DOWNLOAD_PATH", default_value = "/data/current")]
    pub download_path: PathBuf,

    /// Root directory receiving encoded files
    #[arg(long = "scheduler-upload-path", env = "RECODEX_SCHEDULER_UPLOAD_PATH", default_value = "/data/processed")]
    pub upload_path: PathBuf,

    /// Minimum source file size accepted for scheduling, in bytes
    #[arg(long = "scheduler-min-file-size", env = "RECODEX_SCHEDULER_MIN_FILE_SIZE", default_value_t = 100_000_000)]
    pub min_file_size: u64,

    /// Remove the source file once the encoded result is confirmed present
    #[arg(long = "scheduler-delete-source-on-complete", env = "RECODEX_SCHEDULER_DELETE_SOURCE_ON_COMPLETE", default_value_t = false)]
    pub delete_source_on_complete: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Probe {
        #[command(flatten)]
        scheduler: SchedulerConfig,
    }

    #[test]
    fn durations_parse_humantime_syntax() {
        let probe = Probe::parse_from([
            "probe",
            "--scheduler-schedule-time",
            "30s",
            "--scheduler-job-timeout",
            "2h",
        ]);
        assert_eq!(probe.scheduler.schedule_time, Duration::from_secs(30));
        assert_eq!(probe.scheduler.job_timeout, Duration::from_secs(7200));
        assert!(!probe.scheduler.delete_source_on_complete);
    }
}
