//! External media tooling: ffprobe invocation and stream selection, ffmpeg
//! command construction, encode progress parsing, and a cancellable runner
//! for the external binaries the pipeline shells out to.

pub mod command;
pub mod container;
pub mod encoder;
pub mod probe;
pub mod progress;

pub use command::ExternalCommand;
pub use container::{AudioStream, ContainerData, SubtitleStream, VideoStream};
pub use encoder::EncoderSettings;
pub use probe::{ProbeData, priority_for_duration, probe_file};
pub use progress::{EncodeProgress, ProgressParser};

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },

    #[error("{program} exited with code {code}: {stderr}")]
    ExitStatus {
        program: PathBuf,
        code: i32,
        stderr: String,
    },

    #[error("invalid probe output: {0}")]
    Probe(#[from] serde_json::Error),

    #[error("no video stream in container")]
    NoVideoStream,

    #[error("operation canceled")]
    Canceled,
}
