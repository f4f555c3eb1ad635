//! ffprobe invocation and its JSON model.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::command::ExternalCommand;
use crate::MediaError;

/// Parsed `ffprobe -print_format json` output.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeData {
    pub format: ProbeFormat,
    #[serde(default)]
    pub streams: Vec<ProbeStream>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeFormat {
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
}

impl ProbeFormat {
    /// Container duration in seconds; ffprobe reports it as a decimal
    /// string.
    pub fn duration_seconds(&self) -> f64 {
        self.duration
            .as_deref()
            .and_then(|raw| raw.parse::<f64>().ok())
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeStream {
    pub index: i32,
    #[serde(default)]
    pub codec_type: Option<String>,
    #[serde(default)]
    pub codec_name: Option<String>,
    #[serde(default)]
    pub channels: Option<u32>,
    #[serde(default)]
    pub channel_layout: Option<String>,
    #[serde(default)]
    pub bit_rate: Option<String>,
    #[serde(default)]
    pub disposition: Option<ProbeDisposition>,
    #[serde(default)]
    pub tags: Option<ProbeTags>,
}

impl ProbeStream {
    pub fn is_type(&self, codec_type: &str) -> bool {
        self.codec_type.as_deref() == Some(codec_type)
    }

    pub fn bit_rate(&self) -> u64 {
        self.bit_rate
            .as_deref()
            .and_then(|raw| raw.parse::<u64>().ok())
            .unwrap_or(0)
    }

    pub fn language(&self) -> &str {
        self.tags
            .as_ref()
            .and_then(|tags| tags.language.as_deref())
            .unwrap_or("")
    }

    pub fn title(&self) -> &str {
        self.tags
            .as_ref()
            .and_then(|tags| tags.title.as_deref())
            .unwrap_or("")
    }

    fn flag(&self, pick: impl Fn(&ProbeDisposition) -> i32) -> bool {
        self.disposition.as_ref().map(pick).unwrap_or(0) == 1
    }

    pub fn is_forced(&self) -> bool {
        self.flag(|d| d.forced)
    }

    pub fn is_comment(&self) -> bool {
        self.flag(|d| d.comment)
    }

    pub fn is_default(&self) -> bool {
        self.flag(|d| d.default)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeDisposition {
    #[serde(default)]
    pub default: i32,
    #[serde(default)]
    pub forced: i32,
    #[serde(default)]
    pub comment: i32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeTags {
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// Probe a media file with ffprobe.
pub async fn probe_file(
    path: &Path,
    cancel: &CancellationToken,
) -> Result<ProbeData, MediaError> {
    let stdout = ExternalCommand::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path.display().to_string())
        .run(cancel)
        .await?;
    Ok(serde_json::from_slice(&stdout)?)
}

/// Queue priority derived from the source duration: short files encode
/// quickly and jump ahead of feature-length ones.
pub fn priority_for_duration(duration: Duration) -> u8 {
    let minutes = duration.as_secs() / 60;
    match minutes {
        0..30 => 1,
        30..60 => 2,
        60..120 => 3,
        120..180 => 4,
        _ => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_parses_decimal_string() {
        let data: ProbeData = serde_json::from_str(
            r#"{"format":{"duration":"2700.480000"},"streams":[]}"#,
        )
        .unwrap();
        assert!((data.format.duration_seconds() - 2700.48).abs() < f64::EPSILON);
    }

    #[test]
    fn priority_buckets() {
        assert_eq!(priority_for_duration(Duration::from_secs(29 * 60)), 1);
        assert_eq!(priority_for_duration(Duration::from_secs(45 * 60)), 2);
        assert_eq!(priority_for_duration(Duration::from_secs(90 * 60)), 3);
        assert_eq!(priority_for_duration(Duration::from_secs(150 * 60)), 4);
        assert_eq!(priority_for_duration(Duration::from_secs(240 * 60)), 5);
    }
}
