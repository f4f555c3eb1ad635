//! Encode progress scraped from ffmpeg's stderr stream.

use std::sync::LazyLock;

use regex::Regex;

static SPEED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"speed=\s*(\d*\.?\d+)x").expect("speed regex"));
static TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"time=(\d{2,}):(\d{2}):(\d{2})").expect("time regex"));

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodeProgress {
    pub seconds: u64,
    pub speed: f64,
    pub percent: f64,
}

/// Accumulates stderr chunks and yields a progress point once both a
/// `time=` and a `speed=` reading arrived.
#[derive(Debug)]
pub struct ProgressParser {
    duration_seconds: f64,
    seconds: Option<u64>,
    speed: Option<f64>,
}

impl ProgressParser {
    pub fn new(duration_seconds: f64) -> Self {
        Self {
            duration_seconds,
            seconds: None,
            speed: None,
        }
    }

    pub fn feed(&mut self, chunk: &str) -> Option<EncodeProgress> {
        if let Some(captures) = TIME.captures(chunk) {
            let hours: u64 = captures[1].parse().ok()?;
            let minutes: u64 = captures[2].parse().ok()?;
            let seconds: u64 = captures[3].parse().ok()?;
            self.seconds = Some(hours * 3600 + minutes * 60 + seconds);
        }
        if let Some(captures) = SPEED.captures(chunk) {
            self.speed = captures[1].parse().ok();
        }

        match (self.seconds, self.speed) {
            (Some(seconds), Some(speed)) => {
                self.seconds = None;
                self.speed = None;
                let percent = if self.duration_seconds > 0.0 {
                    (seconds as f64 * 100.0) / self.duration_seconds
                } else {
                    0.0
                };
                Some(EncodeProgress {
                    seconds,
                    speed,
                    percent,
                })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_once_both_readings_arrive() {
        let mut parser = ProgressParser::new(3600.0);
        assert!(parser.feed("frame= 100 fps= 25").is_none());
        assert!(parser.feed("time=00:30:00 bitrate=").is_none());

        let progress = parser.feed("speed=1.5x").unwrap();
        assert_eq!(progress.seconds, 1800);
        assert!((progress.speed - 1.5).abs() < f64::EPSILON);
        assert!((progress.percent - 50.0).abs() < 1e-9);

        // Readings are consumed; the next chunk starts a fresh pair.
        assert!(parser.feed("speed=1.6x").is_none());
    }

    #[test]
    fn single_chunk_with_both_fields() {
        let mut parser = ProgressParser::new(100.0);
        let progress = parser
            .feed("frame=1 time=00:00:25 bitrate=2000k speed=0.98x")
            .unwrap();
        assert_eq!(progress.seconds, 25);
        assert!((progress.percent - 25.0).abs() < 1e-9);
    }

    #[test]
    fn ignores_malformed_time() {
        let mut parser = ProgressParser::new(100.0);
        assert!(parser.feed("time=N/A speed=1.0x").is_none());
    }
}
