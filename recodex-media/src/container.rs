//! Condensed view of a probed container: the streams the encode will keep.

use serde::Serialize;

use crate::probe::ProbeData;
use crate::MediaError;

#[derive(Debug, Clone, Serialize)]
pub struct VideoStream {
    pub index: i32,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioStream {
    pub index: i32,
    pub language: String,
    pub channels: u32,
    pub channel_layout: String,
    pub bitrate: u64,
    pub default: bool,
    pub title: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubtitleStream {
    pub index: i32,
    pub language: String,
    pub forced: bool,
    pub comment: bool,
    pub codec: String,
    pub title: String,
}

impl SubtitleStream {
    /// Image-based subtitles need OCR before they can ride along as text.
    pub fn is_image_based(&self) -> bool {
        self.codec.to_lowercase().contains("pgs")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerData {
    pub video: VideoStream,
    pub audios: Vec<AudioStream>,
    pub subtitles: Vec<SubtitleStream>,
}

impl ContainerData {
    /// Reduce a probe to the streams worth keeping.
    ///
    /// Audio keeps one stream per language: most channels wins, ties break
    /// on higher bitrate, then on lower stream index. Subtitles are all
    /// kept, with image-based ones flagged for conversion.
    pub fn summarize(data: &ProbeData) -> Result<Self, MediaError> {
        let video_stream = data
            .streams
            .iter()
            .find(|stream| stream.is_type("video"))
            .ok_or(MediaError::NoVideoStream)?;
        let video = VideoStream {
            index: video_stream.index,
            duration_seconds: data.format.duration_seconds(),
        };

        let mut audios: Vec<AudioStream> = Vec::new();
        for stream in data.streams.iter().filter(|s| s.is_type("audio")) {
            let candidate = AudioStream {
                index: stream.index,
                language: stream.language().to_string(),
                channels: stream.channels.unwrap_or(0),
                channel_layout: stream.channel_layout.clone().unwrap_or_default(),
                bitrate: stream.bit_rate(),
                default: stream.is_default(),
                title: stream.title().to_string(),
            };
            match audios.iter_mut().find(|a| a.language == candidate.language) {
                None => audios.push(candidate),
                Some(best) => {
                    let better = candidate.channels > best.channels
                        || (candidate.channels == best.channels
                            && candidate.bitrate > best.bitrate);
                    if better {
                        *best = candidate;
                    }
                }
            }
        }

        let subtitles = data
            .streams
            .iter()
            .filter(|s| s.is_type("subtitle"))
            .map(|stream| SubtitleStream {
                index: stream.index,
                language: stream.language().to_string(),
                forced: stream.is_forced(),
                comment: stream.is_comment(),
                codec: stream.codec_name.clone().unwrap_or_default(),
                title: stream.title().to_string(),
            })
            .collect();

        Ok(Self {
            video,
            audios,
            subtitles,
        })
    }

    pub fn has_image_subtitles(&self) -> bool {
        self.subtitles.iter().any(SubtitleStream::is_image_based)
    }

    pub fn image_subtitles(&self) -> impl Iterator<Item = &SubtitleStream> {
        self.subtitles.iter().filter(|s| s.is_image_based())
    }

    /// JSON summary embedded into the encoded file's metadata.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(streams: &str) -> ProbeData {
        serde_json::from_str(&format!(
            r#"{{"format":{{"duration":"3600.0"}},"streams":[{streams}]}}"#
        ))
        .unwrap()
    }

    #[test]
    fn picks_best_audio_per_language() {
        let data = probe(
            r#"{"index":0,"codec_type":"video","codec_name":"h264"},
               {"index":1,"codec_type":"audio","channels":2,"bit_rate":"128000","tags":{"language":"eng"}},
               {"index":2,"codec_type":"audio","channels":6,"bit_rate":"384000","tags":{"language":"eng"}},
               {"index":3,"codec_type":"audio","channels":6,"bit_rate":"640000","tags":{"language":"eng"}},
               {"index":4,"codec_type":"audio","channels":2,"bit_rate":"192000","tags":{"language":"spa"}}"#,
        );
        let container = ContainerData::summarize(&data).unwrap();
        assert_eq!(container.audios.len(), 2);

        let eng = container.audios.iter().find(|a| a.language == "eng").unwrap();
        assert_eq!(eng.index, 3);
        let spa = container.audios.iter().find(|a| a.language == "spa").unwrap();
        assert_eq!(spa.index, 4);
    }

    #[test]
    fn audio_ties_resolve_to_lower_index() {
        let data = probe(
            r#"{"index":0,"codec_type":"video"},
               {"index":1,"codec_type":"audio","channels":6,"bit_rate":"384000","tags":{"language":"eng"}},
               {"index":2,"codec_type":"audio","channels":6,"bit_rate":"384000","tags":{"language":"eng"}}"#,
        );
        let container = ContainerData::summarize(&data).unwrap();
        assert_eq!(container.audios.len(), 1);
        assert_eq!(container.audios[0].index, 1);
    }

    #[test]
    fn flags_pgs_subtitles() {
        let data = probe(
            r#"{"index":0,"codec_type":"video"},
               {"index":1,"codec_type":"subtitle","codec_name":"hdmv_pgs_subtitle","tags":{"language":"eng"}},
               {"index":2,"codec_type":"subtitle","codec_name":"subrip","tags":{"language":"spa"}}"#,
        );
        let container = ContainerData::summarize(&data).unwrap();
        assert!(container.has_image_subtitles());
        assert_eq!(container.image_subtitles().count(), 1);
        assert!(container.subtitles[0].is_image_based());
        assert!(!container.subtitles[1].is_image_based());
    }

    #[test]
    fn missing_video_stream_is_an_error() {
        let data = probe(r#"{"index":0,"codec_type":"audio","channels":2}"#);
        assert!(matches!(
            ContainerData::summarize(&data),
            Err(MediaError::NoVideoStream)
        ));
    }
}
