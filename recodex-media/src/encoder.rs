//! ffmpeg command-line construction for the library-shrinking encode.

use std::path::Path;

use crate::container::ContainerData;

const VIDEO_CODEC: &str = "libx265";
const VIDEO_CRF: u32 = 21;
const VIDEO_PRESET: &str = "medium";
const AUDIO_CODEC: &str = "libfdk_aac";
const AUDIO_VBR: u32 = 5;
const MAX_WIDTH: u32 = 1920;
const MAX_HEIGHT: u32 = 1080;

#[derive(Debug, Clone, Copy)]
pub struct EncoderSettings {
    pub threads: u8,
}

impl EncoderSettings {
    /// Build the full ffmpeg argument vector.
    ///
    /// Converted subtitle tracks become extra `.srt` inputs in the order the
    /// image-based streams appear in the container; everything else maps
    /// from input 0.
    pub fn build_args(
        &self,
        container: &ContainerData,
        source: &Path,
        work_dir: &Path,
        output: &Path,
    ) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-threads".into(),
            self.threads.to_string(),
            "-i".into(),
            source.display().to_string(),
        ];

        for subtitle in container.image_subtitles() {
            args.push("-i".into());
            args.push(
                work_dir
                    .join(format!("{}.srt", subtitle.index))
                    .display()
                    .to_string(),
            );
        }

        args.extend([
            "-map".into(),
            format!("0:{}", container.video.index),
            "-map_chapters".into(),
            "-1".into(),
            "-flags".into(),
            "+global_header".into(),
            "-filter:v".into(),
            format!(
                "scale='min({MAX_WIDTH},iw)':min'({MAX_HEIGHT},ih)':force_original_aspect_ratio=decrease"
            ),
            "-c:v".into(),
            VIDEO_CODEC.into(),
            "-crf".into(),
            VIDEO_CRF.to_string(),
            "-preset".into(),
            VIDEO_PRESET.into(),
        ]);

        for (position, audio) in container.audios.iter().enumerate() {
            args.extend([
                "-map".into(),
                format!("0:{}", audio.index),
                format!("-metadata:s:a:{position}"),
                format!("title={} ({})", audio.language, audio.channel_layout),
                format!("-c:a:{position}"),
                AUDIO_CODEC.into(),
                "-vbr".into(),
                AUDIO_VBR.to_string(),
            ]);
        }

        let mut srt_input = 0usize;
        for (position, subtitle) in container.subtitles.iter().enumerate() {
            if subtitle.is_image_based() {
                srt_input += 1;
                args.extend([
                    "-map".into(),
                    srt_input.to_string(),
                    format!("-c:s:{position}"),
                    "srt".into(),
                ]);
                if subtitle.forced {
                    args.extend([
                        format!("-disposition:s:s:{position}"),
                        "forced".into(),
                        format!("-disposition:s:s:{position}"),
                        "default".into(),
                    ]);
                }
                if subtitle.comment {
                    args.extend([format!("-disposition:s:s:{position}"), "comment".into()]);
                }
                args.extend([
                    format!("-metadata:s:s:{position}"),
                    format!("language={}", subtitle.language),
                    format!("-metadata:s:s:{position}"),
                    format!("title={}", subtitle.title),
                    "-max_interleave_delta".into(),
                    "0".into(),
                ]);
            } else {
                args.extend([
                    "-map".into(),
                    format!("0:{}", subtitle.index),
                    format!("-c:s:{position}"),
                    "copy".into(),
                ]);
            }
        }

        args.extend([
            "-max_muxing_queue_size".into(),
            "9999".into(),
            "-metadata".into(),
            format!("encodeParameters={}", container.to_json()),
            "-y".into(),
            output.display().to_string(),
        ]);

        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeData;

    fn container() -> ContainerData {
        let data: ProbeData = serde_json::from_str(
            r#"{"format":{"duration":"3600.0"},"streams":[
                {"index":0,"codec_type":"video","codec_name":"h264"},
                {"index":1,"codec_type":"audio","channels":6,"bit_rate":"384000","channel_layout":"5.1","tags":{"language":"eng"}},
                {"index":2,"codec_type":"subtitle","codec_name":"hdmv_pgs_subtitle","tags":{"language":"eng"}},
                {"index":3,"codec_type":"subtitle","codec_name":"subrip","tags":{"language":"spa"}}
            ]}"#,
        )
        .unwrap();
        ContainerData::summarize(&data).unwrap()
    }

    #[test]
    fn srt_inputs_follow_the_source() {
        let settings = EncoderSettings { threads: 8 };
        let args = settings.build_args(
            &container(),
            Path::new("/work/j/src.mkv"),
            Path::new("/work/j"),
            Path::new("/work/j/j-encoded.mkv"),
        );

        let joined = args.join(" ");
        assert!(joined.starts_with("-hide_banner -threads 8 -i /work/j/src.mkv -i /work/j/2.srt"));
        assert!(joined.contains("-c:v libx265 -crf 21 -preset medium"));
        assert!(joined.contains("-map 0:1"));
        assert!(joined.contains("-c:a:0 libfdk_aac -vbr 5"));
        // Converted track maps from the srt input, text track copies.
        assert!(joined.contains("-map 1 -c:s:0 srt"));
        assert!(joined.contains("-map 0:3 -c:s:1 copy"));
        assert!(joined.contains("-max_muxing_queue_size 9999"));
        assert!(joined.ends_with("-y /work/j/j-encoded.mkv"));
    }
}
