//! Argv builders for the external codec-copy tool.

use std::path::{Path, PathBuf};

/// One already-downloaded audio or subtitle artifact headed into the mux.
#[derive(Debug, Clone)]
pub struct MuxTrack {
    pub path: PathBuf,
    pub language: String,
    /// Track name from the master playlist, written as stream title metadata.
    pub title: Option<String>,
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Remux a concatenated transport stream into MP4 without re-encoding.
///
/// ADTS-framed AAC needs the `aac_adtstoasc` bitstream filter to live in an
/// MP4 container; the audio map is optional so streams without embedded
/// audio pass through.
pub fn video_convert_args(input: &Path, output: &Path) -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-i".into(),
        path_arg(input),
        "-map".into(),
        "0:v:0".into(),
        "-map".into(),
        "0:a?".into(),
        "-c".into(),
        "copy".into(),
        "-bsf:a".into(),
        "aac_adtstoasc".into(),
        "-y".into(),
        path_arg(output),
    ]
}

/// Extract the audio of a transport stream into M4A, discarding video.
pub fn audio_convert_args(input: &Path, output: &Path) -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-i".into(),
        path_arg(input),
        "-vn".into(),
        "-c:a".into(),
        "copy".into(),
        "-bsf:a".into(),
        "aac_adtstoasc".into(),
        "-y".into(),
        path_arg(output),
    ]
}

/// The final mux: video plus the completed audio and subtitle lanes.
///
/// With no separate audio inputs the video's own audio (if any) is mapped
/// optionally; otherwise each audio input contributes its first audio
/// stream. The first separate audio and the first subtitle are flagged as
/// default tracks.
pub fn mux_args(
    video: &Path,
    audio: &[MuxTrack],
    subtitles: &[MuxTrack],
    output: &Path,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-i".into(), path_arg(video)];

    for track in audio.iter().chain(subtitles.iter()) {
        args.push("-i".into());
        args.push(path_arg(&track.path));
    }

    args.push("-map".into());
    args.push("0:v:0".into());

    if audio.is_empty() {
        args.push("-map".into());
        args.push("0:a?".into());
    } else {
        for input_index in 1..=audio.len() {
            args.push("-map".into());
            args.push(format!("{input_index}:a:0"));
        }
    }

    for subtitle_index in 0..subtitles.len() {
        let input_index = 1 + audio.len() + subtitle_index;
        args.push("-map".into());
        args.push(format!("{input_index}:s:0"));
    }

    args.push("-c:v".into());
    args.push("copy".into());
    args.push("-c:a".into());
    args.push("copy".into());
    if !subtitles.is_empty() {
        args.push("-c:s".into());
        args.push("mov_text".into());
    }

    for (stream_index, track) in audio.iter().enumerate() {
        args.push(format!("-metadata:s:a:{stream_index}"));
        args.push(format!("language={}", track.language));
        if let Some(title) = &track.title {
            args.push(format!("-metadata:s:a:{stream_index}"));
            args.push(format!("title={title}"));
        }
    }
    for (stream_index, track) in subtitles.iter().enumerate() {
        args.push(format!("-metadata:s:s:{stream_index}"));
        args.push(format!("language={}", track.language));
        if let Some(title) = &track.title {
            args.push(format!("-metadata:s:s:{stream_index}"));
            args.push(format!("title={title}"));
        }
    }

    if !audio.is_empty() {
        args.push("-disposition:a:0".into());
        args.push("default".into());
    }
    if !subtitles.is_empty() {
        args.push("-disposition:s:0".into());
        args.push("default".into());
    }

    args.push("-y".into());
    args.push(path_arg(output));
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(path: &str, language: &str, title: Option<&str>) -> MuxTrack {
        MuxTrack {
            path: PathBuf::from(path),
            language: language.to_string(),
            title: title.map(str::to_string),
        }
    }

    #[test]
    fn video_convert_copies_and_filters_adts() {
        let args = video_convert_args(Path::new("/t/video.ts"), Path::new("/t/video.mp4"));
        assert_eq!(
            args,
            vec![
                "-hide_banner", "-i", "/t/video.ts", "-map", "0:v:0", "-map", "0:a?", "-c",
                "copy", "-bsf:a", "aac_adtstoasc", "-y", "/t/video.mp4",
            ]
        );
    }

    #[test]
    fn audio_convert_drops_video() {
        let args = audio_convert_args(Path::new("/t/audio_en.ts"), Path::new("/t/audio_en.m4a"));
        assert!(args.contains(&"-vn".to_string()));
        assert!(args.ends_with(&["-y".to_string(), "/t/audio_en.m4a".to_string()]));
    }

    #[test]
    fn mux_with_audio_and_subtitles() {
        let args = mux_args(
            Path::new("/t/video.mp4"),
            &[track("/t/audio_en.m4a", "en", Some("English"))],
            &[track("/t/subtitle_en.vtt", "en", None)],
            Path::new("/out/Show.S04E04.mp4"),
        );
        let expected: Vec<String> = [
            "-hide_banner",
            "-i", "/t/video.mp4",
            "-i", "/t/audio_en.m4a",
            "-i", "/t/subtitle_en.vtt",
            "-map", "0:v:0",
            "-map", "1:a:0",
            "-map", "2:s:0",
            "-c:v", "copy",
            "-c:a", "copy",
            "-c:s", "mov_text",
            "-metadata:s:a:0", "language=en",
            "-metadata:s:a:0", "title=English",
            "-metadata:s:s:0", "language=en",
            "-disposition:a:0", "default",
            "-disposition:s:0", "default",
            "-y", "/out/Show.S04E04.mp4",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(args, expected);
    }

    #[test]
    fn mux_without_separate_audio_maps_embedded_audio_optionally() {
        let args = mux_args(
            Path::new("/t/video.mp4"),
            &[],
            &[],
            Path::new("/out/Movie.2024.mp4"),
        );
        let joined = args.join(" ");
        assert!(joined.contains("-map 0:v:0 -map 0:a?"));
        assert!(!joined.contains("disposition"));
        assert!(!joined.contains("mov_text"));
    }

    #[test]
    fn mux_input_indices_account_for_audio_count() {
        let args = mux_args(
            Path::new("/t/video.mp4"),
            &[
                track("/t/audio_en.m4a", "en", None),
                track("/t/audio_it.m4a", "it", None),
            ],
            &[track("/t/subtitle_en.vtt", "en", None)],
            Path::new("/out/o.mp4"),
        );
        let joined = args.join(" ");
        assert!(joined.contains("-map 1:a:0 -map 2:a:0 -map 3:s:0"));
        assert!(joined.contains("-metadata:s:a:1 language=it"));
    }
}
