//! Post-processing of concatenated WebVTT subtitle segments.

use std::path::Path;

use crate::Result;

/// Collapse duplicate `WEBVTT` headers in concatenated subtitle segments.
///
/// Every segment carries its own header; after concatenation only the first
/// may survive. The one blank line immediately following each duplicate
/// header is dropped with it. All other lines pass through verbatim.
pub fn collapse_headers(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut seen_header = false;
    let mut skip_following_blank = false;

    for line in input.lines() {
        if line.starts_with("WEBVTT") {
            if seen_header {
                skip_following_blank = true;
                continue;
            }
            seen_header = true;
        } else if skip_following_blank {
            skip_following_blank = false;
            if line.is_empty() {
                continue;
            }
        }
        output.push_str(line);
        output.push('\n');
    }
    output
}

/// Rewrite a concatenated `.vtt` stream into a clean subtitle file.
///
/// Returns the size of the produced artifact in bytes.
pub async fn convert_file(input: &Path, output: &Path) -> Result<u64> {
    let raw = tokio::fs::read_to_string(input).await?;
    let cleaned = collapse_headers(&raw);
    tokio::fs::write(output, cleaned.as_bytes()).await?;
    Ok(cleaned.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_single_header_untouched() {
        let input = "WEBVTT\n\n00:00.000 --> 00:02.000\nhello\n";
        assert_eq!(collapse_headers(input), input);
    }

    #[test]
    fn drops_duplicate_headers_and_their_blank_line() {
        let input = "WEBVTT\n\n00:00.000 --> 00:02.000\nfirst\n\nWEBVTT\n\n00:02.000 --> 00:04.000\nsecond\n";
        let expected = "WEBVTT\n\n00:00.000 --> 00:02.000\nfirst\n\n00:02.000 --> 00:04.000\nsecond\n";
        assert_eq!(collapse_headers(input), expected);
    }

    #[test]
    fn only_one_blank_line_is_dropped_per_duplicate() {
        let input = "WEBVTT\n\ncue one\nWEBVTT\n\n\ncue two\n";
        // The duplicate header and exactly one following blank line go away.
        let expected = "WEBVTT\n\ncue one\n\ncue two\n";
        assert_eq!(collapse_headers(input), expected);
    }

    #[test]
    fn duplicate_header_without_blank_line_keeps_the_next_cue() {
        let input = "WEBVTT\ncue one\nWEBVTT\ncue two\n";
        assert_eq!(collapse_headers(input), "WEBVTT\ncue one\ncue two\n");
    }

    #[test]
    fn header_with_trailing_text_counts_as_header() {
        let input = "WEBVTT - segment 0\n\ncue one\n\nWEBVTT - segment 1\n\ncue two\n";
        assert_eq!(
            collapse_headers(input),
            "WEBVTT - segment 0\n\ncue one\n\ncue two\n"
        );
    }

    #[tokio::test]
    async fn converts_file_and_reports_size() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("subtitle_en.ts");
        let output = dir.path().join("subtitle_en.vtt");
        tokio::fs::write(&input, "WEBVTT\n\ncue\n\nWEBVTT\n\ncue2\n")
            .await
            .unwrap();

        let written = convert_file(&input, &output).await.unwrap();
        let produced = tokio::fs::read_to_string(&output).await.unwrap();
        assert_eq!(produced, "WEBVTT\n\ncue\n\ncue2\n");
        assert_eq!(written, produced.len() as u64);
    }
}
