// Variant and rendition selection against a parsed master playlist.

use crate::playlist::{AudioRendition, MasterManifest, SubtitleRendition, VideoVariant};

/// How to pick the video variant.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum QualityPreference {
    /// Highest bandwidth.
    #[default]
    Best,
    /// Lowest bandwidth.
    Worst,
    /// Exact resolution height, e.g. `1080` from a `1080p` hint.
    Height(u32),
}

impl QualityPreference {
    /// Parse a user hint: `best`, `worst`, or `<integer>[p]`.
    ///
    /// Anything unparseable falls back to `Best`.
    pub fn parse(hint: &str) -> Self {
        let hint = hint.trim();
        match hint.to_ascii_lowercase().as_str() {
            "" | "best" => Self::Best,
            "worst" => Self::Worst,
            other => other
                .strip_suffix('p')
                .unwrap_or(other)
                .parse::<u32>()
                .map(Self::Height)
                .unwrap_or(Self::Best),
        }
    }
}

/// Height of a `WxH` resolution string.
fn resolution_height(resolution: &str) -> Option<u32> {
    let (_, h) = resolution.split_once('x')?;
    h.trim().parse().ok()
}

/// Pick the video variant for the preference.
///
/// An exact-height hint wins when a variant matches it; otherwise the
/// bandwidth rule applies. Ties keep the first occurrence.
pub fn select_variant<'a>(
    variants: &'a [VideoVariant],
    preference: &QualityPreference,
) -> Option<&'a VideoVariant> {
    if variants.is_empty() {
        return None;
    }

    if let QualityPreference::Height(height) = preference
        && let Some(variant) = variants.iter().find(|v| {
            v.resolution
                .as_deref()
                .and_then(resolution_height)
                .is_some_and(|h| h == *height)
        })
    {
        return Some(variant);
    }

    let better = |a: u64, b: u64| match preference {
        QualityPreference::Worst => a < b,
        _ => a > b,
    };

    let mut chosen = &variants[0];
    for variant in &variants[1..] {
        // Strict comparison keeps the first occurrence on equal bandwidth.
        if better(variant.bandwidth, chosen.bandwidth) {
            chosen = variant;
        }
    }
    Some(chosen)
}

/// Case-insensitive exact match, then a two-way prefix match so ISO 639-1
/// (`en`) and ISO 639-2 (`eng`) codes find each other.
fn language_matches(candidate: &str, wanted: &str) -> bool {
    let candidate = candidate.to_ascii_lowercase();
    let wanted = wanted.to_ascii_lowercase();
    candidate == wanted || candidate.starts_with(&wanted) || wanted.starts_with(&candidate)
}

fn find_by_language<'a, T>(
    tracks: &'a [T],
    language: &str,
    tag: impl Fn(&T) -> Option<&str>,
) -> Option<&'a T> {
    let lowered = language.to_ascii_lowercase();
    tracks
        .iter()
        .find(|t| tag(t).is_some_and(|l| l.eq_ignore_ascii_case(&lowered)))
        .or_else(|| {
            tracks
                .iter()
                .find(|t| tag(t).is_some_and(|l| language_matches(l, &lowered)))
        })
}

/// Audio rendition for a language, or `None` when the master has no match.
pub fn select_audio<'a>(
    master: &'a MasterManifest,
    language: &str,
) -> Option<&'a AudioRendition> {
    find_by_language(&master.audio, language, |t| t.language.as_deref())
}

/// Subtitle rendition for a language, or `None` when the master has no match.
pub fn select_subtitle<'a>(
    master: &'a MasterManifest,
    language: &str,
) -> Option<&'a SubtitleRendition> {
    find_by_language(&master.subtitles, language, |t| t.language.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn variant(bandwidth: u64, resolution: Option<&str>) -> VideoVariant {
        VideoVariant {
            bandwidth,
            resolution: resolution.map(str::to_string),
            url: Url::parse(&format!("https://cdn.example.com/v/{bandwidth}.m3u8")).unwrap(),
        }
    }

    fn audio(language: &str) -> AudioRendition {
        AudioRendition {
            group_id: "aud".into(),
            language: Some(language.into()),
            name: language.to_uppercase(),
            url: Url::parse(&format!("https://cdn.example.com/a/{language}.m3u8")).unwrap(),
        }
    }

    #[test]
    fn parses_quality_hints() {
        assert_eq!(QualityPreference::parse("best"), QualityPreference::Best);
        assert_eq!(QualityPreference::parse("Worst"), QualityPreference::Worst);
        assert_eq!(QualityPreference::parse("1080"), QualityPreference::Height(1080));
        assert_eq!(QualityPreference::parse("720p"), QualityPreference::Height(720));
        assert_eq!(QualityPreference::parse("4k-ish"), QualityPreference::Best);
    }

    #[test]
    fn exact_height_beats_bandwidth() {
        let variants = [
            variant(5_000_000, Some("1920x1080")),
            variant(2_500_000, Some("1280x720")),
        ];
        let chosen = select_variant(&variants, &QualityPreference::Height(720)).unwrap();
        assert_eq!(chosen.bandwidth, 2_500_000);
    }

    #[test]
    fn missing_height_falls_back_to_best() {
        let variants = [
            variant(2_500_000, Some("1280x720")),
            variant(5_000_000, Some("1920x1080")),
        ];
        let chosen = select_variant(&variants, &QualityPreference::Height(480)).unwrap();
        assert_eq!(chosen.bandwidth, 5_000_000);
    }

    #[test]
    fn bandwidth_tie_keeps_first_occurrence() {
        let variants = [
            variant(5_000_000, Some("1920x1080")),
            variant(5_000_000, Some("1920x1088")),
        ];
        let chosen = select_variant(&variants, &QualityPreference::Best).unwrap();
        assert_eq!(chosen.resolution.as_deref(), Some("1920x1080"));
    }

    #[test]
    fn worst_picks_lowest_bandwidth() {
        let variants = [
            variant(5_000_000, Some("1920x1080")),
            variant(1_000_000, Some("854x480")),
        ];
        let chosen = select_variant(&variants, &QualityPreference::Worst).unwrap();
        assert_eq!(chosen.bandwidth, 1_000_000);
    }

    #[test]
    fn language_exact_match_is_case_insensitive() {
        let master = MasterManifest {
            variants: vec![],
            audio: vec![audio("en"), audio("it")],
            subtitles: vec![],
        };
        assert_eq!(
            select_audio(&master, "EN").unwrap().language.as_deref(),
            Some("en")
        );
    }

    #[test]
    fn language_prefix_match_bridges_iso_639_variants() {
        let master = MasterManifest {
            variants: vec![],
            audio: vec![audio("eng"), audio("ita")],
            subtitles: vec![],
        };
        // 639-1 request against 639-2 rendition, and the reverse.
        assert_eq!(
            select_audio(&master, "en").unwrap().language.as_deref(),
            Some("eng")
        );
        let short = MasterManifest {
            variants: vec![],
            audio: vec![audio("it")],
            subtitles: vec![],
        };
        assert_eq!(
            select_audio(&short, "ita").unwrap().language.as_deref(),
            Some("it")
        );
    }

    #[test]
    fn exact_match_wins_over_prefix() {
        let master = MasterManifest {
            variants: vec![],
            audio: vec![audio("eng"), audio("en")],
            subtitles: vec![],
        };
        assert_eq!(
            select_audio(&master, "en").unwrap().language.as_deref(),
            Some("en")
        );
    }

    #[test]
    fn absent_language_returns_none() {
        let master = MasterManifest {
            variants: vec![],
            audio: vec![audio("en")],
            subtitles: vec![],
        };
        assert!(select_audio(&master, "fr").is_none());
        assert!(select_subtitle(&master, "en").is_none());
    }
}
