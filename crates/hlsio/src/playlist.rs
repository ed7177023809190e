// Playlist fetching and classification on top of m3u8-rs.

use crate::config::PlaylistConfig;
use crate::error::HlsError;
use m3u8_rs::{AlternativeMediaType, KeyMethod, Playlist};
use reqwest::Client;
use reqwest::header::{ACCEPT, REFERER};
use tracing::{debug, trace};
use url::Url;

/// One video rendition advertised by a master playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoVariant {
    pub bandwidth: u64,
    /// `WxH` as written in the playlist, when present.
    pub resolution: Option<String>,
    pub url: Url,
}

/// An alternative audio rendition (`#EXT-X-MEDIA:TYPE=AUDIO`).
#[derive(Debug, Clone, PartialEq)]
pub struct AudioRendition {
    pub group_id: String,
    pub language: Option<String>,
    pub name: String,
    pub url: Url,
}

/// An alternative subtitle rendition (`#EXT-X-MEDIA:TYPE=SUBTITLES`).
#[derive(Debug, Clone, PartialEq)]
pub struct SubtitleRendition {
    pub group_id: String,
    pub language: Option<String>,
    pub name: String,
    pub url: Url,
}

/// Segment encryption declared by `#EXT-X-KEY`.
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptionInfo {
    pub method: EncryptionMethod,
    pub key_url: Option<Url>,
    /// IV hex string as written (`0x...` prefix preserved).
    pub iv_hex: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptionMethod {
    None,
    Aes128,
    /// Parsed but not decryptable; attempting to download such a track fails.
    Other(String),
}

/// A classified playlist with every URI already absolute.
#[derive(Debug, Clone)]
pub enum HlsPlaylist {
    Master(MasterManifest),
    Media(MediaManifest),
}

#[derive(Debug, Clone, Default)]
pub struct MasterManifest {
    pub variants: Vec<VideoVariant>,
    pub audio: Vec<AudioRendition>,
    pub subtitles: Vec<SubtitleRendition>,
}

#[derive(Debug, Clone, Default)]
pub struct MediaManifest {
    pub segments: Vec<Url>,
    pub encryption: Option<EncryptionInfo>,
}

/// Fetches playlist text with the embed referer and classifies it.
#[derive(Debug, Clone)]
pub struct PlaylistFetcher {
    client: Client,
    config: PlaylistConfig,
}

impl PlaylistFetcher {
    pub fn new(client: Client, config: PlaylistConfig) -> Self {
        Self { client, config }
    }

    pub async fn fetch(&self, url: &Url, referer: &str) -> Result<HlsPlaylist, HlsError> {
        trace!(url = %url, "Fetching playlist");
        let response = self
            .client
            .get(url.clone())
            .header(ACCEPT, "*/*")
            .header(REFERER, referer)
            .timeout(self.config.fetch_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(HlsError::http_status(status, url.as_str(), "playlist fetch"));
        }

        let body = response.bytes().await?;
        parse_playlist(&body, url)
    }
}

/// Parse playlist bytes and resolve every URI against `base`.
pub fn parse_playlist(bytes: &[u8], base: &Url) -> Result<HlsPlaylist, HlsError> {
    let playlist = m3u8_rs::parse_playlist_res(bytes)
        .map_err(|e| HlsError::playlist(format!("malformed playlist at {base}: {e}")))?;

    match playlist {
        Playlist::MasterPlaylist(master) => {
            let mut manifest = MasterManifest::default();

            for variant in &master.variants {
                manifest.variants.push(VideoVariant {
                    bandwidth: variant.bandwidth,
                    resolution: variant
                        .resolution
                        .as_ref()
                        .map(|r| format!("{}x{}", r.width, r.height)),
                    url: resolve(base, &variant.uri)?,
                });
            }

            for media in &master.alternatives {
                // Renditions without a URI are embedded in the variant stream
                // and cannot be downloaded separately.
                let Some(uri) = &media.uri else { continue };
                let url = resolve(base, uri)?;
                match media.media_type {
                    AlternativeMediaType::Audio => manifest.audio.push(AudioRendition {
                        group_id: media.group_id.clone(),
                        language: media.language.clone(),
                        name: media.name.clone(),
                        url,
                    }),
                    AlternativeMediaType::Subtitles => {
                        manifest.subtitles.push(SubtitleRendition {
                            group_id: media.group_id.clone(),
                            language: media.language.clone(),
                            name: media.name.clone(),
                            url,
                        })
                    }
                    _ => {}
                }
            }

            debug!(
                variants = manifest.variants.len(),
                audio = manifest.audio.len(),
                subtitles = manifest.subtitles.len(),
                "Parsed master playlist"
            );
            Ok(HlsPlaylist::Master(manifest))
        }
        Playlist::MediaPlaylist(media) => {
            let mut manifest = MediaManifest::default();

            for segment in &media.segments {
                if let Some(key) = &segment.key
                    && manifest.encryption.is_none()
                {
                    manifest.encryption = encryption_from_key(key, base)?;
                }
                manifest.segments.push(resolve(base, &segment.uri)?);
            }

            debug!(
                segments = manifest.segments.len(),
                encrypted = manifest.encryption.is_some(),
                "Parsed media playlist"
            );
            Ok(HlsPlaylist::Media(manifest))
        }
    }
}

fn encryption_from_key(
    key: &m3u8_rs::Key,
    base: &Url,
) -> Result<Option<EncryptionInfo>, HlsError> {
    let method = match &key.method {
        KeyMethod::None => return Ok(None),
        KeyMethod::AES128 => EncryptionMethod::Aes128,
        KeyMethod::SampleAES => EncryptionMethod::Other("SAMPLE-AES".to_string()),
        KeyMethod::Other(name) => EncryptionMethod::Other(name.clone()),
    };

    let key_url = match &key.uri {
        Some(uri) => Some(resolve(base, uri)?),
        None => None,
    };

    Ok(Some(EncryptionInfo {
        method,
        key_url,
        iv_hex: key.iv.clone(),
    }))
}

/// Resolve a possibly-relative playlist URI against the playlist URL.
///
/// Handles plain relative (`seg1.ts`), path-absolute (`/v/seg1.ts`) and
/// scheme-relative (`//cdn.example.com/seg1.ts`) forms.
pub fn resolve(base: &Url, uri: &str) -> Result<Url, HlsError> {
    base.join(uri).map_err(|e| HlsError::InvalidUrl {
        input: uri.to_string(),
        reason: format!("cannot resolve against {base}: {e}"),
    })
}
