//! HLS engine: playlist parsing, rendition selection and parallel segment
//! download with AES-128 decryption.
//!
//! The crate deliberately knows nothing about tasks, muxing or external
//! tools; it turns one media playlist into one contiguous file on disk and
//! reports byte-level progress while doing so.

pub mod config;
pub mod decrypt;
pub mod error;
pub mod fetcher;
pub mod playlist;
pub mod retry;
pub mod select;

pub use config::{FetcherConfig, HlsConfig, PlaylistConfig};
pub use decrypt::{SegmentCipher, fetch_cipher};
pub use error::HlsError;
pub use fetcher::{FetchProgress, ProgressFn, SegmentFetcher};
pub use playlist::{
    AudioRendition, EncryptionInfo, EncryptionMethod, HlsPlaylist, MasterManifest, MediaManifest,
    PlaylistFetcher, SubtitleRendition, VideoVariant, parse_playlist,
};
pub use retry::{RetryAction, RetryPolicy, retry_with_backoff};
pub use select::{QualityPreference, select_audio, select_subtitle, select_variant};
