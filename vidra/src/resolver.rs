//! Interface to the embed-page playlist resolver.
//!
//! The scrape that turns an embed page into a master playlist URL lives
//! outside this crate; orchestration only depends on this trait.

use std::collections::HashMap;

use async_trait::async_trait;
use url::Url;

use crate::Result;
use crate::task::ContentRef;

/// The result of resolving one (content, language) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPlaylist {
    /// Embed page URL, sent as the `Referer` on every playlist/segment fetch.
    pub referer_url: String,
    pub master_playlist_url: Url,
}

#[async_trait]
pub trait PlaylistResolver: Send + Sync {
    /// Resolve content in a language to its referer and master playlist.
    ///
    /// `Ok(None)` means the content is not available in that language;
    /// `Err` means the provider itself failed.
    async fn resolve(
        &self,
        content: &ContentRef,
        language: &str,
    ) -> Result<Option<ResolvedPlaylist>>;
}

/// A resolver backed by a fixed map, for direct-URL downloads and tests.
#[derive(Debug, Default)]
pub struct StaticResolver {
    entries: HashMap<String, ResolvedPlaylist>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `resolved` for every language of `content_id`.
    pub fn with_entry(mut self, content_id: impl Into<String>, resolved: ResolvedPlaylist) -> Self {
        self.entries.insert(content_id.into(), resolved);
        self
    }
}

#[async_trait]
impl PlaylistResolver for StaticResolver {
    async fn resolve(
        &self,
        content: &ContentRef,
        _language: &str,
    ) -> Result<Option<ResolvedPlaylist>> {
        Ok(self.entries.get(&content.id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_resolver_maps_by_content_id() {
        let resolved = ResolvedPlaylist {
            referer_url: "https://embed.example.com/movie/42".to_string(),
            master_playlist_url: Url::parse("https://cdn.example.com/42/master.m3u8").unwrap(),
        };
        let resolver = StaticResolver::new().with_entry("42", resolved.clone());

        let hit = resolver
            .resolve(&ContentRef::movie("42"), "en")
            .await
            .unwrap();
        assert_eq!(hit, Some(resolved));

        let miss = resolver
            .resolve(&ContentRef::movie("7"), "en")
            .await
            .unwrap();
        assert!(miss.is_none());
    }
}
