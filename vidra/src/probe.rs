//! Availability probe for the upstream search flow.

use reqwest::{Client, StatusCode};
use tracing::{debug, trace};

use crate::Result;
use crate::task::{ContentKind, ContentRef};

/// HEAD-checks whether content exists for a language on the embed provider.
pub struct AvailabilityProbe {
    client: Client,
    extractor_base_url: String,
}

impl AvailabilityProbe {
    pub fn new(client: Client, extractor_base_url: impl Into<String>) -> Self {
        Self {
            client,
            extractor_base_url: extractor_base_url.into(),
        }
    }

    /// Embed page URL for one (content, language) pair.
    pub fn embed_url(&self, content: &ContentRef, language: &str) -> String {
        let base = self.extractor_base_url.trim_end_matches('/');
        match content.kind {
            ContentKind::Movie => format!("{base}/movie/{}?lang={language}", content.id),
            ContentKind::Episode => format!(
                "{base}/tv/{}/{}/{}?lang={language}",
                content.id,
                content.season.unwrap_or(1),
                content.episode.unwrap_or(1),
            ),
        }
    }

    /// Languages whose embed page answers 2xx on a HEAD request.
    ///
    /// A 503 is retried once. The probe short-circuits at the first hit, so
    /// the result carries at most one language.
    pub async fn probe(&self, content: &ContentRef, languages: &[String]) -> Result<Vec<String>> {
        for language in languages {
            let url = self.embed_url(content, language);
            if self.head_ok(&url).await? {
                debug!(content = %content.id, language, "Content available");
                return Ok(vec![language.clone()]);
            }
        }
        Ok(Vec::new())
    }

    async fn head_ok(&self, url: &str) -> Result<bool> {
        for attempt in 0..2 {
            let status = match self.client.head(url).send().await {
                Ok(response) => response.status(),
                Err(e) => {
                    trace!(url, error = %e, "Probe request failed");
                    return Ok(false);
                }
            };
            if status.is_success() {
                return Ok(true);
            }
            if status != StatusCode::SERVICE_UNAVAILABLE || attempt == 1 {
                return Ok(false);
            }
            trace!(url, "Probe got 503, retrying once");
        }
        Ok(false)
    }
}
