//! Interface to the external content catalog.
//!
//! The catalog is an external collaborator: it supplies titles, years,
//! seasons and episode names used for output naming. Only the interface is
//! defined here.

use async_trait::async_trait;

use crate::Result;

/// Movie metadata as returned by the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovieMeta {
    pub id: String,
    pub title: String,
    pub year: Option<u32>,
}

/// Episode metadata as returned by the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpisodeMeta {
    pub show_id: String,
    pub show_title: String,
    pub season: u32,
    pub episode: u32,
    pub episode_title: Option<String>,
}

#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn movie(&self, id: &str) -> Result<MovieMeta>;

    async fn episode(&self, id: &str, season: u32, episode: u32) -> Result<EpisodeMeta>;

    /// Every episode of one season, in episode order.
    async fn season(&self, id: &str, season: u32) -> Result<Vec<EpisodeMeta>>;

    /// Season numbers of a show, ascending.
    async fn seasons(&self, id: &str) -> Result<Vec<u32>>;
}
