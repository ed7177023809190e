//! Task queue and bounded-parallel admission.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use hlsio::QualityPreference;
use parking_lot::Mutex;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::CatalogClient;
use crate::config::Config;
use crate::orchestrator::TrackOrchestrator;
use crate::paths::{episode_output_path, movie_output_path};
use crate::progress::ProgressBus;
use crate::resolver::PlaylistResolver;
use crate::store::TaskStore;
use crate::task::{ContentKind, ContentRef, ProgressEvent, Status, Task};
use crate::transcoder::TranscoderRunner;
use crate::{Error, Result};

/// Cadence of QUEUED broadcasts during batch admits.
const BATCH_EVENT_EVERY: usize = 5;

/// One admission request.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub content: ContentRef,
    /// Overrides the configured default languages when non-empty.
    pub languages: Vec<String>,
    /// Overrides the configured default quality when set.
    pub quality: Option<String>,
}

struct SchedulerInner {
    config: Arc<Config>,
    store: TaskStore,
    queue: Mutex<VecDeque<String>>,
    tokens: DashMap<String, CancellationToken>,
    bus: Arc<ProgressBus>,
    orchestrator: TrackOrchestrator,
    transcoder: Arc<TranscoderRunner>,
    catalog: Arc<dyn CatalogClient>,
}

/// Owns the task map and queue; all mutation funnels through here.
#[derive(Clone)]
pub struct DownloadScheduler {
    inner: Arc<SchedulerInner>,
}

impl DownloadScheduler {
    pub fn new(
        config: Arc<Config>,
        catalog: Arc<dyn CatalogClient>,
        resolver: Arc<dyn PlaylistResolver>,
        bus: Arc<ProgressBus>,
        client: Client,
    ) -> Self {
        let store = TaskStore::new();
        let transcoder = Arc::new(TranscoderRunner::new(
            config.transcoder_binary.clone(),
            config.transcode_timeout(),
        ));
        let orchestrator = TrackOrchestrator::new(
            Arc::clone(&config),
            store.clone(),
            Arc::clone(&bus),
            resolver,
            Arc::clone(&transcoder),
            client,
        );
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                store,
                queue: Mutex::new(VecDeque::new()),
                tokens: DashMap::new(),
                bus,
                orchestrator,
                transcoder,
                catalog,
            }),
        }
    }

    /// Resolve metadata, create the task in QUEUED and try to start it.
    pub async fn admit(&self, request: DownloadRequest) -> Result<Task> {
        let task = self.build_task(&request).await?;
        let snapshot = task.clone();
        self.enqueue(task, true);
        self.pump();
        Ok(snapshot)
    }

    /// Admit every episode of one season with a single metadata fetch.
    pub async fn admit_season(
        &self,
        show_id: &str,
        season: u32,
        languages: Vec<String>,
        quality: Option<String>,
    ) -> Result<Vec<Task>> {
        let episodes = self.inner.catalog.season(show_id, season).await?;
        self.admit_batch(show_id, episodes, languages, quality)
    }

    /// Admit every episode of every season of a show.
    pub async fn admit_series(
        &self,
        show_id: &str,
        languages: Vec<String>,
        quality: Option<String>,
    ) -> Result<Vec<Task>> {
        let mut episodes = Vec::new();
        for season in self.inner.catalog.seasons(show_id).await? {
            episodes.extend(self.inner.catalog.season(show_id, season).await?);
        }
        self.admit_batch(show_id, episodes, languages, quality)
    }

    fn admit_batch(
        &self,
        show_id: &str,
        episodes: Vec<crate::catalog::EpisodeMeta>,
        languages: Vec<String>,
        quality: Option<String>,
    ) -> Result<Vec<Task>> {
        if episodes.is_empty() {
            return Err(Error::not_found("episodes", show_id));
        }

        let languages = self.effective_languages(&languages)?;
        let quality = self.effective_quality(quality.as_deref());
        let mut admitted = Vec::with_capacity(episodes.len());

        let total = episodes.len();
        for (index, meta) in episodes.into_iter().enumerate() {
            let content = ContentRef::episode(show_id, meta.season, meta.episode);
            let output_path = episode_output_path(
                &self.inner.config.download_base_path,
                &meta.show_title,
                meta.season,
                meta.episode,
                meta.episode_title.as_deref(),
            );
            let display_name = format!(
                "{} S{:02}E{:02}",
                meta.show_title, meta.season, meta.episode
            );
            let task = Task::new(
                Uuid::new_v4().to_string(),
                content,
                display_name,
                languages.clone(),
                quality.clone(),
                output_path,
            );
            // Throttled cadence: one QUEUED broadcast per batch chunk.
            let announce = (index + 1) % BATCH_EVENT_EVERY == 0 || index + 1 == total;
            admitted.push(task.clone());
            self.enqueue(task, announce);
        }

        info!(show_id, tasks = admitted.len(), "Admitted batch");
        self.pump();
        Ok(admitted)
    }

    async fn build_task(&self, request: &DownloadRequest) -> Result<Task> {
        let languages = self.effective_languages(&request.languages)?;
        let quality = self.effective_quality(request.quality.as_deref());
        let base = &self.inner.config.download_base_path;

        let (display_name, output_path) = match request.content.kind {
            ContentKind::Movie => {
                let meta = self.inner.catalog.movie(&request.content.id).await?;
                let path = movie_output_path(base, &meta.title, meta.year);
                (meta.title, path)
            }
            ContentKind::Episode => {
                let season = request
                    .content
                    .season
                    .ok_or_else(|| Error::validation("episode request without a season"))?;
                let episode = request
                    .content
                    .episode
                    .ok_or_else(|| Error::validation("episode request without an episode"))?;
                let meta = self
                    .inner
                    .catalog
                    .episode(&request.content.id, season, episode)
                    .await?;
                let path = episode_output_path(
                    base,
                    &meta.show_title,
                    season,
                    episode,
                    meta.episode_title.as_deref(),
                );
                (
                    format!("{} S{season:02}E{episode:02}", meta.show_title),
                    path,
                )
            }
        };

        Ok(Task::new(
            Uuid::new_v4().to_string(),
            request.content.clone(),
            display_name,
            languages,
            quality,
            output_path,
        ))
    }

    fn effective_languages(&self, requested: &[String]) -> Result<Vec<String>> {
        let languages = if requested.is_empty() {
            self.inner.config.default_languages()
        } else {
            requested.to_vec()
        };
        if languages.is_empty() {
            return Err(Error::validation("no languages requested or configured"));
        }
        Ok(languages)
    }

    fn effective_quality(&self, requested: Option<&str>) -> QualityPreference {
        match requested {
            Some(hint) => QualityPreference::parse(hint),
            None => self.inner.config.default_quality(),
        }
    }

    fn enqueue(&self, task: Task, announce: bool) {
        let task_id = task.id.clone();
        debug!(task_id, name = %task.display_name, "Task queued");
        self.inner.store.insert(task);
        self.inner.queue.lock().push_back(task_id.clone());
        if announce {
            self.inner
                .bus
                .publish(ProgressEvent::task(task_id, Status::Queued));
        }
    }

    /// Admission rule: with M configured slots and A active tasks, start up
    /// to `M - A` queued tasks in FIFO order.
    ///
    /// The queue lock is held across the pop and the QUEUED→EXTRACTING
    /// transition so concurrent pumps cannot over-admit.
    fn pump(&self) {
        loop {
            let task_id = {
                let mut queue = self.inner.queue.lock();
                let mut next = None;
                while self.inner.store.active_count() < self.inner.config.parallel_downloads {
                    let Some(candidate) = queue.pop_front() else {
                        break;
                    };
                    // Cancelled-while-queued tasks are terminal; skip them.
                    if self
                        .inner
                        .store
                        .transition(&candidate, Status::Extracting)
                        .is_ok()
                    {
                        next = Some(candidate);
                        break;
                    }
                }
                next
            };
            let Some(task_id) = task_id else { break };

            let token = CancellationToken::new();
            self.inner.tokens.insert(task_id.clone(), token.clone());

            let scheduler = self.clone();
            tokio::spawn(async move {
                let worker = {
                    let scheduler = scheduler.clone();
                    let task_id = task_id.clone();
                    let token = token.clone();
                    tokio::spawn(async move {
                        scheduler
                            .inner
                            .orchestrator
                            .run_task(&task_id, token)
                            .await;
                    })
                };
                if let Err(join_error) = worker.await {
                    warn!(task_id, error = %join_error, "Orchestration worker died");
                    if scheduler
                        .inner
                        .store
                        .transition(&task_id, Status::Failed)
                        .is_ok()
                    {
                        scheduler.inner.store.with_task(&task_id, |t| {
                            t.error = Some(format!("orchestration panicked: {join_error}"));
                        });
                        scheduler.inner.bus.publish(
                            ProgressEvent::task(&task_id, Status::Failed)
                                .with_error("orchestration panicked"),
                        );
                    }
                }
                scheduler.inner.tokens.remove(&task_id);
                // A slot freed up; re-run admission.
                scheduler.pump();
            });
        }
    }

    /// Cancel a task from any non-terminal state. A no-op on terminal tasks.
    pub fn cancel(&self, task_id: &str) -> Result<()> {
        let Some(task) = self.inner.store.get(task_id) else {
            return Err(Error::not_found("task", task_id));
        };
        if task.status.is_terminal() {
            debug!(task_id, "Cancel on terminal task ignored");
            return Ok(());
        }

        self.inner.queue.lock().retain(|id| id != task_id);

        if self
            .inner
            .store
            .transition(task_id, Status::Cancelled)
            .is_ok()
        {
            self.inner.store.with_task(task_id, |t| {
                for lane in &mut t.sub_tasks {
                    if !lane.status.is_terminal() {
                        lane.status = Status::Cancelled;
                        lane.speed_bps = None;
                        lane.eta_seconds = None;
                    }
                }
            });
        }

        // Stop the pipelines, then make sure no process tree outlives them.
        if let Some((_, token)) = self.inner.tokens.remove(task_id) {
            token.cancel();
        }
        self.inner.transcoder.kill_task(task_id);

        self.inner
            .bus
            .publish(ProgressEvent::task(task_id, Status::Cancelled));
        info!(task_id, "Task cancelled");
        self.pump();
        Ok(())
    }

    pub fn list(&self) -> Vec<Task> {
        self.inner.store.list()
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.inner.store.get(task_id)
    }

    /// Remove every task in a terminal state.
    pub fn clear_completed(&self) -> usize {
        let removed = self.inner.store.clear_terminal();
        debug!(removed, "Cleared terminal tasks");
        removed
    }

    /// Number of queued (not yet started) tasks.
    pub fn queued_count(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// First line of the transcoder's version banner, absent when the
    /// configured binary cannot be executed.
    pub fn transcoder_version(&self) -> Option<String> {
        self.inner.transcoder.detect_version()
    }
}
