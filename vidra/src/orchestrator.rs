//! Per-task orchestration: fan one task out into track pipelines, apply the
//! failure policy, mux the survivors and clean up.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use hlsio::HlsConfig;
use reqwest::Client;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::pipeline::{self, TrackContext, TrackOutcome};
use crate::progress::ProgressBus;
use crate::resolver::{PlaylistResolver, ResolvedPlaylist};
use crate::store::TaskStore;
use crate::task::{ProgressEvent, Status, SubTask, TrackKind};
use crate::transcoder::{MuxTrack, TranscoderRunner, mux_args};
use crate::{Error, Result};

/// Deletes the per-task scratch directory on every exit path, panics
/// included.
struct ScratchGuard {
    path: PathBuf,
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove task scratch");
            }
        }
    }
}

pub struct TrackOrchestrator {
    config: Arc<Config>,
    store: TaskStore,
    bus: Arc<ProgressBus>,
    resolver: Arc<dyn PlaylistResolver>,
    transcoder: Arc<TranscoderRunner>,
    client: Client,
    hls: Arc<HlsConfig>,
    /// Global bound on live track pipelines, across every task.
    track_limiter: Arc<Semaphore>,
}

impl TrackOrchestrator {
    pub fn new(
        config: Arc<Config>,
        store: TaskStore,
        bus: Arc<ProgressBus>,
        resolver: Arc<dyn PlaylistResolver>,
        transcoder: Arc<TranscoderRunner>,
        client: Client,
    ) -> Self {
        let hls = Arc::new(config.hls_config());
        let track_limiter = Arc::new(Semaphore::new(config.max_track_concurrency.max(1)));
        Self {
            config,
            store,
            bus,
            resolver,
            transcoder,
            client,
            hls,
            track_limiter,
        }
    }

    /// Drive one admitted task to a terminal state. Never panics outward.
    pub async fn run_task(&self, task_id: &str, token: CancellationToken) {
        if let Err(e) = self.execute(task_id, &token).await {
            if e.is_cancellation() || token.is_cancelled() {
                self.finish_cancelled(task_id);
            } else {
                self.fail_task(task_id, &e.to_string());
            }
        }
    }

    async fn execute(&self, task_id: &str, token: &CancellationToken) -> Result<()> {
        let Some(task) = self.store.get(task_id) else {
            error!(task_id, "Orchestration requested for unknown task");
            return Ok(());
        };

        self.bus
            .publish(ProgressEvent::task(task_id, Status::Extracting));

        let scratch_path = self.config.temp_path.join(task_id);
        tokio::fs::create_dir_all(&scratch_path).await?;
        let _scratch = ScratchGuard {
            path: scratch_path.clone(),
        };

        let resolved = self.resolve(&task.content, task.primary_language()).await?;
        debug!(task_id, master = %resolved.master_playlist_url, "Resolved master playlist");

        // Fan-out: one video lane, one audio and one subtitle lane per
        // requested language.
        let mut lanes = vec![SubTask::new(task_id, TrackKind::Video, None)];
        for language in &task.languages {
            lanes.push(SubTask::new(task_id, TrackKind::Audio, Some(language.as_str())));
            lanes.push(SubTask::new(task_id, TrackKind::Subtitle, Some(language.as_str())));
        }
        let lane_ids: Vec<String> = lanes.iter().map(|s| s.id.clone()).collect();
        let lane_summary = format!(
            "1 video, {} audio, {} subtitle lanes",
            task.languages.len(),
            task.languages.len()
        );
        self.store.with_task(task_id, |t| t.sub_tasks = lanes);
        self.bus.publish(
            ProgressEvent::task(task_id, Status::Extracting).with_message(lane_summary),
        );
        for lane_id in &lane_ids {
            self.bus
                .publish(ProgressEvent::sub_task(task_id, lane_id, Status::Queued));
        }

        if self.store.transition(task_id, Status::Downloading).is_err() {
            return Err(Error::Cancelled);
        }
        self.bus
            .publish(ProgressEvent::task(task_id, Status::Downloading).with_progress(0.0));

        let outcomes = self
            .download_lanes(task_id, &lane_ids, &resolved, &scratch_path, token)
            .await?;

        self.apply_failure_policy(task_id, &outcomes, token)?;

        self.mux(task_id, &task.output_path, &scratch_path, token).await?;

        self.finish_completed(task_id);
        Ok(())
    }

    async fn resolve(
        &self,
        content: &crate::task::ContentRef,
        language: &str,
    ) -> Result<ResolvedPlaylist> {
        let lookup = self.resolver.resolve(content, language);
        let resolved = match self.config.resolver_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, lookup)
                .await
                .map_err(|_| Error::resolver("playlist resolver timed out"))??,
            None => lookup.await?,
        };
        resolved.ok_or_else(|| {
            Error::resolver(format!(
                "content {} not available in language {language}",
                content.id
            ))
        })
    }

    /// Run every lane on the shared track pool and wait for all of them,
    /// bounded by the per-task wall clock.
    async fn download_lanes(
        &self,
        task_id: &str,
        lane_ids: &[String],
        resolved: &ResolvedPlaylist,
        scratch_path: &std::path::Path,
        token: &CancellationToken,
    ) -> Result<HashMap<String, TrackOutcome>> {
        let lane_token = token.child_token();
        let ctx = Arc::new(TrackContext {
            store: self.store.clone(),
            bus: Arc::clone(&self.bus),
            client: self.client.clone(),
            hls: Arc::clone(&self.hls),
            transcoder: Arc::clone(&self.transcoder),
            scratch_dir: scratch_path.to_path_buf(),
            referer: resolved.referer_url.clone(),
            master_url: resolved.master_playlist_url.clone(),
            token: lane_token.clone(),
        });

        let video_lane_id = format!("{task_id}:video");
        let mut join_set: JoinSet<(String, TrackOutcome)> = JoinSet::new();
        for lane_id in lane_ids {
            let ctx = Arc::clone(&ctx);
            let limiter = Arc::clone(&self.track_limiter);
            let task_id = task_id.to_string();
            let lane_id = lane_id.clone();
            join_set.spawn(async move {
                let _permit = limiter.acquire_owned().await.ok();
                // Panics stay inside the lane and surface as a failure.
                let outcome = std::panic::AssertUnwindSafe(pipeline::run_track(
                    &ctx, &task_id, &lane_id,
                ))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    TrackOutcome::Failed("track worker panicked".to_string())
                });
                (lane_id, outcome)
            });
        }

        let deadline = tokio::time::sleep(self.config.task_timeout());
        tokio::pin!(deadline);

        let mut outcomes = HashMap::new();
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    warn!(task_id, "Task exceeded its wall-clock budget");
                    lane_token.cancel();
                    join_set.shutdown().await;
                    return Err(Error::Timeout(format!(
                        "sub-tasks did not finish within {:?}",
                        self.config.task_timeout()
                    )));
                }
                joined = join_set.join_next() => {
                    match joined {
                        None => break,
                        Some(Ok((lane_id, outcome))) => {
                            // A dead video lane makes the task unsalvageable;
                            // stop the remaining lanes right away.
                            if lane_id == video_lane_id
                                && matches!(outcome, TrackOutcome::Failed(_))
                            {
                                lane_token.cancel();
                            }
                            outcomes.insert(lane_id, outcome);
                        }
                        Some(Err(join_error)) => {
                            error!(task_id, error = %join_error, "Track lane join failed");
                        }
                    }
                }
            }
        }

        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(outcomes)
    }

    /// Failure policy: video is load-bearing, audio is load-bearing as a
    /// set, subtitles never are.
    fn apply_failure_policy(
        &self,
        task_id: &str,
        outcomes: &HashMap<String, TrackOutcome>,
        token: &CancellationToken,
    ) -> Result<()> {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let video_lane_id = format!("{task_id}:video");
        match outcomes.get(&video_lane_id) {
            Some(TrackOutcome::Completed) => {}
            Some(TrackOutcome::Cancelled) => return Err(Error::Cancelled),
            _ => return Err(Error::Other("Video track failed to download".to_string())),
        }

        let audio_prefix = format!("{task_id}:audio:");
        let audio: Vec<&TrackOutcome> = outcomes
            .iter()
            .filter(|(id, _)| id.starts_with(&audio_prefix))
            .map(|(_, outcome)| outcome)
            .collect();
        let any_completed = audio.iter().any(|o| **o == TrackOutcome::Completed);
        let any_failed = audio
            .iter()
            .any(|o| matches!(o, TrackOutcome::Failed(_)));
        if any_failed && !any_completed {
            return Err(Error::Other(
                "no audio tracks downloaded successfully".to_string(),
            ));
        }

        let subtitle_prefix = format!("{task_id}:subtitle:");
        for (lane_id, outcome) in outcomes {
            if lane_id.starts_with(&subtitle_prefix)
                && let TrackOutcome::Failed(reason) = outcome
            {
                warn!(task_id, lane_id, reason, "Subtitle lane failed, continuing");
            }
        }

        Ok(())
    }

    /// Mux the completed lanes into the output container, or copy the video
    /// straight through when nothing else survived.
    async fn mux(
        &self,
        task_id: &str,
        output_path: &std::path::Path,
        scratch_path: &std::path::Path,
        token: &CancellationToken,
    ) -> Result<()> {
        if self.store.transition(task_id, Status::Merging).is_err() {
            return Err(Error::Cancelled);
        }
        self.store.with_task(task_id, |t| t.progress = 0.0);
        self.bus
            .publish(ProgressEvent::task(task_id, Status::Merging).with_progress(0.0));

        let video_path = scratch_path.join("video.mp4");
        let (audio, subtitles) = self.completed_mux_tracks(task_id);

        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if audio.is_empty() && subtitles.is_empty() {
            // Nothing separate to merge; the video keeps its embedded audio.
            tokio::fs::copy(&video_path, output_path).await?;
            return Ok(());
        }

        let args = mux_args(&video_path, &audio, &subtitles, output_path);
        let bus = Arc::clone(&self.bus);
        let store = self.store.clone();
        let task_id_owned = task_id.to_string();
        self.transcoder
            .run(task_id, args, token.clone(), move |sample| {
                if let Some(percent) = sample.percent {
                    store.with_task(&task_id_owned, |t| t.progress = percent);
                }
                let mut event = ProgressEvent::task(&task_id_owned, Status::Merging);
                event.progress = sample.percent;
                event.bitrate = sample.bitrate.clone();
                bus.publish(event);
            })
            .await
            .map_err(|e| match e {
                Error::Cancelled => Error::Cancelled,
                other => Error::transcoder(format!("mux failed: {other}")),
            })?;

        Ok(())
    }

    /// Completed audio and subtitle artifacts, in requested-language order.
    fn completed_mux_tracks(&self, task_id: &str) -> (Vec<MuxTrack>, Vec<MuxTrack>) {
        let mut audio = Vec::new();
        let mut subtitles = Vec::new();
        let Some(task) = self.store.get(task_id) else {
            return (audio, subtitles);
        };
        for lane in &task.sub_tasks {
            if lane.status != Status::Completed {
                continue;
            }
            let (Some(path), Some(language)) = (&lane.temp_path, &lane.language) else {
                continue;
            };
            let track = MuxTrack {
                path: path.clone(),
                language: language.clone(),
                title: lane.title.clone(),
            };
            match lane.kind {
                TrackKind::Audio => audio.push(track),
                TrackKind::Subtitle => subtitles.push(track),
                TrackKind::Video => {}
            }
        }
        (audio, subtitles)
    }

    fn finish_completed(&self, task_id: &str) {
        if self.store.transition(task_id, Status::Completed).is_err() {
            return;
        }
        let skipped = self.store.with_task(task_id, |t| {
            t.progress = 100.0;
            t.error = None;
            t.sub_tasks
                .iter()
                .filter(|s| matches!(s.status, Status::Failed | Status::NotFound))
                .map(|s| format!("{} ({})", s.id, s.status))
                .collect::<Vec<_>>()
        });

        let mut event = ProgressEvent::task(task_id, Status::Completed).with_progress(100.0);
        if let Some(skipped) = skipped.filter(|s| !s.is_empty()) {
            event.message = Some(format!("Skipped lanes: {}", skipped.join(", ")));
        }
        self.bus.publish(event);
        info!(task_id, "Task completed");
    }

    fn fail_task(&self, task_id: &str, reason: &str) {
        if self.store.transition(task_id, Status::Failed).is_err() {
            return;
        }
        self.store.with_task(task_id, |t| {
            t.error = Some(reason.to_string());
        });
        self.bus
            .publish(ProgressEvent::task(task_id, Status::Failed).with_error(reason));
        warn!(task_id, reason, "Task failed");
    }

    /// The cancel entry point already moved the task to CANCELLED and
    /// published the terminal event; this only covers races where the
    /// orchestrator noticed first.
    fn finish_cancelled(&self, task_id: &str) {
        if self.store.transition(task_id, Status::Cancelled).is_ok() {
            self.bus
                .publish(ProgressEvent::task(task_id, Status::Cancelled));
            info!(task_id, "Task cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::StaticResolver;
    use crate::task::Task;
    use hlsio::QualityPreference;

    fn orchestrator(temp: &std::path::Path) -> TrackOrchestrator {
        let config = Arc::new(Config {
            download_base_path: temp.join("out"),
            temp_path: temp.join("tmp"),
            ..Config::default()
        });
        let transcoder = Arc::new(TranscoderRunner::new(
            "ffmpeg",
            std::time::Duration::from_secs(60),
        ));
        TrackOrchestrator::new(
            config,
            TaskStore::new(),
            Arc::new(ProgressBus::default()),
            Arc::new(StaticResolver::new()),
            transcoder,
            Client::new(),
        )
    }

    fn outcomes(entries: &[(&str, TrackOutcome)]) -> HashMap<String, TrackOutcome> {
        entries
            .iter()
            .map(|(id, outcome)| (id.to_string(), outcome.clone()))
            .collect()
    }

    fn failed() -> TrackOutcome {
        TrackOutcome::Failed("500 internal".to_string())
    }

    #[tokio::test]
    async fn failed_video_fails_the_task() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path());
        let token = CancellationToken::new();
        let outcomes = outcomes(&[
            ("t1:video", failed()),
            ("t1:audio:en", TrackOutcome::Completed),
        ]);

        let err = orchestrator
            .apply_failure_policy("t1", &outcomes, &token)
            .unwrap_err();
        assert_eq!(err.to_string(), "Video track failed to download");
    }

    #[tokio::test]
    async fn all_audio_failed_fails_the_task() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path());
        let token = CancellationToken::new();
        let outcomes = outcomes(&[
            ("t1:video", TrackOutcome::Completed),
            ("t1:audio:en", failed()),
            ("t1:audio:it", failed()),
        ]);

        let err = orchestrator
            .apply_failure_policy("t1", &outcomes, &token)
            .unwrap_err();
        assert_eq!(err.to_string(), "no audio tracks downloaded successfully");
    }

    #[tokio::test]
    async fn all_audio_absent_proceeds_to_mux() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path());
        let token = CancellationToken::new();
        let outcomes = outcomes(&[
            ("t1:video", TrackOutcome::Completed),
            ("t1:audio:en", TrackOutcome::Absent),
            ("t1:audio:it", TrackOutcome::Absent),
        ]);

        assert!(
            orchestrator
                .apply_failure_policy("t1", &outcomes, &token)
                .is_ok()
        );
    }

    #[tokio::test]
    async fn partial_audio_failure_proceeds() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path());
        let token = CancellationToken::new();
        let outcomes = outcomes(&[
            ("t1:video", TrackOutcome::Completed),
            ("t1:audio:en", TrackOutcome::Completed),
            ("t1:audio:it", failed()),
        ]);

        assert!(
            orchestrator
                .apply_failure_policy("t1", &outcomes, &token)
                .is_ok()
        );
    }

    #[tokio::test]
    async fn subtitle_failures_are_never_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path());
        let token = CancellationToken::new();
        let outcomes = outcomes(&[
            ("t1:video", TrackOutcome::Completed),
            ("t1:audio:en", TrackOutcome::Completed),
            ("t1:subtitle:en", failed()),
            ("t1:subtitle:it", TrackOutcome::Absent),
        ]);

        assert!(
            orchestrator
                .apply_failure_policy("t1", &outcomes, &token)
                .is_ok()
        );
    }

    #[tokio::test]
    async fn cancellation_overrides_the_policy() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path());
        let token = CancellationToken::new();
        token.cancel();
        let outcomes = outcomes(&[("t1:video", TrackOutcome::Completed)]);

        let err = orchestrator
            .apply_failure_policy("t1", &outcomes, &token)
            .unwrap_err();
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn mux_tracks_keep_requested_language_order() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path());

        let mut task = Task::new(
            "t1".to_string(),
            crate::task::ContentRef::movie("m1"),
            "Movie".to_string(),
            vec!["en".to_string(), "it".to_string()],
            QualityPreference::Best,
            dir.path().join("out.mp4"),
        );
        let mut lanes = vec![SubTask::new("t1", TrackKind::Video, None)];
        for language in ["en", "it"] {
            lanes.push(SubTask::new("t1", TrackKind::Audio, Some(language)));
            lanes.push(SubTask::new("t1", TrackKind::Subtitle, Some(language)));
        }
        for lane in &mut lanes {
            lane.status = Status::Completed;
            lane.temp_path = Some(dir.path().join(format!("{}.bin", lane.id)));
        }
        // The Italian subtitle never made it.
        lanes
            .iter_mut()
            .find(|l| l.id == "t1:subtitle:it")
            .unwrap()
            .status = Status::NotFound;
        task.sub_tasks = lanes;
        orchestrator.store.insert(task);

        let (audio, subtitles) = orchestrator.completed_mux_tracks("t1");
        let audio_languages: Vec<&str> = audio.iter().map(|t| t.language.as_str()).collect();
        assert_eq!(audio_languages, vec!["en", "it"]);
        let subtitle_languages: Vec<&str> =
            subtitles.iter().map(|t| t.language.as_str()).collect();
        assert_eq!(subtitle_languages, vec!["en"]);
    }
}
