//! Per-track download pipeline: parse, select, fetch, convert.

pub mod webvtt;

use std::path::PathBuf;
use std::sync::Arc;

use hlsio::{
    FetchProgress, HlsConfig, HlsPlaylist, PlaylistFetcher, ProgressFn, QualityPreference,
    SegmentFetcher, fetch_cipher, select_audio, select_subtitle, select_variant,
};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::progress::{ProgressBus, aggregate, format_speed};
use crate::store::TaskStore;
use crate::task::{ProgressEvent, Status, TrackKind};
use crate::transcoder::{TranscoderRunner, audio_convert_args, video_convert_args};
use crate::{Error, Result};

/// Typed result of one track lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackOutcome {
    Completed,
    /// The requested language is absent from the master playlist.
    Absent,
    Failed(String),
    Cancelled,
}

/// Everything one lane needs; shared across a task's pipelines.
pub struct TrackContext {
    pub store: TaskStore,
    pub bus: Arc<ProgressBus>,
    pub client: Client,
    pub hls: Arc<HlsConfig>,
    pub transcoder: Arc<TranscoderRunner>,
    pub scratch_dir: PathBuf,
    pub referer: String,
    pub master_url: Url,
    pub token: CancellationToken,
}

/// Scratch file stem for a lane: `video`, `audio_en`, `subtitle_en`.
pub fn artifact_stem(kind: TrackKind, language: Option<&str>) -> String {
    match (kind, language) {
        (TrackKind::Video, _) => "video".to_string(),
        (kind, Some(language)) => format!("{}_{language}", kind.as_str()),
        (kind, None) => kind.as_str().to_string(),
    }
}

/// Final container extension per lane kind.
pub fn artifact_extension(kind: TrackKind) -> &'static str {
    match kind {
        TrackKind::Video => "mp4",
        TrackKind::Audio => "m4a",
        TrackKind::Subtitle => "vtt",
    }
}

/// Run one lane to its terminal state and report the outcome.
pub async fn run_track(ctx: &TrackContext, task_id: &str, sub_task_id: &str) -> TrackOutcome {
    let Some((kind, language)) = ctx
        .store
        .with_sub_task(task_id, sub_task_id, |s| (s.kind, s.language.clone()))
    else {
        return TrackOutcome::Failed(format!("unknown sub-task {sub_task_id}"));
    };
    let quality = ctx
        .store
        .get(task_id)
        .map(|t| t.quality.clone())
        .unwrap_or_default();

    set_lane_state(ctx, task_id, sub_task_id, Status::Extracting, None, None);

    match drive(ctx, task_id, sub_task_id, kind, language.as_deref(), &quality).await {
        Ok(Some(artifact_bytes)) => {
            ctx.store.with_sub_task(task_id, sub_task_id, |s| {
                s.progress = 100.0;
                s.downloaded_bytes = artifact_bytes;
                s.total_bytes = Some(artifact_bytes);
                s.speed_bps = None;
                s.eta_seconds = None;
            });
            set_lane_state(ctx, task_id, sub_task_id, Status::Completed, None, None);
            info!(task_id, sub_task_id, bytes = artifact_bytes, "Track completed");
            TrackOutcome::Completed
        }
        Ok(None) => {
            let message = language
                .map(|l| format!("Track not available for language {l}"))
                .unwrap_or_else(|| "Track not available".to_string());
            set_lane_state(
                ctx,
                task_id,
                sub_task_id,
                Status::NotFound,
                Some(message),
                None,
            );
            TrackOutcome::Absent
        }
        Err(e) if e.is_cancellation() || ctx.token.is_cancelled() => {
            set_lane_state(ctx, task_id, sub_task_id, Status::Cancelled, None, None);
            TrackOutcome::Cancelled
        }
        Err(e) => {
            let reason = e.to_string();
            warn!(task_id, sub_task_id, error = %reason, "Track failed");
            set_lane_state(
                ctx,
                task_id,
                sub_task_id,
                Status::Failed,
                None,
                Some(reason.clone()),
            );
            TrackOutcome::Failed(reason)
        }
    }
}

async fn drive(
    ctx: &TrackContext,
    task_id: &str,
    sub_task_id: &str,
    kind: TrackKind,
    language: Option<&str>,
    quality: &QualityPreference,
) -> Result<Option<u64>> {
    let playlist_fetcher = PlaylistFetcher::new(ctx.client.clone(), ctx.hls.playlist.clone());
    let HlsPlaylist::Master(master) = playlist_fetcher.fetch(&ctx.master_url, &ctx.referer).await?
    else {
        return Err(Error::Hls(hlsio::HlsError::playlist(format!(
            "{} is not a master playlist",
            ctx.master_url
        ))));
    };

    let (media_url, title, resolution) = match kind {
        TrackKind::Video => {
            let variant = select_variant(&master.variants, quality).ok_or_else(|| {
                Error::Hls(hlsio::HlsError::playlist(
                    "master playlist advertises no video variants",
                ))
            })?;
            (variant.url.clone(), None, variant.resolution.clone())
        }
        TrackKind::Audio => {
            let language = language
                .ok_or_else(|| Error::validation("audio lane without a language"))?;
            match select_audio(&master, language) {
                Some(rendition) => (rendition.url.clone(), Some(rendition.name.clone()), None),
                None => return Ok(None),
            }
        }
        TrackKind::Subtitle => {
            let language = language
                .ok_or_else(|| Error::validation("subtitle lane without a language"))?;
            match select_subtitle(&master, language) {
                Some(rendition) => (rendition.url.clone(), Some(rendition.name.clone()), None),
                None => return Ok(None),
            }
        }
    };

    ctx.store.with_sub_task(task_id, sub_task_id, |s| {
        s.title = title;
        s.resolution = resolution;
    });

    let HlsPlaylist::Media(media) = playlist_fetcher.fetch(&media_url, &ctx.referer).await? else {
        return Err(Error::Hls(hlsio::HlsError::playlist(format!(
            "{media_url} is not a media playlist"
        ))));
    };

    let cipher = match &media.encryption {
        Some(encryption) => Some(
            fetch_cipher(
                &ctx.client,
                &ctx.hls.fetcher,
                encryption,
                &ctx.referer,
                &ctx.token,
            )
            .await?,
        ),
        None => None,
    };

    set_lane_state(ctx, task_id, sub_task_id, Status::Downloading, None, None);

    let stem = artifact_stem(kind, language);
    let ts_path = ctx.scratch_dir.join(format!("{stem}.ts"));
    let segment_fetcher = SegmentFetcher::new(
        ctx.client.clone(),
        ctx.hls.fetcher.clone(),
        ctx.token.clone(),
    );
    let on_progress: ProgressFn = {
        let store = ctx.store.clone();
        let bus = Arc::clone(&ctx.bus);
        let task_id = task_id.to_string();
        let sub_task_id = sub_task_id.to_string();
        Arc::new(move |p: FetchProgress| {
            record_fetch_tick(&store, &bus, &task_id, &sub_task_id, &p);
        })
    };
    segment_fetcher
        .download(
            &media.segments,
            &ctx.referer,
            cipher,
            &ts_path,
            Some(on_progress),
        )
        .await?;

    // Segment phase done; announce the conversion step at 100%.
    let extension = artifact_extension(kind);
    ctx.store
        .with_sub_task(task_id, sub_task_id, |s| s.progress = 100.0);
    ctx.bus.publish(
        ProgressEvent::sub_task(task_id, sub_task_id, Status::Downloading)
            .with_progress(100.0)
            .with_message(format!("Converting to {extension}")),
    );

    let artifact = ctx.scratch_dir.join(format!("{stem}.{extension}"));
    // Lane ids are already `taskId:lane`, the registry key convention.
    match kind {
        TrackKind::Video => {
            ctx.transcoder
                .run(
                    sub_task_id,
                    video_convert_args(&ts_path, &artifact),
                    ctx.token.clone(),
                    |_| {},
                )
                .await?;
        }
        TrackKind::Audio => {
            ctx.transcoder
                .run(
                    sub_task_id,
                    audio_convert_args(&ts_path, &artifact),
                    ctx.token.clone(),
                    |_| {},
                )
                .await?;
        }
        TrackKind::Subtitle => {
            webvtt::convert_file(&ts_path, &artifact).await?;
        }
    }

    let artifact_bytes = tokio::fs::metadata(&artifact).await?.len();
    if let Err(e) = tokio::fs::remove_file(&ts_path).await {
        debug!(path = %ts_path.display(), error = %e, "Could not remove intermediate stream");
    }
    ctx.store.with_sub_task(task_id, sub_task_id, |s| {
        s.temp_path = Some(artifact.clone());
    });

    Ok(Some(artifact_bytes))
}

/// Update one lane's status and publish the matching event.
fn set_lane_state(
    ctx: &TrackContext,
    task_id: &str,
    sub_task_id: &str,
    status: Status,
    message: Option<String>,
    error: Option<String>,
) {
    ctx.store.with_sub_task(task_id, sub_task_id, |s| {
        s.status = status;
        if status.is_terminal() {
            s.speed_bps = None;
            s.eta_seconds = None;
        }
        if let Some(error) = &error {
            s.error = Some(error.clone());
        }
    });

    let mut event = ProgressEvent::sub_task(task_id, sub_task_id, status);
    event.message = message;
    event.error_message = error;
    if status == Status::Completed {
        event.progress = Some(100.0);
    }
    ctx.bus.publish(event);
}

/// Fold one fetch tick into the lane and the task aggregate.
fn record_fetch_tick(
    store: &TaskStore,
    bus: &ProgressBus,
    task_id: &str,
    sub_task_id: &str,
    p: &FetchProgress,
) {
    store.with_sub_task(task_id, sub_task_id, |s| {
        s.progress = p.percent;
        s.downloaded_bytes = p.downloaded_bytes;
        s.total_bytes = (p.estimated_total_bytes > 0).then_some(p.estimated_total_bytes);
        s.speed_bps = Some(p.bytes_per_second);
        s.eta_seconds = p.eta_seconds;
    });

    let mut lane_event = ProgressEvent::sub_task(task_id, sub_task_id, Status::Downloading)
        .with_progress(p.percent);
    lane_event.downloaded_bytes = Some(p.downloaded_bytes);
    lane_event.total_bytes = (p.estimated_total_bytes > 0).then_some(p.estimated_total_bytes);
    lane_event.download_speed = Some(format_speed(p.bytes_per_second));
    lane_event.eta_seconds = p.eta_seconds;
    bus.publish(lane_event);

    let task_aggregate = store.with_task(task_id, |t| {
        let agg = aggregate(&t.sub_tasks);
        t.progress = agg.progress;
        agg
    });
    if let Some(agg) = task_aggregate {
        let mut task_event =
            ProgressEvent::task(task_id, Status::Downloading).with_progress(agg.progress);
        task_event.downloaded_bytes = Some(agg.downloaded_bytes);
        task_event.total_bytes = agg.total_bytes;
        task_event.download_speed = Some(format_speed(agg.speed_bps));
        task_event.eta_seconds = agg.eta_seconds;
        bus.publish(task_event);
    }
}
