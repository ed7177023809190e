//! Task and sub-task data model.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use hlsio::QualityPreference;
use serde::{Deserialize, Serialize};

/// What kind of catalog entry a task downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Movie,
    Episode,
}

/// Reference to one piece of content in the external catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRef {
    pub kind: ContentKind,
    pub id: String,
    pub season: Option<u32>,
    pub episode: Option<u32>,
}

impl ContentRef {
    pub fn movie(id: impl Into<String>) -> Self {
        Self {
            kind: ContentKind::Movie,
            id: id.into(),
            season: None,
            episode: None,
        }
    }

    pub fn episode(id: impl Into<String>, season: u32, episode: u32) -> Self {
        Self {
            kind: ContentKind::Episode,
            id: id.into(),
            season: Some(season),
            episode: Some(episode),
        }
    }
}

/// Lifecycle state shared by tasks and sub-tasks.
///
/// `NotFound` is a sub-task-only terminal state: the requested language is
/// absent from the master playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Queued,
    Extracting,
    Downloading,
    Merging,
    Completed,
    Failed,
    Cancelled,
    NotFound,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::NotFound
        )
    }

    /// Active states count against the task pool.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Extracting | Self::Downloading | Self::Merging)
    }

    /// The task state machine. Everything not listed is rejected.
    pub fn can_transition_to(&self, next: Status) -> bool {
        match (self, next) {
            (Self::Queued, Self::Extracting) => true,
            (Self::Extracting, Self::Downloading) => true,
            (Self::Downloading, Self::Merging) => true,
            (Self::Merging, Self::Completed) => true,
            (Self::Extracting | Self::Downloading | Self::Merging, Self::Failed) => true,
            (from, Self::Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Extracting => "EXTRACTING",
            Self::Downloading => "DOWNLOADING",
            Self::Merging => "MERGING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::NotFound => "NOT_FOUND",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Track lane kind within a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrackKind {
    Video,
    Audio,
    Subtitle,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Subtitle => "subtitle",
        }
    }
}

/// One track lane of a task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubTask {
    pub id: String,
    pub task_id: String,
    pub kind: TrackKind,
    /// `None` for the video lane.
    pub language: Option<String>,
    /// Track name resolved from the master playlist.
    pub title: Option<String>,
    /// `WxH`, video lane only.
    pub resolution: Option<String>,
    pub status: Status,
    pub progress: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    /// Instantaneous bytes per second.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_bps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
    #[serde(skip)]
    pub temp_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubTask {
    pub fn new(task_id: &str, kind: TrackKind, language: Option<&str>) -> Self {
        let id = match language {
            Some(language) => format!("{task_id}:{}:{language}", kind.as_str()),
            None => format!("{task_id}:{}", kind.as_str()),
        };
        Self {
            id,
            task_id: task_id.to_string(),
            kind,
            language: language.map(str::to_string),
            title: None,
            resolution: None,
            status: Status::Queued,
            progress: 0.0,
            downloaded_bytes: 0,
            total_bytes: None,
            speed_bps: None,
            eta_seconds: None,
            temp_path: None,
            error: None,
        }
    }
}

/// A user-visible download unit.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub content: ContentRef,
    /// Human-readable name resolved from the catalog.
    pub display_name: String,
    /// Requested language codes; the first entry is the primary. Never empty.
    pub languages: Vec<String>,
    #[serde(skip)]
    pub quality: QualityPreference,
    pub output_path: PathBuf,
    pub status: Status,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub sub_tasks: Vec<SubTask>,
}

impl Task {
    pub fn new(
        id: String,
        content: ContentRef,
        display_name: String,
        languages: Vec<String>,
        quality: QualityPreference,
        output_path: PathBuf,
    ) -> Self {
        debug_assert!(!languages.is_empty());
        Self {
            id,
            content,
            display_name,
            languages,
            quality,
            output_path,
            status: Status::Queued,
            progress: 0.0,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            sub_tasks: Vec::new(),
        }
    }

    pub fn primary_language(&self) -> &str {
        &self.languages[0]
    }

    pub fn sub_task(&self, sub_task_id: &str) -> Option<&SubTask> {
        self.sub_tasks.iter().find(|s| s.id == sub_task_id)
    }

    pub fn sub_task_mut(&mut self, sub_task_id: &str) -> Option<&mut SubTask> {
        self.sub_tasks.iter_mut().find(|s| s.id == sub_task_id)
    }
}

/// Wire-shaped progress record published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_task_id: Option<String>,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloaded_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_speed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ProgressEvent {
    pub fn task(task_id: impl Into<String>, status: Status) -> Self {
        Self {
            task_id: task_id.into(),
            sub_task_id: None,
            status,
            progress: None,
            downloaded_bytes: None,
            total_bytes: None,
            download_speed: None,
            eta_seconds: None,
            bitrate: None,
            message: None,
            error_message: None,
        }
    }

    pub fn sub_task(
        task_id: impl Into<String>,
        sub_task_id: impl Into<String>,
        status: Status,
    ) -> Self {
        let mut event = Self::task(task_id, status);
        event.sub_task_id = Some(sub_task_id.into());
        event
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }

    /// True once the referenced lane or task has reached a final state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listed_transitions_are_accepted() {
        assert!(Status::Queued.can_transition_to(Status::Extracting));
        assert!(Status::Extracting.can_transition_to(Status::Downloading));
        assert!(Status::Downloading.can_transition_to(Status::Merging));
        assert!(Status::Merging.can_transition_to(Status::Completed));
        assert!(Status::Extracting.can_transition_to(Status::Failed));
        assert!(Status::Downloading.can_transition_to(Status::Failed));
        assert!(Status::Merging.can_transition_to(Status::Failed));
    }

    #[test]
    fn cancel_is_valid_from_any_non_terminal_state() {
        for from in [
            Status::Queued,
            Status::Extracting,
            Status::Downloading,
            Status::Merging,
        ] {
            assert!(from.can_transition_to(Status::Cancelled), "{from}");
        }
        for from in [
            Status::Completed,
            Status::Failed,
            Status::Cancelled,
            Status::NotFound,
        ] {
            assert!(!from.can_transition_to(Status::Cancelled), "{from}");
        }
    }

    #[test]
    fn unlisted_transitions_are_rejected() {
        assert!(!Status::Queued.can_transition_to(Status::Downloading));
        assert!(!Status::Queued.can_transition_to(Status::Failed));
        assert!(!Status::Downloading.can_transition_to(Status::Extracting));
        assert!(!Status::Completed.can_transition_to(Status::Queued));
        assert!(!Status::Failed.can_transition_to(Status::Extracting));
    }

    #[test]
    fn sub_task_ids_encode_the_lane() {
        let video = SubTask::new("t1", TrackKind::Video, None);
        let audio = SubTask::new("t1", TrackKind::Audio, Some("en"));
        assert_eq!(video.id, "t1:video");
        assert_eq!(audio.id, "t1:audio:en");
        assert_eq!(audio.language.as_deref(), Some("en"));
    }

    #[test]
    fn event_wire_shape_uses_camel_case_and_omits_absent_fields() {
        let event = ProgressEvent::sub_task("t1", "t1:video", Status::Downloading)
            .with_progress(42.5)
            .with_message("downloading");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["taskId"], "t1");
        assert_eq!(json["subTaskId"], "t1:video");
        assert_eq!(json["status"], "DOWNLOADING");
        assert_eq!(json["progress"], 42.5);
        assert!(json.get("errorMessage").is_none());
        assert!(json.get("downloadSpeed").is_none());
    }

    #[test]
    fn not_found_serializes_screaming_snake() {
        assert_eq!(
            serde_json::to_value(Status::NotFound).unwrap(),
            serde_json::json!("NOT_FOUND")
        );
    }
}
