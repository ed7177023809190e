//! Shared, serialized task state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::warn;

use crate::task::{Status, SubTask, Task};
use crate::{Error, Result};

/// All task state behind one lock; observers only ever get clones.
#[derive(Clone, Default)]
pub struct TaskStore {
    inner: Arc<Mutex<HashMap<String, Task>>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task: Task) {
        self.inner.lock().insert(task.id.clone(), task);
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.inner.lock().get(id).cloned()
    }

    /// Snapshot of every task, oldest first.
    pub fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.inner.lock().values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    /// Tasks currently counting against the task pool.
    pub fn active_count(&self) -> usize {
        self.inner
            .lock()
            .values()
            .filter(|t| t.status.is_active())
            .count()
    }

    pub fn with_task<R>(&self, id: &str, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
        self.inner.lock().get_mut(id).map(f)
    }

    pub fn with_sub_task<R>(
        &self,
        task_id: &str,
        sub_task_id: &str,
        f: impl FnOnce(&mut SubTask) -> R,
    ) -> Option<R> {
        self.inner
            .lock()
            .get_mut(task_id)
            .and_then(|task| task.sub_task_mut(sub_task_id))
            .map(f)
    }

    /// Apply a validated state transition.
    ///
    /// Illegal transitions are logged, leave the task untouched, and come
    /// back as [`Error::InvalidStateTransition`].
    pub fn transition(&self, id: &str, next: Status) -> Result<()> {
        let mut tasks = self.inner.lock();
        let Some(task) = tasks.get_mut(id) else {
            warn!(task_id = id, "Transition requested for unknown task");
            return Err(Error::not_found("task", id));
        };
        if !task.status.can_transition_to(next) {
            warn!(
                task_id = id,
                from = %task.status,
                to = %next,
                "Rejected invalid state transition"
            );
            return Err(Error::InvalidStateTransition {
                from: task.status.to_string(),
                to: next.to_string(),
            });
        }
        task.status = next;
        match next {
            Status::Extracting => task.started_at = Some(Utc::now()),
            _ if next.is_terminal() => task.completed_at = Some(Utc::now()),
            _ => {}
        }
        Ok(())
    }

    /// Drop every task in a terminal state; returns how many went away.
    pub fn clear_terminal(&self) -> usize {
        let mut tasks = self.inner.lock();
        let before = tasks.len();
        tasks.retain(|_, task| !task.status.is_terminal());
        before - tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ContentRef, TrackKind};
    use hlsio::QualityPreference;
    use std::path::PathBuf;

    fn task(id: &str) -> Task {
        Task::new(
            id.to_string(),
            ContentRef::movie("m1"),
            "Movie".to_string(),
            vec!["en".to_string()],
            QualityPreference::Best,
            PathBuf::from("/out/Movie.mp4"),
        )
    }

    #[test]
    fn transition_follows_the_state_machine() {
        let store = TaskStore::new();
        store.insert(task("t1"));

        assert!(store.transition("t1", Status::Extracting).is_ok());
        assert!(store.transition("t1", Status::Downloading).is_ok());
        // Skipping MERGING straight to COMPLETED is not listed.
        let err = store.transition("t1", Status::Completed).unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
        assert_eq!(
            err.to_string(),
            "Invalid state transition: cannot transition from DOWNLOADING to COMPLETED"
        );
        assert_eq!(store.get("t1").unwrap().status, Status::Downloading);

        assert!(store.transition("t1", Status::Merging).is_ok());
        assert!(store.transition("t1", Status::Completed).is_ok());
        assert!(store.get("t1").unwrap().completed_at.is_some());
        // Terminal states are sticky.
        assert!(store.transition("t1", Status::Cancelled).is_err());
    }

    #[test]
    fn transition_on_unknown_task_is_not_found() {
        let store = TaskStore::new();
        let err = store.transition("ghost", Status::Extracting).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn transition_stamps_started_at() {
        let store = TaskStore::new();
        store.insert(task("t1"));
        assert!(store.get("t1").unwrap().started_at.is_none());
        store.transition("t1", Status::Extracting).unwrap();
        assert!(store.get("t1").unwrap().started_at.is_some());
    }

    #[test]
    fn active_count_tracks_active_statuses() {
        let store = TaskStore::new();
        for id in ["a", "b", "c"] {
            store.insert(task(id));
        }
        assert_eq!(store.active_count(), 0);
        store.transition("a", Status::Extracting).unwrap();
        store.transition("b", Status::Extracting).unwrap();
        store.transition("b", Status::Downloading).unwrap();
        assert_eq!(store.active_count(), 2);
    }

    #[test]
    fn clear_terminal_removes_only_finished_tasks() {
        let store = TaskStore::new();
        for id in ["a", "b"] {
            store.insert(task(id));
        }
        store.transition("a", Status::Cancelled).unwrap();
        assert_eq!(store.clear_terminal(), 1);
        assert!(store.get("a").is_none());
        assert!(store.get("b").is_some());
    }

    #[test]
    fn sub_task_updates_reach_the_stored_task() {
        let store = TaskStore::new();
        let mut t = task("t1");
        t.sub_tasks.push(SubTask::new("t1", TrackKind::Video, None));
        store.insert(t);

        store.with_sub_task("t1", "t1:video", |s| {
            s.progress = 55.0;
        });
        assert_eq!(
            store.get("t1").unwrap().sub_task("t1:video").unwrap().progress,
            55.0
        );
    }
}
