use std::time::Duration;

use futures::Stream;
use serde::{Deserialize, Serialize};

use waypoint_core::generation::GenerationStatus;
use waypoint_core::ids::TaskId;
use waypoint_store::tasks::TaskRepo;
use waypoint_store::StoreError;

/// Snapshot of a polled job, in the shape clients consume directly.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PollEvent {
    /// Work still running; data is always empty.
    Generating(Vec<serde_json::Value>),
    /// Terminal: the generated stories.
    Success(Vec<serde_json::Value>),
}

impl PollEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Current poll snapshot for a task. `generating` until the ledger says
/// done, then `success` with whatever stories were stored (possibly none,
/// when the generation run failed).
pub fn task_snapshot(tasks: &TaskRepo, id: &TaskId) -> Result<PollEvent, StoreError> {
    let task = tasks.get(id)?;
    match task.generation_status {
        GenerationStatus::Done => {
            let stories = task
                .stories
                .and_then(|v| v.as_array().cloned())
                .unwrap_or_default();
            Ok(PollEvent::Success(stories))
        }
        GenerationStatus::NotStarted | GenerationStatus::Generating => {
            Ok(PollEvent::Generating(Vec::new()))
        }
    }
}

/// Fixed-interval pull poller. Stateless between ticks: each tick calls the
/// snapshot function fresh, so any number of watchers can poll one entity.
/// The stream ends after the first terminal event (or the first error).
pub struct PollWatcher {
    interval: Duration,
}

impl PollWatcher {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn watch<F>(&self, snapshot: F) -> impl Stream<Item = Result<PollEvent, StoreError>>
    where
        F: Fn() -> Result<PollEvent, StoreError> + Send + 'static,
    {
        let interval = self.interval;
        futures::stream::unfold(
            (snapshot, false, true),
            move |(snapshot, done, first)| async move {
                if done {
                    return None;
                }
                if !first {
                    tokio::time::sleep(interval).await;
                }
                let event = snapshot();
                let terminal = match &event {
                    Ok(event) => event.is_terminal(),
                    Err(_) => true,
                };
                Some((event, (snapshot, terminal, false)))
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use waypoint_store::projects::ProjectRepo;
    use waypoint_store::Database;

    #[test]
    fn poll_event_wire_shape() {
        let generating = serde_json::to_value(PollEvent::Generating(Vec::new())).unwrap();
        assert_eq!(generating, json!({"type": "generating", "data": []}));

        let success =
            serde_json::to_value(PollEvent::Success(vec![json!({"title": "a"})])).unwrap();
        assert_eq!(success, json!({"type": "success", "data": [{"title": "a"}]}));
    }

    #[test]
    fn snapshot_transitions_with_ledger() {
        let db = Database::in_memory().unwrap();
        let project = ProjectRepo::new(db.clone()).get_or_create("acme").unwrap();
        let tasks = TaskRepo::new(db);
        let task = tasks.create(&project.id, "Checkout flow").unwrap();

        assert_eq!(
            task_snapshot(&tasks, &task.id).unwrap(),
            PollEvent::Generating(Vec::new())
        );

        tasks.begin_generation(&task.id).unwrap();
        assert_eq!(
            task_snapshot(&tasks, &task.id).unwrap(),
            PollEvent::Generating(Vec::new())
        );

        let stories = json!([{"title": "As a shopper I can pay"}]);
        tasks.finish_generation(&task.id, Some(&stories)).unwrap();
        let PollEvent::Success(data) = task_snapshot(&tasks, &task.id).unwrap() else {
            panic!("expected success");
        };
        assert_eq!(data.len(), 1);
    }

    #[test]
    fn snapshot_done_without_stories_is_empty_success() {
        let db = Database::in_memory().unwrap();
        let project = ProjectRepo::new(db.clone()).get_or_create("acme").unwrap();
        let tasks = TaskRepo::new(db);
        let task = tasks.create(&project.id, "Checkout flow").unwrap();
        tasks.begin_generation(&task.id).unwrap();
        tasks.finish_generation(&task.id, None).unwrap();

        assert_eq!(
            task_snapshot(&tasks, &task.id).unwrap(),
            PollEvent::Success(Vec::new())
        );
    }

    #[test]
    fn snapshot_unknown_task_errors() {
        let db = Database::in_memory().unwrap();
        let tasks = TaskRepo::new(db);
        let result = task_snapshot(&tasks, &TaskId::from_raw("task_nonexistent"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_stops_after_first_terminal_event() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_snapshot = Arc::clone(&calls);

        let watcher = PollWatcher::new(Duration::from_millis(100));
        let stream = watcher.watch(move || {
            let n = calls_in_snapshot.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Ok(PollEvent::Generating(Vec::new()))
            } else {
                Ok(PollEvent::Success(vec![json!({"title": "a"})]))
            }
        });

        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 3);
        assert!(!events[0].as_ref().unwrap().is_terminal());
        assert!(!events[1].as_ref().unwrap().is_terminal());
        assert!(events[2].as_ref().unwrap().is_terminal());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_ends_on_snapshot_error() {
        let watcher = PollWatcher::new(Duration::from_millis(100));
        let stream = watcher.watch(|| Err(StoreError::NotFound("task gone".into())));
        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_err());
    }
}
