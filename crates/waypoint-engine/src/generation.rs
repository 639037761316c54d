use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use tracing::{instrument, warn};

use waypoint_core::provider::{LlmProvider, ModelContext, StreamOptions};
use waypoint_core::chat::ChatMessage;
use waypoint_core::ids::TaskId;
use waypoint_core::stream::StreamEvent;
use waypoint_store::tasks::TaskRepo;
use waypoint_store::Database;

use crate::error::EngineError;

const STORY_PROMPT: &str = "You write user stories for a project-management tool. \
Given a task title, respond with only a JSON array of story objects, each with \
a \"title\" and a \"description\" field.";

/// Generates user stories for a task, guarding the single generation slot.
///
/// The task always ends `done`, whether or not the model produced usable
/// stories. A failed run is a done task without stories; callers detect it
/// by the absent payload, and can re-arm the task for another pass.
pub struct GenerationService {
    tasks: TaskRepo,
    provider: Arc<dyn LlmProvider>,
    options: StreamOptions,
}

impl GenerationService {
    pub fn new(db: Database, provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            tasks: TaskRepo::new(db),
            provider,
            options: StreamOptions::default(),
        }
    }

    /// Claim the generation slot. A second concurrent claim gets
    /// `StoreError::Conflict` through `EngineError::Store`.
    pub fn begin(&self, id: &TaskId) -> Result<(), EngineError> {
        Ok(self.tasks.begin_generation(id)?)
    }

    /// Run one generation pass for an already-claimed task.
    #[instrument(skip(self), fields(task_id = %id))]
    pub async fn generate_stories(&self, id: &TaskId) -> Result<(), EngineError> {
        let task = self.tasks.get(id)?;

        let stories = match self.run_model(&task.title).await {
            Ok(stories) => Some(stories),
            Err(err) => {
                warn!(task_id = %id, error = %err, "story generation failed");
                None
            }
        };

        self.tasks.finish_generation(id, stories.as_ref())?;
        Ok(())
    }

    /// Claim and run in one call. The slot is released to `done` on every
    /// path after a successful claim.
    pub async fn claim_and_generate(&self, id: &TaskId) -> Result<(), EngineError> {
        self.begin(id)?;
        self.generate_stories(id).await
    }

    async fn run_model(&self, title: &str) -> Result<Value, EngineError> {
        let context = ModelContext {
            system_prompt: Some(STORY_PROMPT.to_string()),
            messages: vec![ChatMessage::user(title)],
            tools: Vec::new(),
        };

        let mut stream = self.provider.stream(&context, &self.options).await?;
        let mut completion = None;
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Done { completion: c } => completion = Some(c),
                StreamEvent::Error { error } => return Err(EngineError::Gateway(error)),
                _ => {}
            }
        }
        let completion =
            completion.ok_or_else(|| EngineError::Internal("stream ended without Done".into()))?;

        parse_stories(&completion.text)
            .ok_or_else(|| EngineError::Internal("model output is not a story array".into()))
    }
}

/// The model is instructed to answer with a bare JSON array, but some
/// answers wrap it in prose. Accept a direct array, or the first bracketed
/// span that parses as one.
fn parse_stories(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_array() {
            return Some(value);
        }
    }

    let start = trimmed.find('[')?;
    let end = trimmed.rfind(']')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&trimmed[start..=end])
        .ok()
        .filter(Value::is_array)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use waypoint_core::errors::GatewayError;
    use waypoint_core::generation::GenerationStatus;
    use waypoint_core::ids::ProjectId;
    use waypoint_llm::{MockProvider, MockResponse};
    use waypoint_store::projects::ProjectRepo;
    use waypoint_store::StoreError;

    fn setup(responses: Vec<MockResponse>) -> (GenerationService, TaskRepo, ProjectId) {
        let db = Database::in_memory().unwrap();
        let projects = ProjectRepo::new(db.clone());
        let project = projects.get_or_create("acme").unwrap();
        let service = GenerationService::new(db.clone(), Arc::new(MockProvider::new(responses)));
        (service, TaskRepo::new(db), project.id)
    }

    #[tokio::test]
    async fn successful_generation_stores_stories() {
        let stories = r#"[{"title": "As a shopper I can pay", "description": "card checkout"}]"#;
        let (service, tasks, project_id) = setup(vec![MockResponse::stream_text(stories)]);
        let task = tasks.create(&project_id, "Checkout flow").unwrap();

        service.claim_and_generate(&task.id).await.unwrap();

        let fetched = tasks.get(&task.id).unwrap();
        assert_eq!(fetched.generation_status, GenerationStatus::Done);
        let stored = fetched.stories.unwrap();
        assert_eq!(stored[0]["title"], "As a shopper I can pay");
    }

    #[tokio::test]
    async fn failed_generation_still_marks_done() {
        let (service, tasks, project_id) = setup(vec![MockResponse::Error(
            GatewayError::ProviderOverloaded,
        )]);
        let task = tasks.create(&project_id, "Checkout flow").unwrap();

        service.claim_and_generate(&task.id).await.unwrap();

        let fetched = tasks.get(&task.id).unwrap();
        assert_eq!(fetched.generation_status, GenerationStatus::Done);
        assert!(fetched.stories.is_none());
    }

    #[tokio::test]
    async fn unparseable_output_still_marks_done() {
        let (service, tasks, project_id) =
            setup(vec![MockResponse::stream_text("sorry, no stories today")]);
        let task = tasks.create(&project_id, "Checkout flow").unwrap();

        service.claim_and_generate(&task.id).await.unwrap();

        let fetched = tasks.get(&task.id).unwrap();
        assert_eq!(fetched.generation_status, GenerationStatus::Done);
        assert!(fetched.stories.is_none());
    }

    #[tokio::test]
    async fn second_concurrent_claim_conflicts() {
        let (service, tasks, project_id) = setup(vec![]);
        let task = tasks.create(&project_id, "Checkout flow").unwrap();

        service.begin(&task.id).unwrap();
        let second = service.begin(&task.id);
        assert!(matches!(
            second,
            Err(EngineError::Store(StoreError::Conflict(_)))
        ));
    }

    #[test]
    fn parse_stories_accepts_bare_array() {
        let parsed = parse_stories(r#"[{"title": "a"}]"#).unwrap();
        assert_eq!(parsed, json!([{"title": "a"}]));
    }

    #[test]
    fn parse_stories_extracts_embedded_array() {
        let parsed =
            parse_stories(r#"Here you go: [{"title": "a"}], hope that helps"#).unwrap();
        assert_eq!(parsed, json!([{"title": "a"}]));
    }

    #[test]
    fn parse_stories_rejects_non_arrays() {
        assert!(parse_stories(r#"{"title": "a"}"#).is_none());
        assert!(parse_stories("no json here").is_none());
    }
}
