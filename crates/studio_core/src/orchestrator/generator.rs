//! Content generator interface.
//!
//! The executor only ever talks to [`ContentGenerator`] trait objects,
//! one per stage kind, looked up in a [`GeneratorSet`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;

use super::errors::GeneratorResult;
use crate::models::{Job, JobId, StageKind, StageOutputRef, StageStatus};

/// Everything a generator gets to see for one invocation.
///
/// `prior` holds the outputs of every stage that already succeeded, in
/// order, so later stages can build on earlier ones (script feeds audio,
/// script and audio feed video).
#[derive(Debug, Clone, PartialEq)]
pub struct StageContext {
    pub job_id: JobId,
    pub stage: StageKind,
    /// 1-based attempt number of this invocation.
    pub attempt: u32,
    pub title: String,
    pub fields: BTreeMap<String, String>,
    pub platforms: Vec<String>,
    pub prior: Vec<StageOutputRef>,
}

impl StageContext {
    /// Build the context for the stage at `index` of `job`.
    pub fn for_stage(job: &Job, index: usize) -> Option<Self> {
        let result = job.stages.get(index)?;
        let prior = job.stages[..index]
            .iter()
            .filter(|s| s.status == StageStatus::Succeeded)
            .filter_map(|s| {
                s.output_ref.as_ref().map(|r| StageOutputRef {
                    stage: s.stage,
                    output_ref: r.clone(),
                })
            })
            .collect();

        Some(Self {
            job_id: job.id.clone(),
            stage: result.stage,
            attempt: result.attempts,
            title: job.title.clone(),
            fields: job.fields.clone(),
            platforms: job.platforms.clone(),
            prior,
        })
    }

    /// Output of an earlier stage, if it ran.
    pub fn output_of(&self, stage: StageKind) -> Option<&str> {
        self.prior
            .iter()
            .find(|o| o.stage == stage)
            .map(|o| o.output_ref.as_str())
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Back-end that produces the content for one stage kind.
///
/// Returns an opaque reference to the generated content. Implementations
/// classify their failures: [`StageError::Transient`](super::StageError)
/// is retried, anything fatal fails the job.
///
/// # Example
///
/// ```ignore
/// struct ScriptWriter;
///
/// #[async_trait]
/// impl ContentGenerator for ScriptWriter {
///     fn kind(&self) -> StageKind { StageKind::Script }
///
///     async fn generate(&self, ctx: &StageContext) -> GeneratorResult<String> {
///         let title = ctx.field("title").unwrap_or(&ctx.title);
///         Ok(format!("script://{}/{}", ctx.job_id, title))
///     }
/// }
/// ```
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// Stage kind this generator serves.
    fn kind(&self) -> StageKind;

    async fn generate(&self, ctx: &StageContext) -> GeneratorResult<String>;

    /// Name used in logs.
    fn name(&self) -> &str {
        self.kind().as_str()
    }
}

/// Registered generators keyed by stage kind.
#[derive(Clone, Default)]
pub struct GeneratorSet {
    generators: HashMap<StageKind, Arc<dyn ContentGenerator>>,
}

impl GeneratorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a generator, replacing any previous one for its kind.
    pub fn register(&mut self, generator: Arc<dyn ContentGenerator>) -> &mut Self {
        self.generators.insert(generator.kind(), generator);
        self
    }

    /// Register a generator (builder pattern).
    pub fn with<G: ContentGenerator + 'static>(mut self, generator: G) -> Self {
        self.register(Arc::new(generator));
        self
    }

    pub fn get(&self, kind: StageKind) -> Option<Arc<dyn ContentGenerator>> {
        self.generators.get(&kind).cloned()
    }

    /// Stage kinds with a registered generator, in pipeline order.
    pub fn kinds(&self) -> Vec<StageKind> {
        let mut kinds: Vec<StageKind> = self.generators.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Requested stages that nothing can serve.
    pub fn missing(&self, stages: &[StageKind]) -> Vec<StageKind> {
        stages
            .iter()
            .copied()
            .filter(|stage| !self.generators.contains_key(stage))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.generators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generators.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobRequest;

    struct Echo(StageKind);

    #[async_trait]
    impl ContentGenerator for Echo {
        fn kind(&self) -> StageKind {
            self.0
        }

        async fn generate(&self, ctx: &StageContext) -> GeneratorResult<String> {
            Ok(format!("{}://{}", ctx.stage, ctx.job_id))
        }
    }

    fn job() -> Job {
        let mut fields = BTreeMap::new();
        fields.insert("title".to_string(), "Launch".to_string());
        let request = JobRequest::new(
            "sheet",
            "row",
            fields,
            vec![StageKind::Script, StageKind::Audio, StageKind::Video],
            vec!["youtube".to_string()],
        );
        Job::from_request("j1", &request, 1.0)
    }

    #[test]
    fn context_carries_prior_outputs() {
        let mut job = job();
        job.stages[0].status = StageStatus::Succeeded;
        job.stages[0].output_ref = Some("script://j1".to_string());
        job.stages[1].status = StageStatus::Succeeded;
        job.stages[1].output_ref = Some("audio://j1".to_string());
        job.stages[2].attempts = 2;

        let ctx = StageContext::for_stage(&job, 2).unwrap();
        assert_eq!(ctx.stage, StageKind::Video);
        assert_eq!(ctx.attempt, 2);
        assert_eq!(ctx.prior.len(), 2);
        assert_eq!(ctx.output_of(StageKind::Script), Some("script://j1"));
        assert_eq!(ctx.output_of(StageKind::Video), None);
        assert_eq!(ctx.field("title"), Some("Launch"));

        assert!(StageContext::for_stage(&job, 3).is_none());
    }

    #[tokio::test]
    async fn generator_set_dispatches_by_kind() {
        let set = GeneratorSet::new()
            .with(Echo(StageKind::Script))
            .with(Echo(StageKind::Audio));

        assert_eq!(set.len(), 2);
        assert_eq!(set.kinds(), vec![StageKind::Script, StageKind::Audio]);
        assert_eq!(
            set.missing(&[StageKind::Script, StageKind::Video]),
            vec![StageKind::Video]
        );

        let job = job();
        let ctx = StageContext::for_stage(&job, 0).unwrap();
        let generator = set.get(StageKind::Script).unwrap();
        assert_eq!(generator.name(), "script");
        assert_eq!(generator.generate(&ctx).await.unwrap(), "script://j1");
    }
}
