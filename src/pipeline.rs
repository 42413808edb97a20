//! The turn orchestrator.
//!
//! A turn takes the user's text for a session through a fixed sequence of
//! stages: retrieve fragments, format them, build the prompt, ask the model,
//! and record the exchange.  The session's history lock is held from the
//! first stage to the last, so turns on one session never interleave, while
//! turns on different sessions run concurrently.  History is only written in
//! the final stage; a turn that fails (or whose future is dropped) leaves it
//! exactly as it was.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::time::Instant;

use crate::completion::{CompletionClient, OpenAiChat};
use crate::config::{DEFAULT_TOP_K, RagConfig};
use crate::context::format_context;
use crate::error::{Error, Result};
use crate::observability::{
    COMPLETION_DURATION, COMPLETION_ERRORS, COMPLETION_REQUESTS, RETRIEVAL_DURATION,
    RETRIEVAL_ERRORS, RETRIEVAL_FRAGMENTS, RETRIEVAL_REQUESTS, TURN_DURATION, TURN_FAILURES, TURNS,
};
use crate::prompt::{PromptPayload, PromptTemplate};
use crate::retriever::{PineconeRetriever, Retriever};
use crate::retry::{RetryPolicy, Stage};
use crate::session::SessionStore;
use crate::types::{Message, Usage};

/// Where a turn currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnStage {
    Idle,
    Retrieving,
    Formatting,
    PromptBuilding,
    Completing,
    Recording,
    Failed,
}

impl TurnStage {
    /// Returns the stage name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStage::Idle => "idle",
            TurnStage::Retrieving => "retrieving",
            TurnStage::Formatting => "formatting",
            TurnStage::PromptBuilding => "prompt_building",
            TurnStage::Completing => "completing",
            TurnStage::Recording => "recording",
            TurnStage::Failed => "failed",
        }
    }
}

impl fmt::Display for TurnStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a successful turn produced.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// The assistant's reply, as recorded in history.
    pub reply: String,
    /// Number of fragments the reply was grounded on.
    pub fragments: usize,
    /// Token usage reported by the model, if any.
    pub usage: Option<Usage>,
}

/// Retrieval-augmented chat over per-session memory.
pub struct ChatPipeline {
    retriever: Arc<dyn Retriever>,
    completion: Arc<dyn CompletionClient>,
    sessions: SessionStore,
    template: PromptTemplate,
    top_k: AtomicUsize,
    retry_policy: RetryPolicy,
}

impl fmt::Debug for ChatPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatPipeline")
            .field("sessions", &self.sessions)
            .field("template", &self.template)
            .field("top_k", &self.top_k())
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

impl ChatPipeline {
    /// Starts building a pipeline around the given providers.
    pub fn builder(
        retriever: Arc<dyn Retriever>,
        completion: Arc<dyn CompletionClient>,
    ) -> ChatPipelineBuilder {
        ChatPipelineBuilder {
            retriever,
            completion,
            sessions: None,
            template: PromptTemplate::default(),
            top_k: DEFAULT_TOP_K,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Wires the Pinecone retriever and OpenAI chat client from `config`.
    pub fn from_config(config: &RagConfig) -> Result<Self> {
        config.validate()?;
        let retriever = PineconeRetriever::new(config)?;
        let completion = OpenAiChat::new(config)?;
        Self::builder(Arc::new(retriever), Arc::new(completion))
            .top_k(config.top_k)
            .template(config.prompt_template())
            .sessions(SessionStore::with_limits(config.session_limits()))
            .retry_policy(config.retry_policy())
            .build()
    }

    /// The session store turns are recorded in.
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// The prompt template.
    pub fn template(&self) -> &PromptTemplate {
        &self.template
    }

    /// The retry policy applied to both provider calls.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Fragments retrieved per turn.
    pub fn top_k(&self) -> usize {
        self.top_k.load(Ordering::Relaxed)
    }

    /// Changes the number of fragments retrieved by subsequent turns.
    pub fn set_top_k(&self, top_k: usize) -> Result<()> {
        if top_k == 0 {
            return Err(Error::validation(
                "top_k must be at least 1",
                Some("top_k".to_string()),
            ));
        }
        self.top_k.store(top_k, Ordering::Relaxed);
        Ok(())
    }

    /// Runs one turn and returns the assistant's reply.
    ///
    /// On success the user text and the reply are appended to the session's
    /// history; on failure history is untouched.
    pub async fn handle_turn(&self, session_id: &str, user_text: &str) -> Result<String> {
        self.turn(session_id, user_text)
            .await
            .map(|outcome| outcome.reply)
    }

    /// Like [`ChatPipeline::handle_turn`], also reporting what the turn used.
    pub async fn turn(&self, session_id: &str, user_text: &str) -> Result<TurnOutcome> {
        if user_text.trim().is_empty() {
            return Err(Error::validation(
                "message must not be blank",
                Some("user_text".to_string()),
            ));
        }
        let session = self.sessions.get_or_create(session_id)?;
        let mut history = session.lock().await;

        TURNS.click();
        let start = Instant::now();
        let mut tracker = StageTracker::new(session_id);
        let outcome = self.run(&mut tracker, &mut history, user_text).await;
        TURN_DURATION.add(start.elapsed().as_secs_f64());

        match outcome {
            Ok(outcome) => {
                tracker.enter(TurnStage::Idle);
                tracing::info!(
                    session_id,
                    fragments = outcome.fragments,
                    history = history.len(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "turn complete"
                );
                Ok(outcome)
            }
            Err(err) => {
                TURN_FAILURES.click();
                tracker.fail(&err);
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        tracker: &mut StageTracker<'_>,
        history: &mut Vec<Message>,
        user_text: &str,
    ) -> Result<TurnOutcome> {
        tracker.enter(TurnStage::Retrieving);
        let retriever = self.retriever.as_ref();
        let top_k = self.top_k();
        RETRIEVAL_REQUESTS.click();
        let started = Instant::now();
        let fragments = self
            .retry_policy
            .run(Stage::Retrieval, move || retriever.retrieve(user_text, top_k))
            .await;
        RETRIEVAL_DURATION.add(started.elapsed().as_secs_f64());
        let fragments = fragments.inspect_err(|_| RETRIEVAL_ERRORS.click())?;
        RETRIEVAL_FRAGMENTS.add(fragments.len() as f64);
        tracing::debug!(
            session_id = tracker.session_id,
            fragments = fragments.len(),
            top_k,
            "retrieved fragments"
        );

        tracker.enter(TurnStage::Formatting);
        let context = format_context(&fragments);

        tracker.enter(TurnStage::PromptBuilding);
        let prompt =
            PromptPayload::from_template(&self.template, history.clone(), user_text, context);

        tracker.enter(TurnStage::Completing);
        let completion = self.completion.as_ref();
        let prompt = &prompt;
        COMPLETION_REQUESTS.click();
        let started = Instant::now();
        let result = self
            .retry_policy
            .run(Stage::Completion, move || completion.complete(prompt))
            .await;
        COMPLETION_DURATION.add(started.elapsed().as_secs_f64());
        let result = result.inspect_err(|_| COMPLETION_ERRORS.click())?;

        tracker.enter(TurnStage::Recording);
        history.push(Message::user(user_text));
        history.push(Message::assistant(result.content.clone()));
        Ok(TurnOutcome {
            reply: result.content,
            fragments: fragments.len(),
            usage: result.usage,
        })
    }
}

/// Builder for [`ChatPipeline`].
pub struct ChatPipelineBuilder {
    retriever: Arc<dyn Retriever>,
    completion: Arc<dyn CompletionClient>,
    sessions: Option<SessionStore>,
    template: PromptTemplate,
    top_k: usize,
    retry_policy: RetryPolicy,
}

impl ChatPipelineBuilder {
    /// Sets the number of fragments retrieved per turn.
    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Sets the prompt template.
    pub fn template(mut self, template: PromptTemplate) -> Self {
        self.template = template;
        self
    }

    /// Uses `sessions` instead of an unbounded store.
    pub fn sessions(mut self, sessions: SessionStore) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Sets the retry policy for both provider calls.
    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Builds the pipeline.
    pub fn build(self) -> Result<ChatPipeline> {
        if self.top_k == 0 {
            return Err(Error::validation(
                "top_k must be at least 1",
                Some("top_k".to_string()),
            ));
        }
        Ok(ChatPipeline {
            retriever: self.retriever,
            completion: self.completion,
            sessions: self.sessions.unwrap_or_default(),
            template: self.template,
            top_k: AtomicUsize::new(self.top_k),
            retry_policy: self.retry_policy,
        })
    }
}

struct StageTracker<'a> {
    session_id: &'a str,
    stage: TurnStage,
}

impl<'a> StageTracker<'a> {
    fn new(session_id: &'a str) -> Self {
        Self {
            session_id,
            stage: TurnStage::Idle,
        }
    }

    fn enter(&mut self, next: TurnStage) {
        tracing::debug!(
            session_id = self.session_id,
            from = %self.stage,
            to = %next,
            "turn stage"
        );
        self.stage = next;
    }

    fn fail(&mut self, err: &Error) {
        tracing::warn!(
            session_id = self.session_id,
            stage = %self.stage,
            error = %err,
            "turn failed"
        );
        self.stage = TurnStage::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::error::ProviderFailure;
    use crate::types::{CompletionResult, Fragment, Role};

    struct StaticRetriever {
        fragments: Vec<&'static str>,
        requested: Mutex<Vec<usize>>,
    }

    impl StaticRetriever {
        fn new(fragments: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                fragments,
                requested: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl Retriever for StaticRetriever {
        async fn retrieve(&self, _query: &str, k: usize) -> Result<Vec<Fragment>> {
            self.requested.lock().unwrap().push(k);
            Ok(self.fragments.iter().take(k).map(|f| Fragment::from(*f)).collect())
        }
    }

    #[derive(Default)]
    struct RecordingCompletion {
        prompts: Mutex<Vec<PromptPayload>>,
    }

    #[async_trait::async_trait]
    impl CompletionClient for RecordingCompletion {
        async fn complete(&self, prompt: &PromptPayload) -> Result<CompletionResult> {
            self.prompts.lock().unwrap().push(prompt.clone());
            let n = self.prompts.lock().unwrap().len();
            Ok(CompletionResult::new(format!("reply {n}")).with_usage(Usage::new(10, 2)))
        }
    }

    struct FailingCompletion(ProviderFailure);

    #[async_trait::async_trait]
    impl CompletionClient for FailingCompletion {
        async fn complete(&self, _prompt: &PromptPayload) -> Result<CompletionResult> {
            Err(Error::completion(self.0, "provider said no", None))
        }
    }

    fn pipeline(
        retriever: Arc<dyn Retriever>,
        completion: Arc<dyn CompletionClient>,
    ) -> ChatPipeline {
        ChatPipeline::builder(retriever, completion)
            .retry_policy(RetryPolicy::none())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn blank_input_is_rejected_before_any_stage() {
        let retriever = StaticRetriever::new(vec!["a"]);
        let pipeline = pipeline(retriever.clone(), Arc::new(RecordingCompletion::default()));
        let err = pipeline.handle_turn("s", "  \n").await.unwrap_err();
        assert!(err.is_validation());
        assert!(retriever.requested.lock().unwrap().is_empty());
        assert!(pipeline.sessions().get("s").is_none());
    }

    #[tokio::test]
    async fn prompt_carries_history_and_context() {
        let completion = Arc::new(RecordingCompletion::default());
        let pipeline = pipeline(StaticRetriever::new(vec!["a", "b"]), completion.clone());
        pipeline.handle_turn("s", "first").await.unwrap();
        pipeline.handle_turn("s", "second").await.unwrap();

        let prompts = completion.prompts.lock().unwrap();
        assert!(prompts[0].history().is_empty());
        assert_eq!(prompts[0].context(), "• a\n\n• b");
        assert_eq!(
            prompts[1].history(),
            vec![Message::user("first"), Message::assistant("reply 1")]
        );
        assert_eq!(prompts[1].question(), "second");
    }

    #[tokio::test]
    async fn history_records_raw_question() {
        let pipeline = pipeline(
            StaticRetriever::new(vec!["a"]),
            Arc::new(RecordingCompletion::default()),
        );
        let outcome = pipeline.turn("s", "What?").await.unwrap();
        assert_eq!(outcome.reply, "reply 1");
        assert_eq!(outcome.fragments, 1);
        assert_eq!(outcome.usage, Some(Usage::new(10, 2)));

        let history = pipeline.sessions().history("s").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role(), Role::User);
        assert_eq!(history[0].content(), "What?");
        assert_eq!(history[1].role(), Role::Assistant);
    }

    #[tokio::test]
    async fn top_k_reaches_the_retriever() {
        let retriever = StaticRetriever::new(vec!["a", "b", "c"]);
        let completion = Arc::new(RecordingCompletion::default());
        let pipeline = ChatPipeline::builder(retriever.clone(), completion)
            .top_k(2)
            .build()
            .unwrap();
        pipeline.handle_turn("s", "q").await.unwrap();
        pipeline.set_top_k(7).unwrap();
        pipeline.handle_turn("s", "q").await.unwrap();
        assert_eq!(*retriever.requested.lock().unwrap(), vec![2, 7]);
        assert!(pipeline.set_top_k(0).unwrap_err().is_validation());
        assert_eq!(pipeline.top_k(), 7);
    }

    #[test]
    fn zero_top_k_does_not_build() {
        let err = ChatPipeline::builder(
            StaticRetriever::new(vec![]),
            Arc::new(RecordingCompletion::default()),
        )
        .top_k(0)
        .build()
        .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn failed_completion_leaves_history_alone() {
        let pipeline = pipeline(
            StaticRetriever::new(vec!["a"]),
            Arc::new(FailingCompletion(ProviderFailure::Authentication)),
        );
        pipeline
            .sessions()
            .append("s", Message::user("earlier"))
            .await
            .unwrap();
        let err = pipeline.handle_turn("s", "q").await.unwrap_err();
        assert_eq!(err.provider_failure(), Some(ProviderFailure::Authentication));
        assert_eq!(
            pipeline.sessions().history("s").await.unwrap(),
            vec![Message::user("earlier")]
        );
    }

    #[tokio::test]
    async fn custom_template_shapes_the_user_turn() {
        let completion = Arc::new(RecordingCompletion::default());
        let pipeline = ChatPipeline::builder(StaticRetriever::new(vec!["x"]), completion.clone())
            .template(
                PromptTemplate::new()
                    .with_system_instruction("Responde solo con el contexto.")
                    .with_user_template("Pregunta: {question}\n\nContexto:\n{context}"),
            )
            .build()
            .unwrap();
        pipeline.handle_turn("s", "¿Qué?").await.unwrap();
        let prompts = completion.prompts.lock().unwrap();
        assert_eq!(prompts[0].system_instruction(), "Responde solo con el contexto.");
        assert_eq!(prompts[0].user_turn(), "Pregunta: ¿Qué?\n\nContexto:\n• x");
    }

    #[test]
    fn stage_names() {
        assert_eq!(TurnStage::PromptBuilding.to_string(), "prompt_building");
        assert_eq!(TurnStage::Failed.as_str(), "failed");
    }
}
