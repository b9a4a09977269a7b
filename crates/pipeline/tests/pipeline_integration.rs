use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tb_common::metrics::MetricsRegistry;
use tb_matcher::{IssueCandidate, IssueState};
use tb_pipeline::{ChatMessage, Outcome, Pipeline, PipelineConfig, RepoPolicy};
use tb_providers::{
    AnalysisPrompt, AnalysisResult, ChatProvider, LLMProvider, ProviderError, Severity, VCSProvider,
};

struct RecordingChatProvider {
    replies: Mutex<Vec<String>>,
}

impl RecordingChatProvider {
    fn new() -> Self {
        Self { replies: Mutex::new(Vec::new()) }
    }

    fn last_reply(&self) -> Option<String> {
        self.replies.lock().unwrap().last().cloned()
    }

    fn reply_count(&self) -> usize {
        self.replies.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatProvider for RecordingChatProvider {
    async fn post_reply(&self, _channel_id: &str, _in_reply_to: &str, text: &str) -> Result<(), ProviderError> {
        self.replies.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn add_reaction(&self, _channel_id: &str, _message_id: &str, _reaction: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn remove_reaction(&self, _channel_id: &str, _message_id: &str, _reaction: &str) -> Result<(), ProviderError> {
        Ok(())
    }
}

struct CannedVcsProvider {
    candidates: Vec<IssueCandidate>,
}

#[async_trait]
impl VCSProvider for CannedVcsProvider {
    async fn search_issues(&self, _repo: &str, _query: &str) -> Result<Vec<IssueCandidate>, ProviderError> {
        Ok(self.candidates.clone())
    }

    async fn create_issue(&self, _repo: &str, _title: &str, _body: &str) -> Result<u64, ProviderError> {
        panic!("test scenario should never need to create an issue");
    }

    async fn issue_url(&self, repo: &str, issue_number: u64) -> String {
        format!("https://example.invalid/{repo}/issues/{issue_number}")
    }
}

struct CannedLlmProvider;

#[async_trait]
impl LLMProvider for CannedLlmProvider {
    async fn analyze_error(&self, _prompt: &AnalysisPrompt) -> Result<AnalysisResult, ProviderError> {
        Ok(AnalysisResult {
            summary: "unused in match path".into(),
            likely_cause: "unused in match path".into(),
            suggested_fix: "unused in match path".into(),
            severity: Severity::Medium,
            confidence: 1.0,
        })
    }

    async fn generate_issue_title(&self, _prompt: &AnalysisPrompt) -> Result<String, ProviderError> {
        panic!("test scenario should never need to draft a title");
    }

    async fn generate_issue_body(&self, _prompt: &AnalysisPrompt, _analysis: &AnalysisResult) -> Result<String, ProviderError> {
        panic!("test scenario should never need to draft a body");
    }

    async fn calculate_similarity(&self, _traceback_summary: &str, _issue_text: &str) -> Result<f64, ProviderError> {
        Ok(1.0)
    }

    fn model_name(&self) -> &str {
        "canned"
    }

    fn max_context_tokens(&self) -> u64 {
        8_000
    }
}

const TRACEBACK: &str = "Traceback (most recent call last):\n  File \"app/orders.py\", line 42, in process_order\n    total = compute_total(order)\nIndexError: list index out of range";

fn build_pipeline(
    candidates: Vec<IssueCandidate>,
    confidence_threshold: f64,
) -> (Pipeline, Arc<RecordingChatProvider>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let audit_path = dir.path().join("audit.jsonl");
    let audit = Arc::new(tokio::sync::Mutex::new(tb_audit_log::AuditAppender::open(&audit_path).unwrap()));
    let clone_cache = Arc::new(tb_clonecache::CloneCache::new(
        dir.path().join("clones"),
        Duration::from_secs(3600),
        1024 * 1024 * 1024,
    ));
    let metrics = Arc::new(MetricsRegistry::new());

    let mut policy = RepoPolicy::default();
    policy.channel_repos.insert("C1".into(), "acme/widgets".into());

    let chat = Arc::new(RecordingChatProvider::new());
    let vcs: Arc<dyn VCSProvider> = Arc::new(CannedVcsProvider { candidates });
    let llm: Arc<dyn LLMProvider> = Arc::new(CannedLlmProvider);

    let config = PipelineConfig { confidence_threshold, ..PipelineConfig::default() };

    let pipeline = Pipeline::new(config, policy, chat.clone(), vcs, llm, clone_cache, audit, metrics);
    (pipeline, chat, dir)
}

fn msg(message_id: &str, text: &str) -> ChatMessage {
    ChatMessage { channel_id: "C1".into(), message_id: message_id.into(), author: "u1".into(), text: text.into() }
}

#[tokio::test]
async fn plain_chat_message_without_a_traceback_is_ignored() {
    let (pipeline, chat, _dir) = build_pipeline(vec![], 0.5);
    let outcome = pipeline.handle_message(msg("m1", "hey, anyone around?")).await;
    assert_eq!(outcome, Outcome::NoTraceback);
    assert!(chat.last_reply().is_none());
}

#[tokio::test]
async fn repeated_message_id_is_skipped_the_second_time() {
    let candidates = vec![IssueCandidate {
        number: 42,
        title: "IndexError list index out of range orders.py".into(),
        body: "crashes in process_order".into(),
        state: IssueState::Open,
    }];
    let (pipeline, _chat, _dir) = build_pipeline(candidates, 0.5);
    let first = pipeline.handle_message(msg("m1", TRACEBACK)).await;
    let second = pipeline.handle_message(msg("m1", TRACEBACK)).await;
    assert_ne!(first, Outcome::DuplicateSkipped);
    assert_eq!(second, Outcome::DuplicateSkipped);
}

#[tokio::test]
async fn message_from_an_unconfigured_channel_errors_on_policy() {
    let (pipeline, chat, _dir) = build_pipeline(vec![], 0.5);
    let mut other = msg("m1", TRACEBACK);
    other.channel_id = "unknown-channel".into();
    let outcome = pipeline.handle_message(other).await;
    assert_eq!(outcome, Outcome::Errored { category: "repository not allowed" });
    assert!(chat.last_reply().unwrap().contains("repository not allowed"));
}

#[tokio::test]
async fn high_confidence_match_links_existing_issue_with_reasons() {
    let candidates = vec![IssueCandidate {
        number: 42,
        title: "IndexError list index out of range orders.py".into(),
        body: "crashes in process_order".into(),
        state: IssueState::Open,
    }];
    let (pipeline, chat, _dir) = build_pipeline(candidates, 0.5);
    let outcome = pipeline.handle_message(msg("m1", TRACEBACK)).await;
    assert_eq!(outcome, Outcome::Linked { repo: "acme/widgets".into(), issue_number: 42 });

    let reply = chat.last_reply().unwrap();
    assert!(reply.contains("acme/widgets/issues/42"));
    assert!(reply.contains("IndexError list index out of range orders.py"));
    assert!(reply.contains("Match reasons"));
}

#[tokio::test]
async fn repeat_crash_reuses_the_cached_fingerprint_outcome_without_rematching() {
    let candidates = vec![IssueCandidate {
        number: 42,
        title: "IndexError list index out of range orders.py".into(),
        body: "crashes in process_order".into(),
        state: IssueState::Open,
    }];
    let (pipeline, chat, _dir) = build_pipeline(candidates, 0.5);

    let first = pipeline.handle_message(msg("m1", TRACEBACK)).await;
    let second = pipeline.handle_message(msg("m2", TRACEBACK)).await;
    assert_eq!(first, second);
    assert_eq!(chat.reply_count(), 2);
}
