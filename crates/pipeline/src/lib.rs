//! tb_pipeline
//!
//! The per-message state machine: RECEIVED -> dedup? -> ACK -> PARSING ->
//! (NO_TRACEBACK | SEARCHING) -> (MATCHED | ANALYZING) -> (LINKED |
//! CREATED | ERROR). Every transition that matters for the audit trail
//! emits an event through `tb_audit_log`; every terminal state leaves
//! exactly one reaction on the original message and, except for
//! `NoTraceback`, exactly one reply.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tb_audit_spec::{
    AuditEvent, CloneAcquired, CloneFailed, CorrelationId, DuplicateMessageSkipped, IssueCreated,
    IssueMatched, IssueSearchPerformed, LlmAnalysisPerformed, MessageReceived, NoTracebackDetected,
    PipelineErrored, ProcessingResult as AuditProcessingResult, ReactionApplied, ReplyPosted, RepoId,
    TracebackParsed,
};
use tb_common::metrics::MetricsRegistry;
use tb_common::FaultKind;
use tb_matcher::{score_candidates, IssueState, MatchWeights, SearchCache};
use tb_providers::{classify_provider_error, AnalysisPrompt, ChatProvider, LLMProvider, VCSProvider};
use tb_traceback::ParsedTraceback;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub channel_id: String,
    pub message_id: String,
    pub author: String,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct RepoPolicy {
    pub channel_repos: HashMap<String, String>,
    pub default_repo: Option<String>,
    pub allowed_repos: HashSet<String>,
}

impl RepoPolicy {
    pub fn resolve(&self, channel_id: &str) -> Result<String, FaultKind> {
        let repo = self
            .channel_repos
            .get(channel_id)
            .cloned()
            .or_else(|| self.default_repo.clone())
            .ok_or(FaultKind::PolicyViolation)?;
        if !self.allowed_repos.is_empty() && !self.allowed_repos.contains(&repo) {
            return Err(FaultKind::PolicyViolation);
        }
        Ok(repo)
    }
}

#[derive(Debug, Clone)]
pub struct ReactionSet {
    pub processing: String,
    pub complete: String,
    pub error: String,
}

impl Default for ReactionSet {
    fn default() -> Self {
        Self { processing: "eyes".into(), complete: "white_check_mark".into(), error: "warning".into() }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub confidence_threshold: f64,
    pub processing_timeout: Duration,
    pub message_id_ttl: Duration,
    pub fingerprint_ttl: Duration,
    pub match_weights: MatchWeights,
    pub clone_opts: tb_safecmd::CloneOptions,
    pub extract_opts: tb_codeanalyzer::ExtractOptions,
    pub reactions: ReactionSet,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.85,
            processing_timeout: Duration::from_secs(300),
            message_id_ttl: Duration::from_secs(300),
            fingerprint_ttl: Duration::from_secs(300),
            match_weights: MatchWeights::default(),
            clone_opts: tb_safecmd::CloneOptions::default(),
            extract_opts: tb_codeanalyzer::ExtractOptions::default(),
            reactions: ReactionSet::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("fault: {0:?}")]
    Fault(FaultKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    DuplicateSkipped,
    NoTraceback,
    Linked { repo: String, issue_number: u64 },
    Created { repo: String, issue_number: u64 },
    Errored { category: &'static str },
}

struct MatchOutcome {
    issue_number: u64,
    state: IssueState,
    title: String,
    reasons: Vec<String>,
}

struct CreatedIssue {
    issue_number: u64,
    title: String,
    root_cause: String,
    severity: String,
}

#[derive(Clone)]
enum FingerprintOutcome {
    Linked { issue_number: u64, title: String, state: IssueState, reasons: Vec<String> },
    Created { issue_number: u64, title: String, root_cause: String, severity: String },
}

/// Retry policy (spec section 5): retryable external faults (network,
/// command timeout) get exponential backoff starting at 1s, doubling up to
/// a 30s cap, for at most 3 attempts total; a rate limit honors its own
/// `retry_after` instead of the backoff schedule. Anything else — or the
/// last attempt — is returned as-is.
const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

async fn retry_with_backoff<F, Fut, T>(mut op: F) -> Result<T, FaultKind>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, FaultKind>>,
{
    let mut attempt = 0u32;
    let mut backoff = INITIAL_BACKOFF;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(fault) => {
                if attempt >= MAX_ATTEMPTS {
                    return Err(fault);
                }
                if let FaultKind::RateLimit { retry_after_secs } = fault {
                    tokio::time::sleep(Duration::from_secs(retry_after_secs)).await;
                    continue;
                }
                if !fault.is_retryable() {
                    return Err(fault);
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

struct MessageIdDedup {
    ttl: Duration,
    seen: StdMutex<HashMap<String, Instant>>,
}

impl MessageIdDedup {
    fn new(ttl: Duration) -> Self {
        Self { ttl, seen: StdMutex::new(HashMap::new()) }
    }

    /// Returns true if this is the first time we've seen `key` within the
    /// TTL window (and records it); false if it's a repeat.
    fn check_and_record(&self, key: &str) -> bool {
        let mut guard = self.seen.lock().expect("dedup mutex poisoned");
        guard.retain(|_, t| t.elapsed() < self.ttl);
        if guard.contains_key(key) {
            false
        } else {
            guard.insert(key.to_string(), Instant::now());
            true
        }
    }
}

struct FingerprintDedup {
    ttl: Duration,
    seen: StdMutex<HashMap<(String, String), (Instant, FingerprintOutcome)>>,
}

impl FingerprintDedup {
    fn new(ttl: Duration) -> Self {
        Self { ttl, seen: StdMutex::new(HashMap::new()) }
    }

    fn get(&self, repo: &str, signature: &str) -> Option<FingerprintOutcome> {
        let mut guard = self.seen.lock().expect("dedup mutex poisoned");
        guard.retain(|_, (t, _)| t.elapsed() < self.ttl);
        guard.get(&(repo.to_string(), signature.to_string())).map(|(_, o)| o.clone())
    }

    fn record(&self, repo: &str, signature: &str, outcome: FingerprintOutcome) {
        let mut guard = self.seen.lock().expect("dedup mutex poisoned");
        guard.insert((repo.to_string(), signature.to_string()), (Instant::now(), outcome));
    }
}

pub struct Pipeline {
    pub config: PipelineConfig,
    pub repo_policy: RepoPolicy,
    chat: Arc<dyn ChatProvider>,
    vcs: Arc<dyn VCSProvider>,
    llm: Arc<dyn LLMProvider>,
    clone_cache: Arc<tb_clonecache::CloneCache>,
    audit: Arc<tokio::sync::Mutex<tb_audit_log::AuditAppender>>,
    metrics: Arc<MetricsRegistry>,
    search_cache: SearchCache,
    message_dedup: MessageIdDedup,
    fingerprint_dedup: FingerprintDedup,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        repo_policy: RepoPolicy,
        chat: Arc<dyn ChatProvider>,
        vcs: Arc<dyn VCSProvider>,
        llm: Arc<dyn LLMProvider>,
        clone_cache: Arc<tb_clonecache::CloneCache>,
        audit: Arc<tokio::sync::Mutex<tb_audit_log::AuditAppender>>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            message_dedup: MessageIdDedup::new(config.message_id_ttl),
            fingerprint_dedup: FingerprintDedup::new(config.fingerprint_ttl),
            search_cache: SearchCache::with_default_ttl(),
            config,
            repo_policy,
            chat,
            vcs,
            llm,
            clone_cache,
            audit,
            metrics,
        }
    }

    pub async fn handle_message(&self, msg: ChatMessage) -> Outcome {
        let timeout = self.config.processing_timeout;
        match tokio::time::timeout(timeout, self.handle_message_inner(&msg)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.emit(AuditEvent::PipelineErrored(PipelineErrored {
                    schema_version: 1,
                    correlation_id: self.correlation_id(&msg),
                    ts: 0.0,
                    fault: "TimedOut".into(),
                    retryable: false,
                }))
                .await;
                self.finish_error(&msg, FaultKind::TimedOut.user_category()).await;
                Outcome::Errored { category: "timed out" }
            }
        }
    }

    fn correlation_id(&self, msg: &ChatMessage) -> CorrelationId {
        CorrelationId::new(&msg.channel_id, &msg.message_id)
    }

    async fn emit(&self, event: AuditEvent) {
        let mut guard = self.audit.lock().await;
        if let Err(e) = guard.append(event) {
            tracing::error!(error = %e, "failed to append audit event");
        }
    }

    async fn react(&self, msg: &ChatMessage, reaction: &str) {
        let result = self.chat.add_reaction(&msg.channel_id, &msg.message_id, reaction).await;
        self.emit(AuditEvent::ReactionApplied(ReactionApplied {
            schema_version: 1,
            correlation_id: self.correlation_id(msg),
            ts: 0.0,
            reaction: reaction.to_string(),
            added: result.is_ok(),
        }))
        .await;
        if let Err(e) = result {
            // Reaction failures are never fatal to processing — the user
            // still gets their reply even if the emoji didn't land.
            tracing::warn!(error = %e, reaction, "failed to apply chat reaction");
        }
    }

    async fn unreact(&self, msg: &ChatMessage, reaction: &str) {
        if let Err(e) = self.chat.remove_reaction(&msg.channel_id, &msg.message_id, reaction).await {
            tracing::warn!(error = %e, reaction, "failed to remove chat reaction");
        }
    }

    async fn reply(&self, msg: &ChatMessage, text: &str, result: AuditProcessingResult) {
        if let Err(e) = self.chat.post_reply(&msg.channel_id, &msg.message_id, text).await {
            tracing::error!(error = %e, "failed to post chat reply");
        }
        self.emit(AuditEvent::ReplyPosted(ReplyPosted {
            schema_version: 1,
            correlation_id: self.correlation_id(msg),
            ts: 0.0,
            result,
        }))
        .await;
    }

    async fn finish_error(&self, msg: &ChatMessage, user_category: &str) {
        self.unreact(msg, &self.config.reactions.processing).await;
        self.react(msg, &self.config.reactions.error).await;
        let text = format!("Sorry, something went wrong ({user_category}). correlation_id={}", self.correlation_id(msg).0);
        self.reply(msg, &text, AuditProcessingResult::Error).await;
    }

    async fn handle_message_inner(&self, msg: &ChatMessage) -> Outcome {
        let dedup_key = format!("{}:{}", msg.channel_id, msg.message_id);
        if !self.message_dedup.check_and_record(&dedup_key) {
            self.emit(AuditEvent::DuplicateMessageSkipped(DuplicateMessageSkipped {
                schema_version: 1,
                correlation_id: self.correlation_id(msg),
                ts: 0.0,
            }))
            .await;
            return Outcome::DuplicateSkipped;
        }

        let repo = match self.repo_policy.resolve(&msg.channel_id) {
            Ok(repo) => repo,
            Err(fault) => {
                self.finish_error(msg, fault.user_category()).await;
                return Outcome::Errored { category: fault.user_category() };
            }
        };

        self.emit(AuditEvent::MessageReceived(MessageReceived {
            schema_version: 1,
            correlation_id: self.correlation_id(msg),
            ts: 0.0,
            repo: RepoId(repo.clone()),
        }))
        .await;
        self.react(msg, &self.config.reactions.processing).await;

        let parsed = match tb_traceback::parse(&msg.text) {
            Ok(p) => p,
            Err(_) => {
                self.emit(AuditEvent::NoTracebackDetected(NoTracebackDetected {
                    schema_version: 1,
                    correlation_id: self.correlation_id(msg),
                    ts: 0.0,
                }))
                .await;
                self.unreact(msg, &self.config.reactions.processing).await;
                return Outcome::NoTraceback;
            }
        };

        self.emit(AuditEvent::TracebackParsed(TracebackParsed {
            schema_version: 1,
            correlation_id: self.correlation_id(msg),
            ts: 0.0,
            signature: parsed.signature(),
            frame_count: parsed.frames.len() as u32,
            is_chained: parsed.is_chained,
        }))
        .await;

        let signature = parsed.signature();
        if let Some(cached) = self.fingerprint_dedup.get(&repo, &signature) {
            return self.reply_from_cached_outcome(msg, &repo, cached).await;
        }

        match self.search_and_match(msg, &repo, &parsed).await {
            Ok(Some(m)) => {
                self.fingerprint_dedup.record(
                    &repo,
                    &signature,
                    FingerprintOutcome::Linked {
                        issue_number: m.issue_number,
                        title: m.title.clone(),
                        state: m.state,
                        reasons: m.reasons.clone(),
                    },
                );
                self.finish_linked(msg, &repo, m.issue_number, &m.title, m.state, &m.reasons).await
            }
            Ok(None) => match self.analyze_and_create(msg, &repo, &parsed).await {
                Ok(created) => {
                    self.fingerprint_dedup.record(
                        &repo,
                        &signature,
                        FingerprintOutcome::Created {
                            issue_number: created.issue_number,
                            title: created.title.clone(),
                            root_cause: created.root_cause.clone(),
                            severity: created.severity.clone(),
                        },
                    );
                    self.finish_created(msg, &repo, created.issue_number, &created.title, &created.root_cause, &created.severity)
                        .await
                }
                Err(fault) => {
                    self.emit(AuditEvent::PipelineErrored(PipelineErrored {
                        schema_version: 1,
                        correlation_id: self.correlation_id(msg),
                        ts: 0.0,
                        fault: format!("{fault:?}"),
                        retryable: fault.is_retryable(),
                    }))
                    .await;
                    self.finish_error(msg, fault.user_category()).await;
                    Outcome::Errored { category: fault.user_category() }
                }
            },
            Err(fault) => {
                self.emit(AuditEvent::PipelineErrored(PipelineErrored {
                    schema_version: 1,
                    correlation_id: self.correlation_id(msg),
                    ts: 0.0,
                    fault: format!("{fault:?}"),
                    retryable: fault.is_retryable(),
                }))
                .await;
                self.finish_error(msg, fault.user_category()).await;
                Outcome::Errored { category: fault.user_category() }
            }
        }
    }

    async fn reply_from_cached_outcome(&self, msg: &ChatMessage, repo: &str, cached: FingerprintOutcome) -> Outcome {
        match cached {
            FingerprintOutcome::Linked { issue_number, title, state, reasons } => {
                self.finish_linked(msg, repo, issue_number, &title, state, &reasons).await
            }
            FingerprintOutcome::Created { issue_number, title, root_cause, severity } => {
                self.finish_created(msg, repo, issue_number, &title, &root_cause, &severity).await
            }
        }
    }

    /// SEARCHING + MATCHED states: build the query, consult the TTL search
    /// cache, score candidates, and decide whether the top result clears
    /// `confidence_threshold` (>= , not >, per policy).
    async fn search_and_match(
        &self,
        msg: &ChatMessage,
        repo: &str,
        parsed: &ParsedTraceback,
    ) -> Result<Option<MatchOutcome>, FaultKind> {
        let query = tb_matcher::build_query(parsed);

        let (candidates, cache_hit) = if let Some(cached) = self.search_cache.get(repo, &query) {
            (cached, true)
        } else {
            let fetched = retry_with_backoff(|| async {
                self.vcs.search_issues(repo, &query).await.map_err(|e| classify_provider_error(&e))
            })
            .await?;
            self.search_cache.put(repo, &query, fetched.clone());
            (fetched, false)
        };

        self.emit(AuditEvent::IssueSearchPerformed(IssueSearchPerformed {
            schema_version: 1,
            correlation_id: self.correlation_id(msg),
            ts: 0.0,
            repo: RepoId(repo.to_string()),
            query_hash: tb_common::sha256_bytes(query.as_bytes()),
            cache_hit,
            result_count: candidates.len() as u32,
        }))
        .await;

        if candidates.is_empty() {
            return Ok(None);
        }

        let traceback_summary = format!("{}: {}", parsed.exception_type, parsed.exception_message);
        let mut semantic_scores = HashMap::new();
        for candidate in candidates.iter().take(5) {
            let issue_text = format!("{} {}", candidate.title, candidate.body);
            if let Ok(score) = self.llm.calculate_similarity(&traceback_summary, &issue_text).await {
                semantic_scores.insert(candidate.number, score);
            }
        }

        let scored = score_candidates(parsed, &candidates, self.config.match_weights, &semantic_scores);
        let Some(top) = scored.first() else { return Ok(None) };

        if top.confidence >= self.config.confidence_threshold {
            self.emit(AuditEvent::IssueMatched(IssueMatched {
                schema_version: 1,
                correlation_id: self.correlation_id(msg),
                ts: 0.0,
                repo: RepoId(repo.to_string()),
                issue_number: top.issue_number,
                confidence: top.confidence,
                from_fingerprint_cache: false,
            }))
            .await;
            let title = candidates
                .iter()
                .find(|c| c.number == top.issue_number)
                .map(|c| c.title.clone())
                .unwrap_or_default();
            Ok(Some(MatchOutcome {
                issue_number: top.issue_number,
                state: top.state,
                title,
                reasons: top.reasons.clone(),
            }))
        } else {
            Ok(None)
        }
    }

    /// ANALYZING state: acquire a clone, extract redacted code context,
    /// run LLM analysis, draft title/body, and file the issue.
    async fn analyze_and_create(
        &self,
        msg: &ChatMessage,
        repo: &str,
        parsed: &ParsedTraceback,
    ) -> Result<CreatedIssue, FaultKind> {
        let clone_url = format!("https://github.com/{repo}.git");
        let cache = self.clone_cache.clone();

        let handle = match cache.acquire(repo, &clone_url, &self.config.clone_opts).await {
            Ok(h) => {
                self.emit(AuditEvent::CloneAcquired(CloneAcquired {
                    schema_version: 1,
                    correlation_id: self.correlation_id(msg),
                    ts: 0.0,
                    repo: RepoId(repo.to_string()),
                    cache_hit: false,
                    size_bytes: h.size_bytes(),
                }))
                .await;
                h
            }
            Err(e) => {
                self.emit(AuditEvent::CloneFailed(CloneFailed {
                    schema_version: 1,
                    correlation_id: self.correlation_id(msg),
                    ts: 0.0,
                    repo: RepoId(repo.to_string()),
                    reason: e.to_string(),
                }))
                .await;
                return Err(FaultKind::NetworkError);
            }
        };
        let context = tb_codeanalyzer::extract_context(
            handle.path(),
            &parsed.frames,
            &self.config.extract_opts,
            &self.metrics,
        )
        .map_err(|_| FaultKind::RedactionFailure)?;

        let code_contexts: Vec<(String, String)> =
            context.contexts.iter().map(|c| (c.file.clone(), c.content.clone())).collect();

        let redacted_traceback = tb_redactor::redact(&parsed.raw_text, &self.metrics)
            .map_err(|_| FaultKind::RedactionFailure)?
            .text;

        let prompt = AnalysisPrompt {
            exception_type: parsed.exception_type.clone(),
            exception_message: parsed.exception_message.clone(),
            traceback_text: redacted_traceback,
            code_contexts,
        };

        let analysis = retry_with_backoff(|| async {
            self.llm.analyze_error(&prompt).await.map_err(|e| classify_provider_error(&e))
        })
        .await?;
        self.emit(AuditEvent::LlmAnalysisPerformed(LlmAnalysisPerformed {
            schema_version: 1,
            correlation_id: self.correlation_id(msg),
            ts: 0.0,
            model_name: self.llm.model_name().to_string(),
            confidence: analysis.confidence,
            severity: format!("{:?}", analysis.severity),
        }))
        .await;

        let title = retry_with_backoff(|| async {
            self.llm.generate_issue_title(&prompt).await.map_err(|e| classify_provider_error(&e))
        })
        .await?;
        let body = retry_with_backoff(|| async {
            self.llm.generate_issue_body(&prompt, &analysis).await.map_err(|e| classify_provider_error(&e))
        })
        .await?;

        let issue_number = retry_with_backoff(|| async {
            self.vcs.create_issue(repo, &title, &body).await.map_err(|e| classify_provider_error(&e))
        })
        .await?;
        self.emit(AuditEvent::IssueCreated(IssueCreated {
            schema_version: 1,
            correlation_id: self.correlation_id(msg),
            ts: 0.0,
            repo: RepoId(repo.to_string()),
            issue_number,
            fingerprint_hash: tb_common::sha256_bytes(parsed.signature().as_bytes()),
        }))
        .await;

        Ok(CreatedIssue {
            issue_number,
            title,
            root_cause: analysis.likely_cause.clone(),
            severity: format!("{:?}", analysis.severity),
        })
    }

    async fn finish_linked(
        &self,
        msg: &ChatMessage,
        repo: &str,
        issue_number: u64,
        title: &str,
        state: IssueState,
        reasons: &[String],
    ) -> Outcome {
        self.unreact(msg, &self.config.reactions.processing).await;
        self.react(msg, &self.config.reactions.complete).await;
        let url = self.vcs.issue_url(repo, issue_number).await;
        let state_str = if state == IssueState::Closed { "closed" } else { "open" };
        let reasons_str =
            if reasons.is_empty() { String::new() } else { format!("\nMatch reasons: {}", reasons.join(", ")) };
        let text = format!("Looks like an existing issue: {url}\n\"{title}\" ({state_str}){reasons_str}");
        self.reply(msg, &text, AuditProcessingResult::ExistingIssueLinked).await;
        Outcome::Linked { repo: repo.to_string(), issue_number }
    }

    async fn finish_created(
        &self,
        msg: &ChatMessage,
        repo: &str,
        issue_number: u64,
        title: &str,
        root_cause: &str,
        severity: &str,
    ) -> Outcome {
        self.unreact(msg, &self.config.reactions.processing).await;
        self.react(msg, &self.config.reactions.complete).await;
        let url = self.vcs.issue_url(repo, issue_number).await;
        let text = format!("Filed a new issue: {url}\n\"{title}\" [{severity}]\n{root_cause}");
        self.reply(msg, &text, AuditProcessingResult::NewIssueCreated).await;
        Outcome::Created { repo: repo.to_string(), issue_number }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_policy_prefers_channel_mapping_over_default() {
        let mut policy = RepoPolicy::default();
        policy.channel_repos.insert("C1".into(), "acme/widgets".into());
        policy.default_repo = Some("acme/fallback".into());
        assert_eq!(policy.resolve("C1").unwrap(), "acme/widgets");
        assert_eq!(policy.resolve("C2").unwrap(), "acme/fallback");
    }

    #[test]
    fn repo_policy_rejects_repo_outside_allowlist() {
        let mut policy = RepoPolicy::default();
        policy.default_repo = Some("acme/secret".into());
        policy.allowed_repos.insert("acme/public".into());
        assert_eq!(policy.resolve("C1"), Err(FaultKind::PolicyViolation));
    }

    #[test]
    fn message_id_dedup_flags_repeat_within_ttl() {
        let dedup = MessageIdDedup::new(Duration::from_secs(60));
        assert!(dedup.check_and_record("C1:M1"));
        assert!(!dedup.check_and_record("C1:M1"));
    }

    #[test]
    fn confidence_threshold_is_inclusive() {
        let cfg = PipelineConfig::default();
        assert!((cfg.confidence_threshold - 0.85).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_with_backoff_retries_network_errors_then_succeeds() {
        let attempts = StdMutex::new(0u32);
        let result = retry_with_backoff(|| async {
            let mut n = attempts.lock().unwrap();
            *n += 1;
            if *n < 3 {
                Err(FaultKind::NetworkError)
            } else {
                Ok(*n)
            }
        })
        .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_with_backoff_gives_up_after_max_attempts() {
        let attempts = StdMutex::new(0u32);
        let result: Result<(), FaultKind> = retry_with_backoff(|| async {
            *attempts.lock().unwrap() += 1;
            Err(FaultKind::NetworkError)
        })
        .await;
        assert_eq!(result, Err(FaultKind::NetworkError));
        assert_eq!(*attempts.lock().unwrap(), MAX_ATTEMPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_with_backoff_does_not_retry_terminal_faults() {
        let attempts = StdMutex::new(0u32);
        let result: Result<(), FaultKind> = retry_with_backoff(|| async {
            *attempts.lock().unwrap() += 1;
            Err(FaultKind::InvalidInput)
        })
        .await;
        assert_eq!(result, Err(FaultKind::InvalidInput));
        assert_eq!(*attempts.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_with_backoff_honors_rate_limit_retry_after() {
        let attempts = StdMutex::new(0u32);
        let result = retry_with_backoff(|| async {
            let mut n = attempts.lock().unwrap();
            *n += 1;
            if *n < 2 {
                Err(FaultKind::RateLimit { retry_after_secs: 5 })
            } else {
                Ok(*n)
            }
        })
        .await;
        assert_eq!(result, Ok(2));
    }
}
