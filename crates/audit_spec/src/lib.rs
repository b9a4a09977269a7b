//! tb_audit_spec
//!
//! Strongly-typed audit events for the message pipeline, redactor, clone
//! cache, and matcher. Each event is hash-chained by `tb_audit_log`; this
//! crate only defines the shapes.
//!
//! NOTE: schema_version increments are per-event, not global.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `(channel_id, message_id)` turned into a stable string — the correlation
/// id echoed back to the user on an error reply (spec section 7).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn new(channel_id: &str, message_id: &str) -> Self {
        Self(format!("{channel_id}:{message_id}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoId(pub String);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingResult {
    NoTraceback,
    ExistingIssueLinked,
    NewIssueCreated,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageReceived {
    pub schema_version: u8,
    pub correlation_id: CorrelationId,
    pub ts: f64,
    pub repo: RepoId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateMessageSkipped {
    pub schema_version: u8,
    pub correlation_id: CorrelationId,
    pub ts: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracebackParsed {
    pub schema_version: u8,
    pub correlation_id: CorrelationId,
    pub ts: f64,
    pub signature: String,
    pub frame_count: u32,
    pub is_chained: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoTracebackDetected {
    pub schema_version: u8,
    pub correlation_id: CorrelationId,
    pub ts: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueSearchPerformed {
    pub schema_version: u8,
    pub correlation_id: CorrelationId,
    pub ts: f64,
    pub repo: RepoId,
    pub query_hash: String,
    pub cache_hit: bool,
    pub result_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueMatched {
    pub schema_version: u8,
    pub correlation_id: CorrelationId,
    pub ts: f64,
    pub repo: RepoId,
    pub issue_number: u64,
    pub confidence: f64,
    pub from_fingerprint_cache: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneAcquired {
    pub schema_version: u8,
    pub correlation_id: CorrelationId,
    pub ts: f64,
    pub repo: RepoId,
    pub cache_hit: bool,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneFailed {
    pub schema_version: u8,
    pub correlation_id: CorrelationId,
    pub ts: f64,
    pub repo: RepoId,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeContextExtracted {
    pub schema_version: u8,
    pub correlation_id: CorrelationId,
    pub ts: f64,
    pub repo: RepoId,
    pub file_count: u32,
    pub dropped_path_traversal: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsRedacted {
    pub schema_version: u8,
    pub correlation_id: CorrelationId,
    pub ts: f64,
    pub pattern_family: String,
    pub match_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmAnalysisPerformed {
    pub schema_version: u8,
    pub correlation_id: CorrelationId,
    pub ts: f64,
    pub model_name: String,
    pub confidence: f64,
    pub severity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmOutputRejected {
    pub schema_version: u8,
    pub correlation_id: CorrelationId,
    pub ts: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueCreated {
    pub schema_version: u8,
    pub correlation_id: CorrelationId,
    pub ts: f64,
    pub repo: RepoId,
    pub issue_number: u64,
    pub fingerprint_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionApplied {
    pub schema_version: u8,
    pub correlation_id: CorrelationId,
    pub ts: f64,
    pub reaction: String,
    pub added: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyPosted {
    pub schema_version: u8,
    pub correlation_id: CorrelationId,
    pub ts: f64,
    pub result: ProcessingResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineErrored {
    pub schema_version: u8,
    pub correlation_id: CorrelationId,
    pub ts: f64,
    pub fault: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneCacheEvicted {
    pub schema_version: u8,
    pub ts: f64,
    pub repo: RepoId,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum AuditEvent {
    MessageReceived(MessageReceived),
    DuplicateMessageSkipped(DuplicateMessageSkipped),
    TracebackParsed(TracebackParsed),
    NoTracebackDetected(NoTracebackDetected),
    IssueSearchPerformed(IssueSearchPerformed),
    IssueMatched(IssueMatched),
    CloneAcquired(CloneAcquired),
    CloneFailed(CloneFailed),
    CodeContextExtracted(CodeContextExtracted),
    SecretsRedacted(SecretsRedacted),
    LlmAnalysisPerformed(LlmAnalysisPerformed),
    LlmOutputRejected(LlmOutputRejected),
    IssueCreated(IssueCreated),
    ReactionApplied(ReactionApplied),
    ReplyPosted(ReplyPosted),
    PipelineErrored(PipelineErrored),
    CloneCacheEvicted(CloneCacheEvicted),
}

/// Stable UUID derived from a string (used when callers need a UUID-shaped
/// id for a thing that is really a composite string key).
pub fn stable_uuid(seed: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes())
}
