//! tb_common
//!
//! Shared utilities for the triage agent workspace:
//! - canonical JSON serialization + SHA-256 hashing (used by the audit log
//!   and by the matcher/clone-cache to build deterministic keys)
//! - the cross-cutting `FaultKind` error taxonomy (spec section 7)
//! - a small metrics registry every component reports into
//!
//! IMPORTANT: Do not "pretty print". Hashes must be computed over canonical bytes.

pub mod metrics;

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CanonError {
    #[error("failed to serialize json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialize to canonical JSON bytes:
/// - stable key ordering (we enforce sorting via Value roundtrip)
/// - no whitespace
/// - UTF-8
pub fn canonical_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonError> {
    let v = serde_json::to_value(value)?;
    let sorted = sort_json_value(v);
    Ok(serde_json::to_vec(&sorted)?)
}

/// Return "sha256:<hex>" of canonical JSON bytes.
pub fn sha256_canonical_json<T: Serialize>(value: &T) -> Result<String, CanonError> {
    let bytes = canonical_json_bytes(value)?;
    Ok(sha256_bytes(&bytes))
}

/// Return "sha256:<hex>" of raw bytes.
pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    format!("sha256:{}", hex::encode(digest))
}

fn sort_json_value(v: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match v {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in entries {
                out.insert(k, sort_json_value(v));
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.into_iter().map(sort_json_value).collect()),
        other => other,
    }
}

/// Cross-cutting fault taxonomy (spec section 7). Every crate's own error
/// enum maps into one of these via a `classify()`-style function so the
/// pipeline can decide retry/terminal behavior without matching on every
/// crate's concrete error type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultKind {
    // Input
    ParseError,
    InvalidInput,
    PolicyViolation,
    // External service
    Authentication,
    Permission,
    NotFound,
    RateLimit { retry_after_secs: u64 },
    CommandTimeout,
    NetworkError,
    // Resource
    CloneTooLarge,
    PathTraversal,
    TokenBudgetExceeded,
    // Safety
    RedactionFailure,
    LLMOutputInvalid,
    PromptInjectionSuspected,
    // Lifecycle
    Cancelled,
    TimedOut,
}

impl FaultKind {
    /// Only network/timeout external faults are retried per spec section 5;
    /// rate limits honor `retry_after` instead of the backoff schedule.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FaultKind::NetworkError | FaultKind::CommandTimeout)
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, FaultKind::RateLimit { .. })
    }

    /// User-safe category string for error replies (spec section 7: never
    /// leak stack traces or raw external-service bodies to chat).
    pub fn user_category(&self) -> &'static str {
        match self {
            FaultKind::ParseError => "couldn't parse traceback",
            FaultKind::InvalidInput => "invalid request",
            FaultKind::PolicyViolation => "repository not allowed",
            FaultKind::Authentication | FaultKind::Permission | FaultKind::NotFound => {
                "couldn't reach issue service"
            }
            FaultKind::RateLimit { .. } => "issue service is rate-limited, try again later",
            FaultKind::CommandTimeout | FaultKind::NetworkError => "couldn't reach issue service",
            FaultKind::CloneTooLarge => "repository too large to analyze",
            FaultKind::PathTraversal
            | FaultKind::TokenBudgetExceeded
            | FaultKind::RedactionFailure
            | FaultKind::LLMOutputInvalid
            | FaultKind::PromptInjectionSuspected => "internal error — see logs",
            FaultKind::Cancelled | FaultKind::TimedOut => "timed out",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Obj {
        b: u32,
        a: u32,
    }

    #[test]
    fn canonical_hash_is_stable() {
        let x = Obj { b: 2, a: 1 };
        let y = Obj { a: 1, b: 2 };
        let hx = sha256_canonical_json(&x).unwrap();
        let hy = sha256_canonical_json(&y).unwrap();
        assert_eq!(hx, hy);
    }

    #[test]
    fn retryable_faults_are_exactly_network_and_timeout() {
        assert!(FaultKind::NetworkError.is_retryable());
        assert!(FaultKind::CommandTimeout.is_retryable());
        assert!(!FaultKind::Authentication.is_retryable());
        assert!(!FaultKind::RateLimit { retry_after_secs: 5 }.is_retryable());
    }

    #[test]
    fn user_category_never_echoes_internal_detail() {
        for kind in [
            FaultKind::PathTraversal,
            FaultKind::RedactionFailure,
            FaultKind::LLMOutputInvalid,
        ] {
            assert_eq!(kind.user_category(), "internal error — see logs");
        }
    }
}
