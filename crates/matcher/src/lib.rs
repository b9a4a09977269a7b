//! tb_matcher
//!
//! Turns a parsed traceback into an issue search query, scores candidate
//! issues the VCS provider returns against that traceback on four signals,
//! and produces a confidence-ordered list the pipeline uses to decide
//! "link to existing issue" vs "file a new one".
//!
//! This crate has no opinion on how candidates were fetched — the caller
//! (the pipeline, via a VCS provider) supplies them. That keeps the
//! scoring logic pure and trivially testable.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tb_traceback::ParsedTraceback;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueState {
    Open,
    Closed,
}

#[derive(Debug, Clone)]
pub struct IssueCandidate {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub state: IssueState,
}

/// Per-signal weights; must sum to 1.0 (spec default: 0.3/0.4/0.2/0.1).
#[derive(Debug, Clone, Copy)]
pub struct MatchWeights {
    pub type_match: f64,
    pub msg_match: f64,
    pub frame_overlap: f64,
    pub semantic: f64,
}

impl Default for MatchWeights {
    fn default() -> Self {
        Self { type_match: 0.3, msg_match: 0.4, frame_overlap: 0.2, semantic: 0.1 }
    }
}

impl MatchWeights {
    pub fn is_normalized(&self) -> bool {
        (self.type_match + self.msg_match + self.frame_overlap + self.semantic - 1.0).abs() < 1e-6
    }
}

#[derive(Debug, Clone)]
pub struct MatchResult {
    pub issue_number: u64,
    pub confidence: f64,
    pub state: IssueState,
    /// Human-readable justifications, only populated for signals that
    /// cleared the 0.2 threshold (spec: "match reasons" are for a user-
    /// facing reply, not a debug dump of every signal).
    pub reasons: Vec<String>,
}

/// Build the issue-tracker search query for a parsed traceback: the
/// exception type is a mandatory term, the first 80 characters of the
/// exception message are quoted (reduces false negatives from long,
/// highly specific messages), and up to 3 distinct project-frame
/// basenames are appended as OR terms.
pub fn build_query(parsed: &ParsedTraceback) -> String {
    let mut terms = vec![parsed.exception_type.clone()];

    let msg_snippet: String = parsed.exception_message.chars().take(80).collect();
    if !msg_snippet.trim().is_empty() {
        terms.push(format!("\"{msg_snippet}\""));
    }

    let mut seen = HashSet::new();
    for frame in parsed.project_frames() {
        let base = frame.basename().to_string();
        if seen.insert(base.clone()) {
            terms.push(base);
        }
        if seen.len() >= 3 {
            break;
        }
    }

    terms.join(" ")
}

fn tokenize(s: &str) -> HashSet<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

const MSG_MATCH_FLOOR: f64 = 0.1;
const REASON_THRESHOLD: f64 = 0.2;

/// Score `candidates` against `parsed`. `semantic_scores` is an optional
/// per-candidate LLM-derived similarity (spec section 6's
/// `calculate_similarity`); candidates missing an entry get a semantic
/// score of 0. Results are sorted by confidence descending with
/// open-before-closed, then lower issue number, as tie-breakers; ties
/// that remain preserve input order (the sort below is stable).
pub fn score_candidates(
    parsed: &ParsedTraceback,
    candidates: &[IssueCandidate],
    weights: MatchWeights,
    semantic_scores: &HashMap<u64, f64>,
) -> Vec<MatchResult> {
    let exc_type_lower = parsed.exception_type.to_lowercase();
    let msg_tokens = tokenize(&parsed.exception_message);
    let project_basenames: HashSet<String> =
        parsed.project_frames().iter().map(|f| f.basename().to_lowercase()).collect();

    let mut results: Vec<MatchResult> = candidates
        .iter()
        .map(|candidate| {
            let haystack = format!("{} {}", candidate.title, candidate.body).to_lowercase();

            let type_match = if haystack.contains(&exc_type_lower) { 1.0 } else { 0.0 };

            let candidate_tokens = tokenize(&haystack);
            let raw_msg_match = jaccard(&msg_tokens, &candidate_tokens);
            let msg_match = if raw_msg_match > 0.0 { raw_msg_match.max(MSG_MATCH_FLOOR) } else { 0.0 };

            let frame_hits = project_basenames.iter().filter(|b| haystack.contains(b.as_str())).count();
            let frame_overlap = if project_basenames.is_empty() {
                0.0
            } else {
                frame_hits as f64 / project_basenames.len() as f64
            };

            let semantic = semantic_scores.get(&candidate.number).copied().unwrap_or(0.0);

            let confidence = weights.type_match * type_match
                + weights.msg_match * msg_match
                + weights.frame_overlap * frame_overlap
                + weights.semantic * semantic;

            let mut reasons = Vec::new();
            if type_match * weights.type_match >= REASON_THRESHOLD {
                reasons.push(format!("exception type \"{}\" appears in the issue", parsed.exception_type));
            }
            if msg_match * weights.msg_match >= REASON_THRESHOLD {
                reasons.push("error message closely matches the issue text".to_string());
            }
            if frame_overlap * weights.frame_overlap >= REASON_THRESHOLD {
                reasons.push(format!("{frame_hits} matching source file(s) referenced"));
            }
            if semantic * weights.semantic >= REASON_THRESHOLD {
                reasons.push("model judged the issue semantically similar".to_string());
            }

            MatchResult { issue_number: candidate.number, confidence, state: candidate.state, reasons }
        })
        .collect();

    results.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap()
            .then_with(|| match (a.state, b.state) {
                (IssueState::Open, IssueState::Closed) => std::cmp::Ordering::Less,
                (IssueState::Closed, IssueState::Open) => std::cmp::Ordering::Greater,
                _ => std::cmp::Ordering::Equal,
            })
            .then_with(|| a.issue_number.cmp(&b.issue_number))
    });

    results
}

/// TTL cache for issue-search results, keyed by `(repo, query)`. Avoids
/// hammering the VCS provider's search endpoint when several users paste
/// the same crash within the same window.
pub struct SearchCache {
    ttl: Duration,
    entries: std::sync::Mutex<HashMap<(String, String), (Instant, Vec<IssueCandidate>)>>,
}

impl SearchCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: std::sync::Mutex::new(HashMap::new()) }
    }

    pub fn with_default_ttl() -> Self {
        Self::new(Duration::from_secs(300))
    }

    pub fn get(&self, repo: &str, query: &str) -> Option<Vec<IssueCandidate>> {
        let mut guard = self.entries.lock().expect("search cache mutex poisoned");
        let key = (repo.to_string(), query.to_string());
        if let Some((inserted_at, value)) = guard.get(&key) {
            if inserted_at.elapsed() < self.ttl {
                return Some(value.clone());
            }
            guard.remove(&key);
        }
        None
    }

    pub fn put(&self, repo: &str, query: &str, candidates: Vec<IssueCandidate>) {
        let mut guard = self.entries.lock().expect("search cache mutex poisoned");
        guard.insert((repo.to_string(), query.to_string()), (Instant::now(), candidates));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tb_traceback::parse;

    const SIMPLE: &str = r#"Traceback (most recent call last):
  File "/app/handlers/orders.py", line 42, in process_order
    total = compute_total(order)
IndexError: list index out of range"#;

    #[test]
    fn query_includes_type_message_and_frames() {
        let parsed = parse(SIMPLE).unwrap();
        let q = build_query(&parsed);
        assert!(q.contains("IndexError"));
        assert!(q.contains("list index out of range"));
        assert!(q.contains("orders.py"));
    }

    #[test]
    fn exact_type_and_message_match_scores_highest() {
        let parsed = parse(SIMPLE).unwrap();
        let candidates = vec![
            IssueCandidate {
                number: 10,
                title: "IndexError: list index out of range in orders.py".into(),
                body: "crashes in process_order".into(),
                state: IssueState::Open,
            },
            IssueCandidate {
                number: 11,
                title: "unrelated bug".into(),
                body: "nothing to do with this".into(),
                state: IssueState::Open,
            },
        ];
        let results = score_candidates(&parsed, &candidates, MatchWeights::default(), &HashMap::new());
        assert_eq!(results[0].issue_number, 10);
        assert!(results[0].confidence > results[1].confidence);
        assert!(!results[0].reasons.is_empty());
    }

    #[test]
    fn open_issue_beats_closed_at_equal_confidence() {
        let parsed = parse(SIMPLE).unwrap();
        let candidates = vec![
            IssueCandidate { number: 5, title: "x".into(), body: "y".into(), state: IssueState::Closed },
            IssueCandidate { number: 6, title: "x".into(), body: "y".into(), state: IssueState::Open },
        ];
        let results = score_candidates(&parsed, &candidates, MatchWeights::default(), &HashMap::new());
        assert_eq!(results[0].issue_number, 6);
        assert_eq!(results[0].state, IssueState::Open);
    }

    #[test]
    fn lower_issue_number_breaks_remaining_ties() {
        let parsed = parse(SIMPLE).unwrap();
        let candidates = vec![
            IssueCandidate { number: 20, title: "x".into(), body: "y".into(), state: IssueState::Open },
            IssueCandidate { number: 7, title: "x".into(), body: "y".into(), state: IssueState::Open },
        ];
        let results = score_candidates(&parsed, &candidates, MatchWeights::default(), &HashMap::new());
        assert_eq!(results[0].issue_number, 7);
    }

    #[test]
    fn default_weights_are_normalized() {
        assert!(MatchWeights::default().is_normalized());
    }

    #[test]
    fn search_cache_respects_ttl() {
        let cache = SearchCache::new(Duration::from_millis(20));
        cache.put("acme/widgets", "q", vec![]);
        assert!(cache.get("acme/widgets", "q").is_some());
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get("acme/widgets", "q").is_none());
    }
}
