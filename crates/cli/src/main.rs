use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tb_common::metrics::MetricsRegistry;
use tb_pipeline::{Pipeline, PipelineConfig, ReactionSet, RepoPolicy};
use thiserror::Error;

#[derive(Debug, Error)]
enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("audit error: {0}")]
    Audit(#[from] tb_audit_log::AuditLogError),
    #[error("redaction error: {0}")]
    Redaction(#[from] tb_redactor::RedactionError),
    #[error("provider error: {0}")]
    Provider(#[from] tb_providers::ProviderError),
    #[error("traceback not found in input")]
    NoTraceback,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct MatchWeightsConfig {
    type_match: f64,
    msg_match: f64,
    frame_overlap: f64,
    semantic: f64,
}

impl Default for MatchWeightsConfig {
    fn default() -> Self {
        Self { type_match: 0.3, msg_match: 0.4, frame_overlap: 0.2, semantic: 0.1 }
    }
}

/// Everything the `run` subcommand needs. Loaded from an optional TOML
/// file, then secrets (API keys, tokens) are pulled from the environment
/// (populated by `dotenvy` from a `.env` file if present) so they never
/// have to live in a config file that might get checked in.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct TriageConfig {
    confidence_threshold: f64,
    processing_timeout_secs: u64,
    message_id_ttl_secs: u64,
    fingerprint_ttl_secs: u64,
    max_concurrent: usize,
    shutdown_timeout_secs: u64,
    clone_cache_sweep_interval_secs: u64,
    clone_cache_ttl_secs: u64,
    clone_cache_dir: PathBuf,
    clone_cache_max_total_bytes: u64,
    clone_depth: Option<u32>,
    clone_timeout_secs: u64,
    clone_size_quota_bytes: u64,
    context_lines: u32,
    include_files: Vec<String>,
    include_file_max_lines: usize,
    token_budget: usize,
    match_weights: MatchWeightsConfig,
    default_repo: Option<String>,
    channel_repos: HashMap<String, String>,
    allowed_repos: HashSet<String>,
    llm_base_url: String,
    llm_model: String,
    llm_max_context_tokens: u64,
    audit_log_path: PathBuf,
    use_stub_providers: bool,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.85,
            processing_timeout_secs: 300,
            message_id_ttl_secs: 300,
            fingerprint_ttl_secs: 300,
            max_concurrent: 5,
            shutdown_timeout_secs: 30,
            clone_cache_sweep_interval_secs: 60,
            clone_cache_ttl_secs: 3600,
            clone_cache_dir: std::env::temp_dir().join("triage-agent-clones"),
            clone_cache_max_total_bytes: 2 * 1024 * 1024 * 1024,
            clone_depth: Some(1),
            clone_timeout_secs: 60,
            clone_size_quota_bytes: 500 * 1024 * 1024,
            context_lines: 15,
            include_files: vec!["README.md".to_string()],
            include_file_max_lines: 200,
            token_budget: 8_000,
            match_weights: MatchWeightsConfig::default(),
            default_repo: None,
            channel_repos: HashMap::new(),
            allowed_repos: HashSet::new(),
            llm_base_url: "http://127.0.0.1:11434".to_string(),
            llm_model: "gpt-4o-mini".to_string(),
            llm_max_context_tokens: 32_000,
            audit_log_path: PathBuf::from("triage-agent-audit.jsonl"),
            use_stub_providers: true,
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<TriageConfig, CliError> {
    match path {
        Some(p) => {
            let text = std::fs::read_to_string(p)?;
            Ok(toml::from_str(&text)?)
        }
        None => Ok(TriageConfig::default()),
    }
}

#[derive(Parser)]
#[command(name = "triage-agent", version, about = "Chat-driven Python error triage agent")]
struct Args {
    /// Path to a TOML config file. Defaults are used for anything absent.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the agent orchestrator and block until a shutdown signal.
    Run,

    /// Parse a traceback from a file and print the detected signature.
    ParseTraceback {
        #[arg(long)]
        input: PathBuf,
    },

    /// Run the secret redactor over a file and print the redacted text.
    Redact {
        #[arg(long)]
        input: PathBuf,
    },

    /// Verify an audit log's hash chain.
    VerifyAudit {
        #[arg(long)]
        audit_log: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(e) = run().await {
        eprintln!("ERROR: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    match args.cmd {
        Command::Run => run_agent(config).await,
        Command::ParseTraceback { input } => parse_traceback_cmd(&input),
        Command::Redact { input } => redact_cmd(&input),
        Command::VerifyAudit { audit_log } => {
            let last = tb_audit_log::verify_log(audit_log)?;
            println!("{last}");
            Ok(())
        }
    }
}

fn parse_traceback_cmd(input: &PathBuf) -> Result<(), CliError> {
    let text = std::fs::read_to_string(input)?;
    let parsed = tb_traceback::parse(&text).map_err(|_| CliError::NoTraceback)?;
    let summary = serde_json::json!({
        "exception_type": parsed.exception_type,
        "exception_message": parsed.exception_message,
        "is_chained": parsed.is_chained,
        "frame_count": parsed.frames.len(),
        "signature": parsed.signature(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn redact_cmd(input: &PathBuf) -> Result<(), CliError> {
    let text = std::fs::read_to_string(input)?;
    let metrics = MetricsRegistry::new();
    let redacted = tb_redactor::redact(&text, &metrics)?;
    println!("{}", redacted.text);
    if !redacted.hits.is_empty() {
        eprintln!("redacted {} secret(s) across {:?}", redacted.hits.len(), redacted.families_matched());
    }
    Ok(())
}

async fn run_agent(config: TriageConfig) -> Result<(), CliError> {
    let metrics = Arc::new(MetricsRegistry::new());

    let audit = Arc::new(tokio::sync::Mutex::new(tb_audit_log::AuditAppender::open(&config.audit_log_path)?));

    let clone_cache = Arc::new(tb_clonecache::CloneCache::new(
        config.clone_cache_dir.clone(),
        Duration::from_secs(config.clone_cache_ttl_secs),
        config.clone_cache_max_total_bytes,
    ));

    let (chat, vcs, llm): (
        Arc<dyn tb_providers::ChatProvider>,
        Arc<dyn tb_providers::VCSProvider>,
        Arc<dyn tb_providers::LLMProvider>,
    ) = if config.use_stub_providers {
        (
            Arc::new(tb_providers::StubChatProvider),
            Arc::new(tb_providers::StubVcsProvider { canned_candidates: vec![] }),
            Arc::new(tb_providers::StubLlmProvider),
        )
    } else {
        let github_token = std::env::var("GITHUB_TOKEN").unwrap_or_default();
        let llm_api_key = std::env::var("LLM_API_KEY").ok();
        (
            Arc::new(tb_providers::StubChatProvider),
            Arc::new(tb_providers::GithubVcsProvider::new(github_token)?),
            Arc::new(tb_providers::OpenAiCompatLlmProvider::new(
                config.llm_base_url.clone(),
                llm_api_key,
                config.llm_model.clone(),
                config.llm_max_context_tokens,
            )),
        )
    };

    let repo_policy = RepoPolicy {
        channel_repos: config.channel_repos.clone(),
        default_repo: config.default_repo.clone(),
        allowed_repos: config.allowed_repos.clone(),
    };

    let pipeline_config = PipelineConfig {
        confidence_threshold: config.confidence_threshold,
        processing_timeout: Duration::from_secs(config.processing_timeout_secs),
        message_id_ttl: Duration::from_secs(config.message_id_ttl_secs),
        fingerprint_ttl: Duration::from_secs(config.fingerprint_ttl_secs),
        match_weights: tb_matcher::MatchWeights {
            type_match: config.match_weights.type_match,
            msg_match: config.match_weights.msg_match,
            frame_overlap: config.match_weights.frame_overlap,
            semantic: config.match_weights.semantic,
        },
        clone_opts: tb_safecmd::CloneOptions {
            depth: config.clone_depth,
            timeout: Duration::from_secs(config.clone_timeout_secs),
            size_quota_bytes: config.clone_size_quota_bytes,
        },
        extract_opts: tb_codeanalyzer::ExtractOptions {
            context_lines: config.context_lines,
            include_files: config.include_files.clone(),
            include_file_max_lines: config.include_file_max_lines,
            token_budget: config.token_budget,
        },
        reactions: ReactionSet::default(),
    };

    let pipeline = Arc::new(Pipeline::new(
        pipeline_config,
        repo_policy,
        chat,
        vcs,
        llm,
        clone_cache.clone(),
        audit,
        metrics.clone(),
    ));

    let mut agent = tb_agent::Agent::new(
        pipeline,
        clone_cache,
        metrics,
        tb_agent::AgentConfig {
            max_concurrent: config.max_concurrent,
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
            clone_cache_sweep_interval: Duration::from_secs(config.clone_cache_sweep_interval_secs),
            inbox_capacity: 256,
        },
    );

    let _sender = agent.start();
    tracing::info!("triage agent running, waiting for shutdown signal");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl_c");
    }

    tracing::info!("shutting down");
    agent.stop().await;
    Ok(())
}
