//! tb_agent
//!
//! The orchestrator: owns the message pipeline, the clone cache, and a
//! bounded worker pool. `start()` spawns a drainer that pulls chat
//! messages off a channel and, as permits free up, fans each one out to
//! `tb_pipeline::Pipeline::handle_message` on its own task. `stop()` is
//! idempotent and graceful — it stops accepting new work, waits up to
//! `shutdown_timeout` for in-flight tasks to finish, then force-cancels
//! whatever's left.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tb_common::metrics::MetricsRegistry;
use tb_pipeline::{ChatMessage, Pipeline};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub max_concurrent: usize,
    pub shutdown_timeout: Duration,
    pub clone_cache_sweep_interval: Duration,
    pub inbox_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            shutdown_timeout: Duration::from_secs(30),
            clone_cache_sweep_interval: Duration::from_secs(60),
            inbox_capacity: 256,
        }
    }
}

pub struct Agent {
    pipeline: Arc<Pipeline>,
    clone_cache: Arc<tb_clonecache::CloneCache>,
    metrics: Arc<MetricsRegistry>,
    config: AgentConfig,
    semaphore: Arc<Semaphore>,
    tasks: Arc<Mutex<JoinSet<()>>>,
    sender: Option<mpsc::Sender<ChatMessage>>,
    drainer: Option<tokio::task::JoinHandle<()>>,
    sweeper: Option<tokio::task::JoinHandle<()>>,
    stopped: AtomicBool,
}

impl Agent {
    pub fn new(
        pipeline: Arc<Pipeline>,
        clone_cache: Arc<tb_clonecache::CloneCache>,
        metrics: Arc<MetricsRegistry>,
        config: AgentConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            pipeline,
            clone_cache,
            metrics,
            config,
            semaphore,
            tasks: Arc::new(Mutex::new(JoinSet::new())),
            sender: None,
            drainer: None,
            sweeper: None,
            stopped: AtomicBool::new(false),
        }
    }

    /// Start accepting messages. Returns a sender clients (the chat
    /// adapter) use to push inbound messages; dropping all clones of the
    /// sender lets the drainer wind down naturally once the queue drains.
    pub fn start(&mut self) -> mpsc::Sender<ChatMessage> {
        let (tx, mut rx) = mpsc::channel::<ChatMessage>(self.config.inbox_capacity);

        let pipeline = self.pipeline.clone();
        let semaphore = self.semaphore.clone();
        let tasks = self.tasks.clone();
        let metrics = self.metrics.clone();

        let drainer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break, // semaphore closed, shutting down
                };
                let pipeline = pipeline.clone();
                let metrics = metrics.clone();
                let mut guard = tasks.lock().await;
                guard.spawn(async move {
                    metrics.incr_counter("pipeline_messages_started");
                    let outcome = pipeline.handle_message(msg).await;
                    tracing::debug!(?outcome, "message processed");
                    metrics.incr_counter("pipeline_messages_finished");
                    drop(permit);
                });
            }
        });

        let clone_cache = self.clone_cache.clone();
        let sweep_interval = self.config.clone_cache_sweep_interval;
        let metrics_for_sweep = self.metrics.clone();
        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                interval.tick().await;
                let evicted = clone_cache.sweep();
                if !evicted.is_empty() {
                    tracing::info!(count = evicted.len(), "clone cache eviction sweep");
                }
                metrics_for_sweep.set_gauge("clone_cache_entries", clone_cache.len() as i64);
            }
        });

        self.sender = Some(tx.clone());
        self.drainer = Some(drainer);
        self.sweeper = Some(sweeper);
        tx
    }

    /// Graceful shutdown: stop accepting new work, wait up to
    /// `shutdown_timeout` for in-flight pipeline tasks to finish on their
    /// own, then abort anything still running. Safe to call more than
    /// once — subsequent calls are a no-op.
    pub async fn stop(&mut self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.sender.take(); // closes the channel; drainer exits once queue drains
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
        if let Some(drainer) = self.drainer.take() {
            let _ = tokio::time::timeout(self.config.shutdown_timeout, drainer).await;
        }

        let mut guard = self.tasks.lock().await;
        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            match tokio::time::timeout(deadline - tokio::time::Instant::now(), guard.join_next()).await {
                Ok(Some(_)) => continue,
                Ok(None) => break, // no more tasks
                Err(_) => break,   // deadline hit mid-wait
            }
        }
        guard.abort_all();
        while guard.join_next().await.is_some() {}

        self.clone_cache.sweep();
    }

    pub fn active_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}
