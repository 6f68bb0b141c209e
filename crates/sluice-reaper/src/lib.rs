use sluice_core::model::{DeadLetterEntry, ErrorCategory, ErrorDetail};
use sluice_protocol::{
    COMPLETIONS_STREAM, ORCHESTRATOR_GROUP, TASKS_STREAM, WORKER_GROUP, field,
};
use sluice_state::{DlqStore, StateError, StateStore, StreamMessage};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ReaperError {
    #[error(transparent)]
    State(#[from] StateError),
}

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub consumer_name: String,
    pub check_interval: Duration,
    pub min_idle: Duration,
    pub batch_size: usize,
    /// Tasks whose payload retry_count exceeds this are parked in the
    /// DLQ instead of being resurrected, so a permanently poisoned
    /// message cannot loop forever.
    pub max_reclaims: u32,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            consumer_name: format!("reaper-{}", short_id()),
            check_interval: Duration::from_secs(5),
            min_idle: Duration::from_millis(25_000),
            batch_size: 100,
            max_reclaims: 10,
        }
    }
}

impl ReaperConfig {
    /// Defaults overridden by `SLUICE_REAPER_*` environment variables
    /// where present.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(interval_secs) = env_parse("SLUICE_REAPER_CHECK_INTERVAL_SECONDS") {
            config.check_interval = Duration::from_secs(interval_secs);
        }
        if let Some(min_idle_ms) = env_parse("SLUICE_REAPER_MIN_IDLE_MS") {
            config.min_idle = Duration::from_millis(min_idle_ms);
        }
        if let Some(batch_size) = env_parse("SLUICE_REAPER_BATCH_SIZE") {
            config.batch_size = batch_size;
        }
        if let Some(max_reclaims) = env_parse("SLUICE_REAPER_MAX_RECLAIMS") {
            config.max_reclaims = max_reclaims;
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|raw| raw.parse().ok())
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    pub resurrected: usize,
    pub dead_lettered: usize,
}

/// Zombie recovery: reclaims messages whose consumer went silent and
/// re-queues them under a fresh id (resurrect), acknowledging the stuck
/// delivery (bury). Operates purely on pending-entry metadata plus the
/// `retry_count` payload field; business state is never consulted.
pub struct Reaper {
    state: Arc<dyn StateStore>,
    dlq: Arc<dyn DlqStore>,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(state: Arc<dyn StateStore>, dlq: Arc<dyn DlqStore>, config: ReaperConfig) -> Self {
        Self { state, dlq, config }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ReaperError> {
        info!(
            consumer = %self.config.consumer_name,
            min_idle_ms = self.config.min_idle.as_millis() as u64,
            "reaper starting"
        );
        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.pass().await {
                        error!(error = %err, "reaper pass failed");
                    }
                }
            }
        }
        info!(consumer = %self.config.consumer_name, "reaper shutdown complete");
        Ok(())
    }

    /// One reclaim sweep over both streams.
    pub async fn pass(&self) -> Result<PassSummary, ReaperError> {
        let mut summary = self.sweep(TASKS_STREAM, WORKER_GROUP, true).await?;
        let completions = self
            .sweep(COMPLETIONS_STREAM, ORCHESTRATOR_GROUP, false)
            .await?;
        summary.resurrected += completions.resurrected;
        summary.dead_lettered += completions.dead_lettered;
        if summary != PassSummary::default() {
            info!(
                resurrected = summary.resurrected,
                dead_lettered = summary.dead_lettered,
                "reaper pass reclaimed zombie messages"
            );
        }
        Ok(summary)
    }

    async fn sweep(
        &self,
        stream: &str,
        group: &str,
        check_poison: bool,
    ) -> Result<PassSummary, ReaperError> {
        let reclaimed = self
            .state
            .stream_reclaim(
                stream,
                group,
                &self.config.consumer_name,
                self.config.min_idle,
                self.config.batch_size,
            )
            .await?;

        let mut summary = PassSummary::default();
        for message in reclaimed {
            if check_poison && self.is_poisoned(&message) {
                self.bury_poisoned(&message).await?;
                self.state
                    .stream_ack(stream, group, &[message.id.clone()])
                    .await?;
                summary.dead_lettered += 1;
                continue;
            }

            // Resurrect under a new id, then bury the stuck delivery.
            self.state
                .stream_publish(stream, message.fields.clone())
                .await?;
            self.state
                .stream_ack(stream, group, &[message.id.clone()])
                .await?;
            debug!(stream, id = %message.id, "resurrected zombie message");
            summary.resurrected += 1;
        }
        Ok(summary)
    }

    fn is_poisoned(&self, message: &StreamMessage) -> bool {
        field(&message.fields, "retry_count")
            .and_then(|raw| raw.parse::<u32>().ok())
            .is_some_and(|retry_count| retry_count > self.config.max_reclaims)
    }

    /// Best-effort DLQ entry from raw payload fields; the reaper does
    /// not require a decodable message to park it.
    async fn bury_poisoned(&self, message: &StreamMessage) -> Result<(), ReaperError> {
        let execution_id = field(&message.fields, "execution_id")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(Uuid::nil());
        let node_id = field(&message.fields, "node_id").unwrap_or("unknown");
        let handler = field(&message.fields, "handler").unwrap_or("unknown");
        let resolved_config = field(&message.fields, "config")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(Value::Null);
        let retry_count = field(&message.fields, "retry_count")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);

        let error = ErrorDetail::new(
            ErrorCategory::Unknown,
            format!(
                "message exceeded the reaper reclaim cap of {}",
                self.config.max_reclaims
            ),
        )
        .non_retryable();
        let entry = DeadLetterEntry::new(
            execution_id,
            node_id,
            handler,
            Value::Null,
            resolved_config,
            error,
            retry_count,
        );
        self.dlq.push(&entry).await?;
        warn!(
            %execution_id,
            node_id,
            handler,
            retry_count,
            "poisoned message parked in the dead-letter store"
        );
        Ok(())
    }
}
