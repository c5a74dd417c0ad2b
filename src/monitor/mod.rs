//! Channel health: attempt signals, automatic disable/enable and channel tests.

pub mod sweep;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::app::config::HealthConfig;
use crate::channels::{AutoDisableInfo, ChannelStatus, ChannelStore, KeySelector};
use crate::error::{FailureKind, RelayError, Result};
use crate::supervisor;

pub use sweep::{ChannelTester, SweepScope, TestReport};

const PERMANENT_ERROR_TYPES: &[&str] = &[
    "insufficient_quota",
    "authentication_error",
    "permission_error",
    "forbidden",
];
const PERMANENT_ERROR_CODES: &[&str] = &["invalid_api_key", "account_deactivated"];

/// Outcome of one attempt, reported by the dispatch loop.
#[derive(Debug, Clone)]
pub struct HealthSignal {
    pub channel_id: i64,
    pub success: bool,
    pub status_code: Option<u16>,
    pub error: Option<RelayError>,
    pub key_index: Option<usize>,
    pub model: String,
    pub correlation_id: String,
}

/// Delivers operator notifications about channel state changes.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, content: &str);
}

/// Writes notifications to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, subject: &str, content: &str) {
        info!("Notification: {} - {}", subject, content);
    }
}

pub struct HealthMonitor {
    config: HealthConfig,
    store: Arc<ChannelStore>,
    keys: Arc<KeySelector>,
    notifier: Arc<dyn Notifier>,
    sender: mpsc::Sender<HealthSignal>,
    keywords: Option<Regex>,
    windows: Mutex<HashMap<i64, VecDeque<bool>>>,
}

impl HealthMonitor {
    /// Returns the monitor and the receiving end of its signal queue.
    pub fn new(
        config: HealthConfig,
        store: Arc<ChannelStore>,
        keys: Arc<KeySelector>,
        notifier: Arc<dyn Notifier>,
    ) -> (Arc<Self>, mpsc::Receiver<HealthSignal>) {
        let (sender, receiver) = mpsc::channel(config.signal_buffer.max(1));
        let keywords = keyword_pattern(&config.disable_keywords);
        let monitor = Arc::new(Self {
            config,
            store,
            keys,
            notifier,
            sender,
            keywords,
            windows: Mutex::new(HashMap::new()),
        });
        (monitor, receiver)
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Queue a signal without waiting. A full queue drops it.
    pub fn emit(&self, signal: HealthSignal) {
        if let Err(e) = self.sender.try_send(signal) {
            match e {
                mpsc::error::TrySendError::Full(signal) => warn!(
                    request_id = %signal.correlation_id,
                    "Health signal queue full; dropped signal for channel {}",
                    signal.channel_id
                ),
                mpsc::error::TrySendError::Closed(_) => debug!("Health signal queue closed"),
            }
        }
    }

    pub fn spawn_worker(self: Arc<Self>, mut receiver: mpsc::Receiver<HealthSignal>) -> JoinHandle<()> {
        supervisor::spawn_supervised("health-monitor", async move {
            info!("Health monitor worker started");
            while let Some(signal) = receiver.recv().await {
                self.handle_signal(signal).await;
            }
            info!("Health monitor worker stopped");
        })
    }

    pub async fn handle_signal(&self, signal: HealthSignal) {
        if !signal.success {
            if let Some(err) = &signal.error {
                if self.is_permanent_error(err) {
                    self.handle_permanent_failure(signal.channel_id, signal.key_index, err, Some(&signal.model))
                        .await;
                    return;
                }
            }
        }

        if self.config.enable_metric_monitor {
            if let Some(rate) = self.record_outcome(signal.channel_id, signal.success) {
                let reason = format!(
                    "success rate {:.0}% below threshold {:.0}%",
                    rate * 100.0,
                    self.config.metric_success_rate_threshold * 100.0
                );
                if let Err(e) = self.disable_channel(signal.channel_id, &reason, None, Some(&signal.model)).await {
                    error!("Failed to disable channel {}: {}", signal.channel_id, e);
                }
            }
        }
    }

    /// Whether an error means the credential or account is unusable.
    pub fn is_permanent_error(&self, err: &RelayError) -> bool {
        if matches!(
            err.kind,
            FailureKind::Selection | FailureKind::KeyUnavailable | FailureKind::Caller
        ) {
            return false;
        }
        if err.status == 401 {
            return true;
        }
        if PERMANENT_ERROR_TYPES.contains(&err.error_type.as_str()) {
            return true;
        }
        if let Some(code) = err.code.as_deref() {
            if PERMANENT_ERROR_CODES.contains(&code) {
                return true;
            }
        }
        self.keywords
            .as_ref()
            .map(|pattern| pattern.is_match(&err.message))
            .unwrap_or(false)
    }

    /// Disable the failing key of a multi-key channel, or the whole channel.
    pub async fn handle_permanent_failure(
        &self,
        channel_id: i64,
        key_index: Option<usize>,
        err: &RelayError,
        model: Option<&str>,
    ) {
        let status_code = Some(err.status);
        let result = match key_index {
            Some(index) if self.may_disable(channel_id) => {
                match self.keys.disable_key(channel_id, index, &err.message, status_code, model).await {
                    Ok(outcome) if outcome.all_keys_disabled => {
                        self.disable_channel(channel_id, "all keys disabled", status_code, model).await
                    }
                    Ok(_) => Ok(false),
                    Err(e) => Err(e),
                }
            }
            Some(_) => Ok(false),
            None => self.disable_channel(channel_id, &err.message, status_code, model).await,
        };

        if let Err(e) = result {
            error!("Failed to apply permanent failure on channel {}: {}", channel_id, e);
        }
    }

    fn may_disable(&self, channel_id: i64) -> bool {
        self.config.automatic_disable_channel
            && self
                .store
                .get_channel_by_id(channel_id, true)
                .map(|c| c.auto_disable)
                .unwrap_or(false)
    }

    /// Moves an enabled channel to AutoDisabled. Returns true only for the
    /// caller whose transition took effect.
    pub async fn disable_channel(
        &self,
        channel_id: i64,
        reason: &str,
        status_code: Option<u16>,
        model: Option<&str>,
    ) -> Result<bool> {
        if !self.config.automatic_disable_channel {
            return Ok(false);
        }
        let channel = self.store.get_channel_by_id(channel_id, true)?;
        if !channel.auto_disable || channel.status != ChannelStatus::Enabled {
            return Ok(false);
        }

        let info = AutoDisableInfo {
            reason: reason.to_string(),
            time: Utc::now().timestamp(),
            model: model.map(str::to_string),
            status_code,
        };
        let changed = self
            .store
            .repository()
            .transition_status(channel_id, ChannelStatus::Enabled, ChannelStatus::AutoDisabled, Some(&info))
            .await?;
        self.store.reload(channel_id).await?;
        if !changed {
            return Ok(false);
        }

        warn!("Channel {} ({}) auto-disabled: {}", channel_id, channel.name, reason);
        self.notifier
            .notify(
                &format!("Channel {} ({}) has been disabled", channel.name, channel_id),
                &format!("Channel {} ({}) has been disabled, reason: {}", channel.name, channel_id, reason),
            )
            .await;
        Ok(true)
    }

    /// Moves an AutoDisabled channel back to Enabled.
    pub async fn enable_channel(&self, channel_id: i64) -> Result<bool> {
        if !self.config.automatic_enable_channel {
            return Ok(false);
        }
        let channel = self.store.get_channel_by_id(channel_id, true)?;
        if channel.status != ChannelStatus::AutoDisabled {
            return Ok(false);
        }

        let changed = self
            .store
            .repository()
            .transition_status(channel_id, ChannelStatus::AutoDisabled, ChannelStatus::Enabled, None)
            .await?;
        self.store.reload(channel_id).await?;
        if !changed {
            return Ok(false);
        }

        self.windows.lock().remove(&channel_id);
        info!("Channel {} ({}) re-enabled", channel_id, channel.name);
        self.notifier
            .notify(
                &format!("Channel {} ({}) has been enabled", channel.name, channel_id),
                &format!("Channel {} ({}) has been enabled", channel.name, channel_id),
            )
            .await;
        Ok(true)
    }

    pub async fn notify(&self, subject: &str, content: &str) {
        self.notifier.notify(subject, content).await;
    }

    /// Push one outcome into the channel's window. Returns the success rate
    /// when a full window falls below the threshold, resetting the window.
    fn record_outcome(&self, channel_id: i64, success: bool) -> Option<f64> {
        let size = self.config.metric_queue_size.max(1);
        let mut windows = self.windows.lock();
        let window = windows.entry(channel_id).or_default();
        window.push_back(success);
        while window.len() > size {
            window.pop_front();
        }
        if window.len() < size {
            return None;
        }

        let successes = window.iter().filter(|ok| **ok).count();
        let rate = successes as f64 / size as f64;
        if rate < self.config.metric_success_rate_threshold {
            window.clear();
            Some(rate)
        } else {
            None
        }
    }
}

fn keyword_pattern(keywords: &[String]) -> Option<Regex> {
    let alternatives: Vec<String> = keywords
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .map(regex::escape)
        .collect();
    if alternatives.is_empty() {
        return None;
    }
    match Regex::new(&format!("(?i){}", alternatives.join("|"))) {
        Ok(pattern) => Some(pattern),
        Err(e) => {
            warn!("Invalid disable keyword pattern: {}", e);
            None
        }
    }
}
