use chrono::Utc;
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::config::HealthConfig;
use crate::channels::{Channel, ChannelStatus, ChannelStore, KeySelector};
use crate::error::{Error, RelayError, Result};
use crate::monitor::HealthMonitor;
use crate::relay::{execute_attempt, AdaptorRegistry, RelayMeta};
use crate::supervisor;

const FALLBACK_TEST_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SweepScope {
    #[default]
    All,
    Enabled,
    Disabled,
}

impl SweepScope {
    fn includes(self, channel: &Channel) -> bool {
        match self {
            SweepScope::All => true,
            SweepScope::Enabled => channel.status == ChannelStatus::Enabled,
            SweepScope::Disabled => channel.status != ChannelStatus::Enabled,
        }
    }
}

impl FromStr for SweepScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "all" => Ok(SweepScope::All),
            "enabled" => Ok(SweepScope::Enabled),
            "disabled" => Ok(SweepScope::Disabled),
            other => Err(Error::validation(format!("Unknown test scope: {}", other))),
        }
    }
}

/// Result of testing one channel.
#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub success: bool,
    pub message: String,
    pub channel_id: i64,
    pub channel_name: String,
    pub model: String,
    /// Elapsed seconds.
    pub time: f64,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_multi_key: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_key_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_keys: Option<usize>,
}

impl TestReport {
    fn new(channel: &Channel, model: &str) -> Self {
        let multi_key = channel.multi_key.as_ref();
        Self {
            success: false,
            message: String::new(),
            channel_id: channel.id,
            channel_name: channel.name.clone(),
            model: model.to_string(),
            time: 0.0,
            timestamp: Utc::now().timestamp(),
            is_multi_key: multi_key.map(|_| true),
            used_key_index: None,
            total_keys: multi_key.map(|info| info.key_count),
        }
    }
}

/// Probes channels and feeds the results into the health policy.
pub struct ChannelTester {
    config: HealthConfig,
    store: Arc<ChannelStore>,
    keys: Arc<KeySelector>,
    registry: Arc<AdaptorRegistry>,
    monitor: Arc<HealthMonitor>,
    sweep_lock: Arc<Mutex<()>>,
}

impl ChannelTester {
    pub fn new(
        config: HealthConfig,
        store: Arc<ChannelStore>,
        keys: Arc<KeySelector>,
        registry: Arc<AdaptorRegistry>,
        monitor: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            config,
            store,
            keys,
            registry,
            monitor,
            sweep_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn test_channel(&self, channel_id: i64, model: Option<&str>) -> Result<TestReport> {
        let channel = self.store.get_channel_by_id(channel_id, true)?;
        let model = model
            .filter(|m| !m.is_empty())
            .or_else(|| channel.first_model())
            .unwrap_or(FALLBACK_TEST_MODEL)
            .to_string();
        let mut report = TestReport::new(&channel, &model);

        let mut adaptor = self.registry.create(channel.channel_type)?;
        let probe = match adaptor.probe_request(&model) {
            Some(probe) => probe,
            None => {
                report.message = format!("channel type {} does not support testing", adaptor.name());
                return Ok(report);
            }
        };

        let key = match self.keys.next_available_key(&channel) {
            Ok(key) => key,
            Err(e) => {
                report.message = e.to_string();
                return Ok(report);
            }
        };
        report.used_key_index = key.index.filter(|_| channel.is_multi_key());
        let key_index = key.index;

        let mut meta = RelayMeta::new(Uuid::new_v4().to_string(), 0, "", model.clone());
        meta.bind_channel(&channel, key);

        let start_time = Instant::now();
        let result = execute_attempt(adaptor.as_mut(), &meta, &probe).await;
        let elapsed = start_time.elapsed();
        report.time = elapsed.as_secs_f64();

        self.store
            .repository()
            .update_test_result(channel_id, elapsed.as_millis() as i64, Utc::now())
            .await?;
        self.store.reload(channel_id).await?;

        match result {
            Ok(_) => {
                report.success = true;
                self.apply_success_policy(&channel, &model, elapsed).await?;
            }
            Err(err) => {
                report.message = err.message.clone();
                self.apply_failure_policy(&channel, key_index, &err, &model).await;
            }
        }

        debug!(
            channel_id,
            "Channel test finished: success={}, time={:.2}s", report.success, report.time
        );
        Ok(report)
    }

    async fn apply_success_policy(&self, channel: &Channel, model: &str, elapsed: Duration) -> Result<()> {
        let threshold = self.config.channel_disable_threshold_secs;
        if threshold > 0.0 && elapsed.as_secs_f64() > threshold {
            if channel.status == ChannelStatus::Enabled {
                let reason = format!(
                    "response time {:.2}s exceeds threshold {:.2}s",
                    elapsed.as_secs_f64(),
                    threshold
                );
                self.monitor.disable_channel(channel.id, &reason, None, Some(model)).await?;
            }
            return Ok(());
        }
        if channel.status == ChannelStatus::AutoDisabled {
            self.monitor.enable_channel(channel.id).await?;
        }
        Ok(())
    }

    async fn apply_failure_policy(&self, channel: &Channel, key_index: Option<usize>, err: &RelayError, model: &str) {
        if channel.status != ChannelStatus::Enabled || !self.monitor.is_permanent_error(err) {
            return;
        }
        let key_index = key_index.filter(|_| channel.is_multi_key());
        self.monitor
            .handle_permanent_failure(channel.id, key_index, err, Some(model))
            .await;
    }

    /// Starts a background sweep. Fails if one is already in flight.
    pub fn start_sweep(self: &Arc<Self>, scope: SweepScope, notify: bool) -> Result<JoinHandle<()>> {
        let guard = Arc::clone(&self.sweep_lock)
            .try_lock_owned()
            .map_err(|_| Error::SweepAlreadyRunning)?;
        let tester = Arc::clone(self);
        Ok(supervisor::spawn_supervised("channel-sweep", async move {
            let _guard = guard;
            let (tested, failed) = tester.run_sweep(scope).await;
            info!("Channel test sweep finished: {} tested, {} failed", tested, failed);
            if notify {
                tester
                    .monitor
                    .notify(
                        "Channel test completed",
                        &format!("Channel test sweep finished: {} tested, {} failed", tested, failed),
                    )
                    .await;
            }
        }))
    }

    async fn run_sweep(&self, scope: SweepScope) -> (usize, usize) {
        let channels: Vec<i64> = self
            .store
            .channels()
            .iter()
            .filter(|c| scope.includes(c))
            .map(|c| c.id)
            .collect();
        info!("Channel test sweep started over {} channels ({:?})", channels.len(), scope);

        let interval = Duration::from_millis(self.config.test_request_interval_ms);
        let mut failed = 0;
        for (i, channel_id) in channels.iter().enumerate() {
            if i > 0 && !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
            match self.test_channel(*channel_id, None).await {
                Ok(report) if report.success => {}
                Ok(_) => failed += 1,
                Err(e) => {
                    failed += 1;
                    warn!("Testing channel {} failed: {}", channel_id, e);
                }
            }
        }
        (channels.len(), failed)
    }

    /// Runs a full sweep on a timer; ticks that find a sweep in flight are skipped.
    pub fn spawn_periodic(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        info!("Automatic channel testing every {:?}", interval);
        supervisor::spawn_supervised("channel-sweep-timer", async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match self.start_sweep(SweepScope::All, false) {
                    Ok(handle) => {
                        if let Err(e) = handle.await {
                            error!("Scheduled channel sweep did not finish: {}", e);
                        }
                    }
                    Err(e) => debug!("Skipping scheduled sweep: {}", e),
                }
            }
        })
    }
}
