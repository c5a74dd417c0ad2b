use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::channels::{Channel, ChannelStore, KeySelector};
use crate::error::{FailureKind, RelayError};
use crate::monitor::{HealthMonitor, HealthSignal};
use crate::relay::adaptor::{AdaptorOutcome, AdaptorRegistry, ProviderAdaptor, RelayMeta, RelayRequest};
use crate::supervisor;

const SATURATED_MESSAGE: &str = "The upstream load is saturated, please try again later";

/// One attempt against the channel and key bound into `meta`.
pub(crate) async fn execute_attempt(
    adaptor: &mut dyn ProviderAdaptor,
    meta: &RelayMeta,
    request: &RelayRequest,
) -> Result<AdaptorOutcome, RelayError> {
    adaptor.init(meta);
    let provider_request = adaptor.convert_request(meta, request)?;
    let raw = adaptor.do_request(meta, provider_request).await?;
    adaptor.do_response(meta, raw).await
}

#[derive(Debug)]
pub enum AttemptOutcome {
    Success(AdaptorOutcome),
    Retry(RelayError),
    Terminal(RelayError),
}

/// Whether a failed attempt may move on to another channel.
pub fn classify(err: RelayError, pinned: bool) -> AttemptOutcome {
    if pinned {
        return AttemptOutcome::Terminal(err);
    }
    match err.kind {
        FailureKind::Selection | FailureKind::Caller => AttemptOutcome::Terminal(err),
        FailureKind::Transport | FailureKind::KeyUnavailable => AttemptOutcome::Retry(err),
        FailureKind::Upstream | FailureKind::Internal => {
            if err.status == 429 || err.status >= 500 {
                AttemptOutcome::Retry(err)
            } else {
                AttemptOutcome::Terminal(err)
            }
        }
    }
}

/// Runs a relay request across channels with retry and failover.
pub struct Dispatcher {
    store: Arc<ChannelStore>,
    keys: Arc<KeySelector>,
    registry: Arc<AdaptorRegistry>,
    monitor: Arc<HealthMonitor>,
    retry_times: u32,
}

impl Dispatcher {
    pub fn new(
        store: Arc<ChannelStore>,
        keys: Arc<KeySelector>,
        registry: Arc<AdaptorRegistry>,
        monitor: Arc<HealthMonitor>,
        retry_times: u32,
    ) -> Self {
        Self {
            store,
            keys,
            registry,
            monitor,
            retry_times,
        }
    }

    /// A pinned channel is used as-is and never retried.
    pub async fn relay(
        &self,
        mut meta: RelayMeta,
        pinned: Option<i64>,
        request: &RelayRequest,
    ) -> Result<AdaptorOutcome, RelayError> {
        let span = info_span!(
            "relay",
            request_id = %meta.correlation_id,
            model = %meta.original_model
        );
        meta.pinned = pinned.is_some();
        let correlation_id = meta.correlation_id.clone();

        self.run(&mut meta, pinned, request)
            .instrument(span)
            .await
            .map_err(|err| err.with_correlation(&correlation_id))
    }

    async fn run(
        &self,
        meta: &mut RelayMeta,
        pinned: Option<i64>,
        request: &RelayRequest,
    ) -> Result<AdaptorOutcome, RelayError> {
        let mut failed: Vec<i64> = Vec::new();
        let mut last_error: Option<RelayError> = None;
        let mut attempt: u32 = 0;

        loop {
            let channel = match self.pick_channel(meta, pinned, &failed) {
                Ok(channel) => channel,
                Err(err) => {
                    return Err(match last_error {
                        Some(last) => {
                            debug!("No alternate channel after {} attempts", attempt);
                            saturated(last)
                        }
                        None => err,
                    });
                }
            };

            match self.attempt(meta, &channel, request, attempt).await {
                AttemptOutcome::Success(outcome) => {
                    if attempt > 0 {
                        info!(channel_id = channel.id, attempt, "Relay succeeded after retry");
                    }
                    return Ok(outcome);
                }
                AttemptOutcome::Terminal(err) => return Err(err),
                AttemptOutcome::Retry(err) => {
                    warn!(
                        channel_id = channel.id,
                        attempt,
                        "Attempt failed with {} ({}), retries left: {}",
                        err.status,
                        err.message,
                        self.retry_times.saturating_sub(attempt)
                    );
                    failed.push(channel.id);
                    if attempt >= self.retry_times {
                        return Err(saturated(err));
                    }
                    attempt += 1;
                    last_error = Some(err);
                }
            }
        }
    }

    fn pick_channel(&self, meta: &RelayMeta, pinned: Option<i64>, failed: &[i64]) -> Result<Arc<Channel>, RelayError> {
        let result = match pinned {
            Some(id) => self.store.get_channel_by_id(id, false),
            None => self.store.select_channel(&meta.group, &meta.original_model, failed),
        };
        result.map_err(|e| RelayError::selection(e.to_string()))
    }

    async fn attempt(
        &self,
        meta: &mut RelayMeta,
        channel: &Channel,
        request: &RelayRequest,
        attempt: u32,
    ) -> AttemptOutcome {
        let result = match self.keys.next_available_key(channel) {
            Ok(key) => {
                meta.bind_channel(channel, key);
                debug!(
                    channel_id = channel.id,
                    attempt,
                    "Dispatching {} to channel {} as {}",
                    meta.original_model,
                    channel.name,
                    meta.upstream_model
                );
                match self.registry.create(channel.channel_type) {
                    Ok(mut adaptor) => execute_attempt(adaptor.as_mut(), meta, request).await,
                    Err(err) => Err(err),
                }
            }
            Err(e) => {
                meta.key_index = None;
                Err(RelayError::from(e))
            }
        };

        match result {
            Ok(outcome) => {
                self.report(channel.id, meta, None);
                if let (Some(index), true) = (meta.key_index, meta.is_multi_key) {
                    let keys = Arc::clone(&self.keys);
                    let channel_id = channel.id;
                    supervisor::spawn_supervised("key-usage", async move {
                        if let Err(e) = keys.record_key_used(channel_id, index).await {
                            warn!("Failed to record key usage for channel {}: {}", channel_id, e);
                        }
                    });
                }
                AttemptOutcome::Success(outcome)
            }
            Err(err) => {
                // rejected before the channel was used
                if err.kind != FailureKind::Caller {
                    self.report(channel.id, meta, Some(err.clone()));
                }
                classify(err, meta.pinned)
            }
        }
    }

    fn report(&self, channel_id: i64, meta: &RelayMeta, error: Option<RelayError>) {
        self.monitor.emit(HealthSignal {
            channel_id,
            success: error.is_none(),
            status_code: Some(error.as_ref().map(|e| e.status).unwrap_or(200)),
            error,
            key_index: meta.key_index,
            model: meta.original_model.clone(),
            correlation_id: meta.correlation_id.clone(),
        });
    }
}

fn saturated(mut err: RelayError) -> RelayError {
    if err.status == 429 {
        err.message = SATURATED_MESSAGE.to_string();
    }
    err
}
