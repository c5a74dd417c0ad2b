use chrono::Utc;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::{
    BatchImportMode, Channel, ChannelStore, KeyMetadata, KeySelectionMode, KeyStatus, MultiKeyInfo,
};
use crate::error::{Error, Result};

/// Credential picked for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedKey {
    pub key: String,
    /// Index within a multi-key channel; `None` for single-key channels.
    pub index: Option<usize>,
}

/// Result of disabling one key of a multi-key channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDisableOutcome {
    pub key_disabled: bool,
    pub all_keys_disabled: bool,
}

/// Picks credentials inside channels and maintains per-key state.
pub struct KeySelector {
    store: Arc<ChannelStore>,
    cursors: DashMap<i64, Arc<AtomicUsize>>,
    locks: DashMap<i64, Arc<tokio::sync::Mutex<()>>>,
}

impl KeySelector {
    pub fn new(store: Arc<ChannelStore>) -> Self {
        Self {
            store,
            cursors: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    pub fn next_available_key(&self, channel: &Channel) -> Result<SelectedKey> {
        let keys = channel.keys();

        let info = match &channel.multi_key {
            Some(info) => info,
            None => {
                return keys
                    .first()
                    .map(|key| SelectedKey {
                        key: key.to_string(),
                        index: None,
                    })
                    .ok_or_else(|| Error::no_available_key(format!("channel {} has no key", channel.id)));
            }
        };

        if info.key_count == 0 || keys.is_empty() {
            return Err(Error::no_available_key(format!("channel {} has no keys", channel.id)));
        }

        let index = match info.selection_mode {
            KeySelectionMode::Random => info.enabled_indices().choose(&mut rand::thread_rng()).copied(),
            KeySelectionMode::RoundRobin => self.next_round_robin(channel.id, info),
        };

        let index = index.ok_or_else(|| {
            Error::no_available_key(format!("all keys of channel {} are disabled", channel.id))
        })?;
        let key = keys.get(index).ok_or_else(|| {
            Error::no_available_key(format!("channel {} key index {} out of range", channel.id, index))
        })?;

        debug!("Channel {} selected key #{} ({})", channel.id, index, mask_key(key));
        Ok(SelectedKey {
            key: key.to_string(),
            index: Some(index),
        })
    }

    fn next_round_robin(&self, channel_id: i64, info: &MultiKeyInfo) -> Option<usize> {
        let cursor = self
            .cursors
            .entry(channel_id)
            .or_insert_with(|| Arc::new(AtomicUsize::new(info.polling_index)))
            .clone();

        for _ in 0..info.key_count {
            let index = cursor.fetch_add(1, Ordering::SeqCst) % info.key_count;
            if info.is_key_enabled(index) {
                return Some(index);
            }
        }
        None
    }

    fn channel_lock(&self, channel_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(channel_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn load_for_update(&self, channel_id: i64) -> Result<Channel> {
        self.store
            .repository()
            .get(channel_id)
            .await?
            .ok_or_else(|| Error::channel_not_found(format!("channel {} does not exist", channel_id)))
    }

    /// Replace or extend a channel's keys from a raw key block.
    pub async fn import_keys(&self, channel_id: i64, raw: &str, mode: BatchImportMode) -> Result<Arc<Channel>> {
        let new_keys = parse_keys(raw)?;
        if new_keys.is_empty() {
            return Err(Error::validation("no valid keys in import"));
        }

        let lock = self.channel_lock(channel_id);
        let _guard = lock.lock().await;

        let mut channel = self.load_for_update(channel_id).await?;
        let now = Utc::now().timestamp();
        let batch_id = new_batch_id(now);

        let (keys, info) = match mode {
            BatchImportMode::Overwrite => {
                let selection_mode = channel
                    .multi_key
                    .as_ref()
                    .map(|i| i.selection_mode)
                    .unwrap_or_default();
                let mut info = MultiKeyInfo {
                    key_count: new_keys.len(),
                    selection_mode,
                    ..Default::default()
                };
                for index in 0..new_keys.len() {
                    info.key_status.insert(index, KeyStatus::Enabled);
                    info.key_metadata.insert(index, KeyMetadata::fresh(&batch_id));
                }
                (new_keys, info)
            }
            BatchImportMode::Append => {
                let mut keys: Vec<String> = channel.keys().into_iter().map(str::to_string).collect();
                let mut info = channel
                    .multi_key
                    .clone()
                    .unwrap_or_else(|| legacy_multi_key_info(keys.len()));
                for key in new_keys {
                    let index = keys.len();
                    keys.push(key);
                    info.key_status.insert(index, KeyStatus::Enabled);
                    info.key_metadata.insert(index, KeyMetadata::fresh(&batch_id));
                }
                info.key_count = keys.len();
                (keys, info)
            }
        };

        let mut info = info;
        info.last_batch_import_time = Some(now);
        info.batch_import_mode = mode;

        let key_block = keys.join("\n");
        self.store
            .repository()
            .update_keys(channel_id, &key_block, Some(&info))
            .await?;

        if mode == BatchImportMode::Overwrite {
            self.cursors.remove(&channel_id);
        }

        info!(
            "Imported keys into channel {}: mode={:?}, batch={}, total={}",
            channel_id, mode, batch_id, info.key_count
        );

        channel.key = key_block;
        channel.multi_key = Some(info);
        self.store.upsert(channel);
        self.store.get_channel_by_id(channel_id, true)
    }

    /// Disable one key after a permanent failure. Sibling keys are untouched.
    pub async fn disable_key(
        &self,
        channel_id: i64,
        index: usize,
        reason: &str,
        status_code: Option<u16>,
        model: Option<&str>,
    ) -> Result<KeyDisableOutcome> {
        let lock = self.channel_lock(channel_id);
        let _guard = lock.lock().await;

        let mut channel = self.load_for_update(channel_id).await?;
        let masked = channel.keys().get(index).map(|k| mask_key(k)).unwrap_or_default();
        let Some(info) = channel.multi_key.as_mut() else {
            return Ok(KeyDisableOutcome {
                key_disabled: false,
                all_keys_disabled: false,
            });
        };

        if index >= info.key_count || !info.is_key_enabled(index) {
            return Ok(KeyDisableOutcome {
                key_disabled: false,
                all_keys_disabled: info.enabled_key_count() == 0,
            });
        }

        info.key_status.insert(index, KeyStatus::Disabled);
        let metadata = info.key_metadata.entry(index).or_default();
        metadata.disabled_reason = Some(reason.to_string());
        metadata.disabled_time = Some(Utc::now().timestamp());
        metadata.status_code = status_code;
        metadata.disabled_model = model.map(str::to_string);

        let all_keys_disabled = info.enabled_key_count() == 0;
        self.store.repository().update_multi_key_info(channel_id, info).await?;

        warn!(
            "Disabled key #{} ({}) of channel {}: {}",
            index, masked, channel_id, reason
        );

        self.store.upsert(channel);
        Ok(KeyDisableOutcome {
            key_disabled: true,
            all_keys_disabled,
        })
    }

    /// Record a successful use of one key and persist the polling position.
    pub async fn record_key_used(&self, channel_id: i64, index: usize) -> Result<()> {
        let lock = self.channel_lock(channel_id);
        let _guard = lock.lock().await;

        let mut channel = self.load_for_update(channel_id).await?;
        let Some(info) = channel.multi_key.as_mut() else {
            return Ok(());
        };

        let metadata = info.key_metadata.entry(index).or_default();
        metadata.usage += 1;
        metadata.last_used = Some(Utc::now().timestamp());
        if let Some(cursor) = self.cursors.get(&channel_id) {
            if info.key_count > 0 {
                info.polling_index = cursor.load(Ordering::SeqCst) % info.key_count;
            }
        }

        self.store.repository().update_multi_key_info(channel_id, info).await?;
        self.store.upsert(channel);
        Ok(())
    }
}

/// Parses a key block: a JSON array of strings, or one key per line.
pub fn parse_keys(raw: &str) -> Result<Vec<String>> {
    let trimmed = raw.trim();
    let keys: Vec<String> = if trimmed.starts_with('[') {
        serde_json::from_str::<Vec<String>>(trimmed)?
    } else {
        trimmed.lines().map(str::to_string).collect()
    };

    Ok(keys
        .into_iter()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect())
}

/// Shows the first and last four characters of a key.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}***{}", head, tail)
}

fn new_batch_id(now: i64) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("batch_{}_{}", now, &suffix[..8])
}

/// Multi-key state for a channel that predates multi-key support.
fn legacy_multi_key_info(key_count: usize) -> MultiKeyInfo {
    let mut info = MultiKeyInfo {
        key_count,
        ..Default::default()
    };
    for index in 0..key_count {
        info.key_status.insert(index, KeyStatus::Enabled);
        info.key_metadata.insert(index, KeyMetadata::default());
    }
    info
}
