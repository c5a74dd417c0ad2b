//! Channel records, multi-key metadata and the in-memory selection cache.

pub mod keys;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub use keys::{mask_key, parse_keys, KeySelector, SelectedKey};
pub use store::ChannelStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Enabled,
    ManuallyDisabled,
    AutoDisabled,
}

impl ChannelStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            ChannelStatus::Enabled => 1,
            ChannelStatus::ManuallyDisabled => 2,
            ChannelStatus::AutoDisabled => 3,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => ChannelStatus::Enabled,
            3 => ChannelStatus::AutoDisabled,
            _ => ChannelStatus::ManuallyDisabled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySelectionMode {
    #[default]
    RoundRobin,
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchImportMode {
    #[default]
    Overwrite,
    Append,
}

impl std::str::FromStr for BatchImportMode {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "overwrite" | "override" | "0" => Ok(BatchImportMode::Overwrite),
            "append" | "1" => Ok(BatchImportMode::Append),
            other => Err(crate::error::Error::validation(format!("Unknown import mode: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Enabled,
    Disabled,
}

/// Per-key bookkeeping for a multi-key channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyMetadata {
    pub usage: u64,
    pub balance: Option<f64>,
    pub last_used: Option<i64>,
    pub import_batch: String,
    pub note: String,
    pub disabled_reason: Option<String>,
    pub disabled_time: Option<i64>,
    pub status_code: Option<u16>,
    pub disabled_model: Option<String>,
}

impl KeyMetadata {
    pub fn fresh(batch_id: &str) -> Self {
        Self {
            import_batch: batch_id.to_string(),
            ..Default::default()
        }
    }
}

/// Multi-key state owned by exactly one channel.
///
/// Every index in `[0, key_count)` has one entry in `key_status` and one in
/// `key_metadata`. Indices never move once assigned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultiKeyInfo {
    pub key_count: usize,
    pub selection_mode: KeySelectionMode,
    pub polling_index: usize,
    pub key_status: BTreeMap<usize, KeyStatus>,
    pub key_metadata: BTreeMap<usize, KeyMetadata>,
    pub last_batch_import_time: Option<i64>,
    pub batch_import_mode: BatchImportMode,
}

impl MultiKeyInfo {
    pub fn is_key_enabled(&self, index: usize) -> bool {
        matches!(self.key_status.get(&index), Some(KeyStatus::Enabled))
    }

    pub fn enabled_indices(&self) -> Vec<usize> {
        (0..self.key_count).filter(|i| self.is_key_enabled(*i)).collect()
    }

    pub fn enabled_key_count(&self) -> usize {
        (0..self.key_count).filter(|i| self.is_key_enabled(*i)).count()
    }

    pub fn is_consistent(&self) -> bool {
        self.key_status.len() == self.key_count
            && self.key_metadata.len() == self.key_count
            && (0..self.key_count).all(|i| self.key_status.contains_key(&i) && self.key_metadata.contains_key(&i))
    }
}

/// Why and when the health monitor disabled a channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoDisableInfo {
    pub reason: String,
    pub time: i64,
    pub model: Option<String>,
    pub status_code: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub channel_type: i32,
    pub name: String,
    #[serde(skip_serializing)]
    pub key: String,
    pub status: ChannelStatus,
    pub weight: i64,
    pub priority: i64,
    pub base_url: Option<String>,
    pub models: Vec<String>,
    pub groups: Vec<String>,
    pub model_mapping: HashMap<String, String>,
    /// Whether the health monitor may disable this channel.
    pub auto_disable: bool,
    pub auto_disabled: Option<AutoDisableInfo>,
    pub response_time_ms: i64,
    pub test_time: Option<DateTime<Utc>>,
    pub used_quota: i64,
    pub multi_key: Option<MultiKeyInfo>,
}

impl Channel {
    pub fn new(channel_type: i32, name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            id: 0,
            channel_type,
            name: name.into(),
            key: key.into(),
            status: ChannelStatus::Enabled,
            weight: 1,
            priority: 0,
            base_url: None,
            models: Vec::new(),
            groups: vec!["default".to_string()],
            model_mapping: HashMap::new(),
            auto_disable: true,
            auto_disabled: None,
            response_time_ms: 0,
            test_time: None,
            used_quota: 0,
            multi_key: None,
        }
    }

    pub fn with_models(mut self, models: &[&str]) -> Self {
        self.models = models.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn with_groups(mut self, groups: &[&str]) -> Self {
        self.groups = groups.iter().map(|g| g.to_string()).collect();
        self
    }

    pub fn with_weight(mut self, weight: i64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_status(mut self, status: ChannelStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.status == ChannelStatus::Enabled
    }

    pub fn is_multi_key(&self) -> bool {
        self.multi_key.is_some()
    }

    pub fn supports_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }

    /// Selection weight; non-positive weights count as 1.
    pub fn effective_weight(&self) -> u64 {
        if self.weight <= 0 {
            1
        } else {
            self.weight as u64
        }
    }

    /// Keys in index order. A single-key channel yields one entry.
    pub fn keys(&self) -> Vec<&str> {
        self.key
            .split('\n')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .collect()
    }

    /// Upstream model name for a requested model.
    pub fn map_model(&self, model: &str) -> String {
        self.model_mapping
            .get(model)
            .filter(|mapped| !mapped.is_empty())
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }

    pub fn first_model(&self) -> Option<&str> {
        self.models.first().map(String::as_str)
    }
}

/// Splits a comma-separated column into trimmed, non-empty entries.
pub(crate) fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_helpers() {
        let mut channel = Channel::new(1, "primary", "sk-a\n\n sk-b \n")
            .with_models(&["gpt-4o", "gpt-4o-mini"])
            .with_groups(&["default", "vip"])
            .with_weight(0);
        channel.model_mapping.insert("gpt-4o".to_string(), "gpt-4o-2024-08-06".to_string());

        assert_eq!(channel.keys(), vec!["sk-a", "sk-b"]);
        assert_eq!(channel.effective_weight(), 1);
        assert!(channel.supports_model("gpt-4o-mini"));
        assert!(!channel.supports_model("claude"));
        assert!(channel.in_group("vip"));
        assert_eq!(channel.map_model("gpt-4o"), "gpt-4o-2024-08-06");
        assert_eq!(channel.map_model("gpt-4o-mini"), "gpt-4o-mini");
        assert_eq!(channel.first_model(), Some("gpt-4o"));
    }

    #[test]
    fn test_status_codes() {
        for status in [ChannelStatus::Enabled, ChannelStatus::ManuallyDisabled, ChannelStatus::AutoDisabled] {
            assert_eq!(ChannelStatus::from_i64(status.as_i64()), status);
        }
        assert_eq!(ChannelStatus::from_i64(42), ChannelStatus::ManuallyDisabled);
    }

    #[test]
    fn test_multi_key_info_roundtrips_through_json() {
        let mut info = MultiKeyInfo {
            key_count: 2,
            ..Default::default()
        };
        info.key_status.insert(0, KeyStatus::Enabled);
        info.key_status.insert(1, KeyStatus::Disabled);
        info.key_metadata.insert(0, KeyMetadata::fresh("batch_1"));
        info.key_metadata.insert(1, KeyMetadata::fresh("batch_1"));

        let json = serde_json::to_string(&info).unwrap();
        let parsed: MultiKeyInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, info);
        assert!(parsed.is_consistent());
        assert_eq!(parsed.enabled_indices(), vec![0]);
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list("a, b,,c "), vec!["a", "b", "c"]);
        assert!(split_list("").is_empty());
    }
}
