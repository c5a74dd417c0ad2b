use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::info;

use crate::error::{Error, Result};
use crate::tasks::pricing::{PricingType, VideoPricingRule};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub relay: RelayConfig,
    pub health: HealthConfig,
    pub tasks: TaskConfig,
    pub billing: BillingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Externally reachable base URL, used to build provider webhook URLs.
    pub public_address: String,
    pub request_timeout_secs: u64,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub retry_times: u32,
    pub upstream_timeout_secs: u64,
    pub channel_sync_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub automatic_disable_channel: bool,
    pub automatic_enable_channel: bool,
    /// Probe latency above this disables an enabled channel. 0 turns the rule off.
    pub channel_disable_threshold_secs: f64,
    pub disable_keywords: Vec<String>,
    pub enable_metric_monitor: bool,
    pub metric_queue_size: usize,
    pub metric_success_rate_threshold: f64,
    pub signal_buffer: usize,
    pub test_request_interval_ms: u64,
    pub auto_test_interval_minutes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub callback_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub poll_min_age_secs: i64,
    pub poll_batch_size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    pub quota_per_unit: f64,
    pub cny_to_usd_rate: f64,
    /// Fallback USD price per model when no video pricing rule matches.
    pub default_model_price: HashMap<String, f64>,
    pub video_pricing_rules: Vec<VideoPricingRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub log_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            relay: RelayConfig::default(),
            health: HealthConfig::default(),
            tasks: TaskConfig::default(),
            billing: BillingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            public_address: "http://localhost:3000".to_string(),
            request_timeout_secs: 300,
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("relay-engine.db"),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            retry_times: 2,
            upstream_timeout_secs: 60,
            channel_sync_interval_secs: 60,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            automatic_disable_channel: true,
            automatic_enable_channel: true,
            channel_disable_threshold_secs: 5.0,
            disable_keywords: vec![
                "Your credit balance is too low".to_string(),
                "This organization has been disabled.".to_string(),
                "You exceeded your current quota".to_string(),
                "Permission denied".to_string(),
                "The security token included in the request is invalid".to_string(),
                "Operation not allowed".to_string(),
                "Your account is not authorized".to_string(),
            ],
            enable_metric_monitor: false,
            metric_queue_size: 10,
            metric_success_rate_threshold: 0.8,
            signal_buffer: 1024,
            test_request_interval_ms: 1000,
            auto_test_interval_minutes: None,
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            callback_timeout_secs: 5,
            poll_interval_secs: 60,
            poll_min_age_secs: 30,
            poll_batch_size: 50,
        }
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        let mut default_model_price = HashMap::new();
        default_model_price.insert("kling-v1".to_string(), 0.14);
        default_model_price.insert("kling-v1-6".to_string(), 0.28);
        default_model_price.insert("kling-image".to_string(), 0.0035);

        Self {
            quota_per_unit: 500_000.0,
            cny_to_usd_rate: 0.14,
            default_model_price,
            video_pricing_rules: vec![
                VideoPricingRule {
                    model: "kling-v1*".to_string(),
                    request_type: "*".to_string(),
                    mode: "std".to_string(),
                    duration: "*".to_string(),
                    resolution: "*".to_string(),
                    pricing_type: PricingType::PerSecond,
                    price: 0.028,
                    currency: "USD".to_string(),
                    priority: 10,
                },
                VideoPricingRule {
                    model: "kling-v1*".to_string(),
                    request_type: "*".to_string(),
                    mode: "pro".to_string(),
                    duration: "*".to_string(),
                    resolution: "*".to_string(),
                    pricing_type: PricingType::PerSecond,
                    price: 0.098,
                    currency: "USD".to_string(),
                    priority: 10,
                },
            ],
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl AppConfig {
    pub async fn load(config_file: &Path) -> Result<Self> {
        if !config_file.exists() {
            info!("Config file not found, creating default configuration");
            let default_config = Self::default();
            default_config.save(config_file).await?;
            return Ok(default_config);
        }

        info!("Loading configuration from: {:?}", config_file);

        let config_content = fs::read_to_string(config_file).await?;
        let config: AppConfig = toml::from_str(&config_content)
            .map_err(|e| Error::Config(config::ConfigError::Message(e.to_string())))?;

        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    pub async fn save(&self, config_file: &Path) -> Result<()> {
        info!("Saving configuration to: {:?}", config_file);

        let config_content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(config::ConfigError::Message(e.to_string())))?;

        fs::write(config_file, config_content).await?;

        info!("Configuration saved successfully");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::validation("Server port must be non-zero"));
        }
        if url::Url::parse(&self.server.public_address).is_err() {
            return Err(Error::validation(format!(
                "Invalid public address: {}",
                self.server.public_address
            )));
        }

        if self.health.channel_disable_threshold_secs < 0.0 {
            return Err(Error::validation("Channel disable threshold must not be negative"));
        }
        if self.health.metric_queue_size == 0 {
            return Err(Error::validation("Metric queue size must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.health.metric_success_rate_threshold) {
            return Err(Error::validation("Metric success rate threshold must be between 0 and 1"));
        }
        if self.health.signal_buffer == 0 {
            return Err(Error::validation("Signal buffer must be at least 1"));
        }

        if self.tasks.callback_timeout_secs == 0 {
            return Err(Error::validation("Callback timeout must be at least 1 second"));
        }

        if self.billing.quota_per_unit <= 0.0 {
            return Err(Error::validation("Quota per unit must be positive"));
        }
        for rule in &self.billing.video_pricing_rules {
            if rule.price < 0.0 {
                return Err(Error::validation(format!(
                    "Video pricing rule for {} has negative price",
                    rule.model
                )));
            }
        }

        Ok(())
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.relay.upstream_timeout_secs)
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.tasks.callback_timeout_secs)
    }

    pub fn test_request_interval(&self) -> Duration {
        Duration::from_millis(self.health.test_request_interval_ms)
    }

    /// Webhook URL handed to asynchronous providers at submission time.
    pub fn webhook_url(&self) -> String {
        format!("{}/kling/webhook", self.server.public_address.trim_end_matches('/'))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
