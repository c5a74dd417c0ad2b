use chrono::Utc;
use reqwest::{redirect, Client};
use serde_json::Value;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use url::{Host, Url};

use crate::error::{Error, Result};
use crate::storage::TaskRepository;
use crate::supervisor;
use crate::tasks::CallbackStatus;

const USER_AGENT: &str = "relay-engine-callback/1.0";
const MAX_ERROR_BODY: usize = 1024;

/// Checks that a user callback URL points at a public http(s) host.
/// Hostnames are resolved and every address must be public.
pub async fn validate_callback_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| Error::invalid_callback_url(format!("invalid URL format: {}", e)))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(Error::invalid_callback_url("only http/https protocols are allowed"));
    }

    let host = url
        .host()
        .ok_or_else(|| Error::invalid_callback_url("missing host in URL"))?;

    match host {
        Host::Ipv4(ip) => check_ip(IpAddr::V4(ip))?,
        Host::Ipv6(ip) => check_ip(IpAddr::V6(ip))?,
        Host::Domain(domain) => {
            if domain.eq_ignore_ascii_case("localhost") || domain.to_ascii_lowercase().ends_with(".localhost") {
                return Err(Error::invalid_callback_url(
                    "callback to private network addresses is not allowed",
                ));
            }
            let port = url.port_or_known_default().unwrap_or(80);
            let addrs = tokio::net::lookup_host((domain, port)).await.map_err(|e| {
                warn!("Failed to resolve callback host {}: {}", domain, e);
                Error::invalid_callback_url(format!("failed to resolve host {}", domain))
            })?;

            let mut resolved = false;
            for addr in addrs {
                resolved = true;
                check_ip(addr.ip())?;
            }
            if !resolved {
                return Err(Error::invalid_callback_url(format!("host {} has no addresses", domain)));
            }
        }
    }

    Ok(url)
}

fn check_ip(ip: IpAddr) -> Result<()> {
    if is_private_ip(ip) {
        Err(Error::invalid_callback_url(
            "callback to private network addresses is not allowed",
        ))
    } else {
        Ok(())
    }
}

/// Loopback, private, link-local, unique-local and unspecified addresses.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_private_v4(v4),
            None => is_private_v6(v6),
        },
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.is_unspecified()
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
}

/// Delivers settled-task notifications to user callback URLs.
/// One attempt per task; the outcome is persisted on the task.
pub struct CallbackDispatcher {
    client: Client,
    repo: TaskRepository,
}

impl CallbackDispatcher {
    pub fn new(repo: TaskRepository, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(2))
            .redirect(redirect::Policy::none())
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client, repo })
    }

    /// Fire-and-forget delivery on a supervised task.
    pub fn dispatch(self: &Arc<Self>, task_id: i64, url: String, payload: Value) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        supervisor::spawn_supervised("task-callback", async move {
            dispatcher.deliver(task_id, &url, &payload).await;
        })
    }

    pub async fn deliver(&self, task_id: i64, url: &str, payload: &Value) -> CallbackStatus {
        let (status, error_message) = match self.send(url, payload).await {
            Ok(()) => {
                info!("User callback delivered: task={}, url={}", task_id, url);
                (CallbackStatus::Success, None)
            }
            Err(message) => {
                error!("User callback failed: task={}, url={}, error={}", task_id, url, message);
                (CallbackStatus::Failed, Some(message))
            }
        };

        if let Err(e) = self
            .repo
            .update_callback(task_id, status, error_message.as_deref(), Utc::now().timestamp())
            .await
        {
            error!("Failed to persist callback outcome for task {}: {}", task_id, e);
        }
        status
    }

    async fn send(&self, url: &str, payload: &Value) -> std::result::Result<(), String> {
        let url = validate_callback_url(url)
            .await
            .map_err(|e| format!("invalid URL: {}", e))?;

        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        let body: String = body.chars().take(MAX_ERROR_BODY).collect();
        Err(format!("status_code={}, response={}", status.as_u16(), body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::tests::core;
    use crate::tasks::{Task, TaskRecord, TaskStatus, VideoParams, VideoTask};
    use crate::testing::create_test_database;
    use serde_json::json;

    #[tokio::test]
    async fn test_rejects_private_and_malformed_urls() {
        for url in [
            "not a url",
            "ftp://example.com/hook",
            "file:///etc/passwd",
            "http://localhost:8080/hook",
            "http://api.localhost/hook",
            "http://127.0.0.1/hook",
            "http://10.1.2.3/hook",
            "http://172.20.0.5/hook",
            "http://192.168.1.10/hook",
            "http://169.254.169.254/latest/meta-data",
            "http://0.0.0.0/hook",
            "http://[::1]/hook",
            "http://[fd00::1]/hook",
            "http://[fe80::1]/hook",
            "http://[::ffff:10.0.0.1]/hook",
            "http://nonexistent-host.invalid/hook",
        ] {
            assert!(validate_callback_url(url).await.is_err(), "{} should be rejected", url);
        }
    }

    #[tokio::test]
    async fn test_accepts_public_ip_literals() {
        assert!(validate_callback_url("https://8.8.8.8/hook").await.is_ok());
        assert!(validate_callback_url("http://[2001:4860:4860::8888]:8443/cb").await.is_ok());
        assert!(validate_callback_url("http://172.32.0.1/hook").await.is_ok());
    }

    #[test]
    fn test_private_ranges() {
        assert!(is_private_ip("172.31.255.255".parse().unwrap()));
        assert!(!is_private_ip("172.15.0.1".parse().unwrap()));
        assert!(is_private_ip("fc12::1".parse().unwrap()));
        assert!(!is_private_ip("2606:4700::1111".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_rejected_delivery_is_persisted() {
        let (db, _temp_dir) = create_test_database().await;
        let repo = TaskRepository::new(db.get_pool());
        let mut task = Task::Video(VideoTask {
            core: core(TaskStatus::Succeed),
            params: VideoParams::default(),
        });
        task.core_mut().callback_url = Some("http://127.0.0.1:9/hook".to_string());
        let id = repo.insert(&task).await.unwrap();

        let dispatcher = Arc::new(CallbackDispatcher::new(repo.clone(), Duration::from_secs(5)).unwrap());
        dispatcher
            .dispatch(id, "http://127.0.0.1:9/hook".to_string(), json!({"task_id": "kt-1"}))
            .await
            .unwrap();

        let stored = repo.get(id).await.unwrap().unwrap();
        assert_eq!(stored.core().callback_status, CallbackStatus::Failed);
        assert!(stored.core().callback_error.as_deref().unwrap().starts_with("invalid URL"));
        assert!(stored.core().callback_time.is_some());
    }
}
