use arc_swap::ArcSwap;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channels::Channel;
use crate::error::{Error, Result};
use crate::storage::ChannelRepository;
use crate::supervisor;

#[derive(Debug, Default, Clone)]
struct ChannelSnapshot {
    channels: HashMap<i64, Arc<Channel>>,
}

/// Read-mostly channel cache.
///
/// Readers load an immutable snapshot; writers swap in a new one. Reads may
/// lag writes until the next refresh or upsert.
pub struct ChannelStore {
    repo: ChannelRepository,
    snapshot: ArcSwap<ChannelSnapshot>,
}

impl ChannelStore {
    pub fn new(repo: ChannelRepository) -> Self {
        Self {
            repo,
            snapshot: ArcSwap::from_pointee(ChannelSnapshot::default()),
        }
    }

    /// Build a store and populate it from the repository.
    pub async fn load(repo: ChannelRepository) -> Result<Self> {
        let store = Self::new(repo);
        store.refresh().await?;
        Ok(store)
    }

    pub fn repository(&self) -> &ChannelRepository {
        &self.repo
    }

    /// Reload every channel from the repository.
    pub async fn refresh(&self) -> Result<usize> {
        let channels = self.repo.list().await?;
        let count = channels.len();
        let snapshot = ChannelSnapshot {
            channels: channels.into_iter().map(|c| (c.id, Arc::new(c))).collect(),
        };
        self.snapshot.store(Arc::new(snapshot));
        debug!("Channel cache refreshed with {} channels", count);
        Ok(count)
    }

    /// Replace a single cached channel after a local mutation.
    pub fn upsert(&self, channel: Channel) {
        let channel = Arc::new(channel);
        self.snapshot.rcu(|current| {
            let mut next = ChannelSnapshot::clone(current);
            next.channels.insert(channel.id, Arc::clone(&channel));
            next
        });
    }

    /// Re-read one channel from the repository into the cache.
    pub async fn reload(&self, id: i64) -> Result<Arc<Channel>> {
        let channel = self
            .repo
            .get(id)
            .await?
            .ok_or_else(|| Error::channel_not_found(format!("channel {} does not exist", id)))?;
        self.upsert(channel);
        self.get_channel_by_id(id, true)
    }

    /// All cached channels ordered by id.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        let snapshot = self.snapshot.load();
        let mut channels: Vec<_> = snapshot.channels.values().cloned().collect();
        channels.sort_by_key(|c| c.id);
        channels
    }

    pub fn get_channel_by_id(&self, id: i64, include_disabled: bool) -> Result<Arc<Channel>> {
        let snapshot = self.snapshot.load();
        match snapshot.channels.get(&id) {
            Some(channel) if include_disabled || channel.is_enabled() => Ok(Arc::clone(channel)),
            Some(_) => Err(Error::channel_not_found(format!("channel {} is disabled", id))),
            None => Err(Error::channel_not_found(format!("channel {} does not exist", id))),
        }
    }

    /// Pick an enabled channel serving `model` for `group`, skipping `exclude`.
    pub fn select_channel(&self, group: &str, model: &str, exclude: &[i64]) -> Result<Arc<Channel>> {
        let snapshot = self.snapshot.load();
        let candidates: Vec<&Arc<Channel>> = snapshot
            .channels
            .values()
            .filter(|c| c.is_enabled() && c.in_group(group) && c.supports_model(model))
            .filter(|c| !exclude.contains(&c.id))
            .collect();

        select_weighted(&candidates, &mut rand::thread_rng())
            .map(Arc::clone)
            .ok_or_else(|| {
                Error::channel_not_found(format!(
                    "no available channel for model {} under group {}",
                    model, group
                ))
            })
    }

    /// Periodically reload the cache until the handle is aborted.
    pub fn spawn_sync(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        info!("Channel cache sync every {:?}", interval);
        supervisor::spawn_supervised("channel-sync", async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.refresh().await {
                    warn!("Channel cache refresh failed: {}", e);
                }
            }
        })
    }
}

/// Weighted random pick within the highest priority tier.
fn select_weighted<'a, R: Rng>(candidates: &[&'a Arc<Channel>], rng: &mut R) -> Option<&'a Arc<Channel>> {
    let top_priority = candidates.iter().map(|c| c.priority).max()?;
    let tier: Vec<&Arc<Channel>> = candidates
        .iter()
        .copied()
        .filter(|c| c.priority == top_priority)
        .collect();

    let total: u64 = tier.iter().map(|c| c.effective_weight()).sum();
    if total == 0 {
        return tier.first().copied();
    }
    let mut threshold = rng.gen_range(1..=total) as i64;
    for channel in &tier {
        threshold -= channel.effective_weight() as i64;
        if threshold <= 0 {
            return Some(*channel);
        }
    }
    tier.last().copied()
}
