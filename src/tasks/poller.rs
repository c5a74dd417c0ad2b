use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::{ChannelStore, KeySelector};
use crate::error::Result;
use crate::relay::{AdaptorRegistry, RelayMeta};
use crate::supervisor;
use crate::tasks::{IngestOutcome, Task, TaskLedger, TaskRecord};

/// Queries providers for in-flight tasks whose webhook never arrived.
pub struct TaskPoller {
    ledger: Arc<TaskLedger>,
    store: Arc<ChannelStore>,
    keys: Arc<KeySelector>,
    registry: Arc<AdaptorRegistry>,
    min_age_secs: i64,
    batch_size: i64,
}

impl TaskPoller {
    pub fn new(
        ledger: Arc<TaskLedger>,
        store: Arc<ChannelStore>,
        keys: Arc<KeySelector>,
        registry: Arc<AdaptorRegistry>,
        min_age_secs: i64,
        batch_size: i64,
    ) -> Self {
        Self {
            ledger,
            store,
            keys,
            registry,
            min_age_secs,
            batch_size,
        }
    }

    /// One pass over stale tasks. Returns how many updates were applied.
    pub async fn poll_once(&self) -> Result<usize> {
        let cutoff = Utc::now().timestamp() - self.min_age_secs;
        let tasks = self.ledger.stale_in_flight(cutoff, self.batch_size).await?;
        if tasks.is_empty() {
            return Ok(0);
        }
        debug!("Polling {} in-flight tasks", tasks.len());

        let mut applied = 0;
        for task in tasks {
            let id = task.id();
            match self.poll_task(task).await {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(e) => warn!("Polling task {} failed: {}", id, e),
            }
            // least recently polled tasks lead the next batch
            if let Err(e) = self.ledger.repository().mark_polled(id, Utc::now().timestamp()).await {
                warn!("Failed to record poll of task {}: {}", id, e);
            }
        }
        Ok(applied)
    }

    async fn poll_task(&self, task: Task) -> Result<bool> {
        let core = task.core();
        // disabled channels still own their in-flight work
        let channel = self.store.get_channel_by_id(core.channel_id, true)?;
        let key = self.keys.next_available_key(&channel)?;
        let adaptor = self.registry.create(channel.channel_type)?;

        let mut meta = RelayMeta::new(Uuid::new_v4().to_string(), core.user_id, "", core.model.clone());
        meta.bind_channel(&channel, key);

        let update = match adaptor.fetch_task(&meta, &core.request_type, &core.task_id).await? {
            Some(update) => update,
            None => return Ok(false),
        };
        if update.status == task.status() {
            return Ok(false);
        }

        let outcome = self.ledger.apply_update(task, &update).await?;
        Ok(outcome == IngestOutcome::Applied)
    }

    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        info!("Task poller running every {:?}", interval);
        supervisor::spawn_supervised("task-poller", async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match self.poll_once().await {
                    Ok(0) => {}
                    Ok(applied) => info!("Task poller applied {} updates", applied),
                    Err(e) => warn!("Task poll failed: {}", e),
                }
            }
        })
    }
}
