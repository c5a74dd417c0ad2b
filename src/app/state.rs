use reqwest::Client;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use crate::app::config::AppConfig;
use crate::channels::{ChannelStore, KeySelector};
use crate::error::Result;
use crate::monitor::{ChannelTester, HealthMonitor, HealthSignal, Notifier};
use crate::relay::{AdaptorDeps, AdaptorRegistry, Dispatcher};
use crate::storage::{ChannelRepository, Database, TaskRepository, UserDirectory, UserRepository};
use crate::tasks::{CallbackDispatcher, Pricing, TaskLedger, TaskPoller};

/// Every long-lived service, wired once at startup.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub users: Arc<dyn UserDirectory>,
    pub store: Arc<ChannelStore>,
    pub keys: Arc<KeySelector>,
    pub ledger: Arc<TaskLedger>,
    pub registry: Arc<AdaptorRegistry>,
    pub monitor: Arc<HealthMonitor>,
    pub tester: Arc<ChannelTester>,
    pub dispatcher: Arc<Dispatcher>,
    pub poller: Arc<TaskPoller>,
}

impl AppState {
    /// Builds the service graph over `database`. `register` may add or replace
    /// adaptors after the defaults are installed. The channel cache starts empty.
    pub fn build(
        config: AppConfig,
        database: &Database,
        notifier: Arc<dyn Notifier>,
        register: impl FnOnce(&mut AdaptorRegistry),
    ) -> Result<(Self, mpsc::Receiver<HealthSignal>)> {
        let pool = database.get_pool();
        let channel_repo = ChannelRepository::new(pool.clone());
        let task_repo = TaskRepository::new(pool.clone());
        let users = UserRepository::new(pool);

        let store = Arc::new(ChannelStore::new(channel_repo));
        let keys = Arc::new(KeySelector::new(Arc::clone(&store)));

        let callbacks = Arc::new(CallbackDispatcher::new(task_repo.clone(), config.callback_timeout())?);
        let ledger = Arc::new(TaskLedger::new(
            task_repo,
            Arc::new(users.clone()),
            Pricing::from_config(&config.billing),
            callbacks,
        ));

        let client = Client::builder().timeout(config.upstream_timeout()).build()?;
        let deps = AdaptorDeps {
            client,
            ledger: Arc::clone(&ledger),
            webhook_url: config.webhook_url(),
        };
        let mut registry = AdaptorRegistry::with_defaults(deps);
        register(&mut registry);
        let registry = Arc::new(registry);

        let (monitor, signals) = HealthMonitor::new(
            config.health.clone(),
            Arc::clone(&store),
            Arc::clone(&keys),
            notifier,
        );
        let tester = Arc::new(ChannelTester::new(
            config.health.clone(),
            Arc::clone(&store),
            Arc::clone(&keys),
            Arc::clone(&registry),
            Arc::clone(&monitor),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&keys),
            Arc::clone(&registry),
            Arc::clone(&monitor),
            config.relay.retry_times,
        ));
        let poller = Arc::new(TaskPoller::new(
            Arc::clone(&ledger),
            Arc::clone(&store),
            Arc::clone(&keys),
            Arc::clone(&registry),
            config.tasks.poll_min_age_secs,
            config.tasks.poll_batch_size,
        ));

        let state = Self {
            config: Arc::new(config),
            users: Arc::new(users),
            store,
            keys,
            ledger,
            registry,
            monitor,
            tester,
            dispatcher,
            poller,
        };
        Ok((state, signals))
    }

    /// Opens the configured database and builds the default service graph.
    pub async fn initialize(
        config: AppConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Result<(Self, mpsc::Receiver<HealthSignal>, Database)> {
        info!("Initializing application state");
        let database = Database::new(&config.database.path).await?;
        let (state, signals) = Self::build(config, &database, notifier, |_| {})?;
        info!("Application state initialized");
        Ok((state, signals, database))
    }
}
