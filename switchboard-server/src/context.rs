// src/context.rs
//
// Wires the engine together and owns the background tasks. One BridgeContext
// lives for the whole process and is shared with every request handler.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use switchboard_core::assets::ChatAssetCache;
use switchboard_core::config::{
    BridgeConfig, DELIVERY_QUEUE_DEPTH, DELIVERY_WORKERS, WEBHOOK_DELIVERY_TIMEOUT, WS_TOKEN_TTL,
};
use switchboard_core::fanout::delivery::{spawn_delivery_workers, DeliveryQueue};
use switchboard_core::fanout::FanoutHub;
use switchboard_core::interests::InterestService;
use switchboard_core::manager::{session::run_session_loop, SubscriptionManager};
use switchboard_core::registry::InterestRegistry;
use switchboard_core::repositories::{
    PostgresBotAccountRepository, PostgresChannelStateRepository, PostgresInterestRepository,
    PostgresRuntimeStatsRepository, PostgresServiceAccountRepository,
    PostgresSubscriptionRepository, RuntimeStatsRepository, ServiceAccountRepository,
};
use switchboard_core::tasks::spawn_stale_pruner;
use switchboard_core::tokens::WsTokenStore;
use switchboard_core::twitch::TwitchClient;
use switchboard_core::{Database, Error};

const SHUTDOWN_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

pub struct BridgeContext {
    pub config: BridgeConfig,
    pub db: Database,
    pub twitch: Arc<TwitchClient>,
    pub registry: Arc<InterestRegistry>,
    pub interests: Arc<InterestService>,
    pub manager: Arc<SubscriptionManager>,
    pub fanout: Arc<FanoutHub>,
    pub ws_tokens: Arc<WsTokenStore>,
    pub services: Arc<dyn ServiceAccountRepository>,
    pub stats: Arc<dyn RuntimeStatsRepository>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BridgeContext {
    pub async fn build(config: BridgeConfig) -> Result<Arc<Self>, Error> {
        let db = Database::new(&config.database_url).await?;
        let pool = db.pool().clone();

        let interests_repo = Arc::new(PostgresInterestRepository::new(pool.clone()));
        let subs_repo = Arc::new(PostgresSubscriptionRepository::new(pool.clone()));
        let bots_repo = Arc::new(PostgresBotAccountRepository::new(pool.clone()));
        let services_repo = Arc::new(PostgresServiceAccountRepository::new(pool.clone()));
        let channel_repo = Arc::new(PostgresChannelStateRepository::new(pool.clone()));
        let stats_repo: Arc<dyn RuntimeStatsRepository> =
            Arc::new(PostgresRuntimeStatsRepository::new(pool.clone()));

        let twitch = Arc::new(TwitchClient::new(
            config.twitch_client_id.clone(),
            config.twitch_client_secret.clone(),
            config.eventsub_ws_url.clone(),
        ));
        let registry = Arc::new(InterestRegistry::new());
        let assets = Arc::new(ChatAssetCache::new(twitch.clone()));

        let delivery = Arc::new(DeliveryQueue::new(
            DELIVERY_QUEUE_DEPTH,
            config.service_signing_secret.clone(),
            WEBHOOK_DELIVERY_TIMEOUT,
        ));
        let fanout = Arc::new(FanoutHub::new(delivery, stats_repo.clone()));

        let interests = Arc::new(InterestService::new(
            interests_repo,
            bots_repo.clone(),
            registry.clone(),
            twitch.clone(),
        ));
        let manager = Arc::new(SubscriptionManager::new(
            config.clone(),
            twitch.clone(),
            registry.clone(),
            fanout.clone(),
            assets,
            subs_repo,
            bots_repo,
            channel_repo,
        ));

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            db,
            twitch,
            registry,
            interests,
            manager,
            fanout,
            ws_tokens: Arc::new(WsTokenStore::new(WS_TOKEN_TTL)),
            services: services_repo,
            stats: stats_repo,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Load state, reconcile against Twitch and start the background tasks.
    pub async fn start(self: &Arc<Self>) -> Result<(), Error> {
        self.interests.load().await?;
        if let Err(e) = self.stats.reset_connection_counts().await {
            warn!("Could not reset connection counters: {e}");
        }
        if let Err(e) = self.manager.reconcile().await {
            warn!("Startup reconcile failed (continuing): {e}");
        }
        // Webhook-transport keys can be ensured now; websocket-bound keys
        // wait for the session welcome.
        self.manager.ensure_all().await;
        self.manager.refresh_channel_states().await;

        let shutdown = self.shutdown_tx.subscribe();
        let mut tasks = self.tasks.lock().await;
        tasks.extend(spawn_delivery_workers(
            self.fanout.delivery_queue(),
            self.stats.clone(),
            DELIVERY_WORKERS,
            shutdown.clone(),
        ));
        tasks.push(spawn_stale_pruner(
            self.interests.clone(),
            self.manager.clone(),
            shutdown.clone(),
        ));
        tasks.push(tokio::spawn(run_session_loop(
            self.manager.clone(),
            self.config.eventsub_ws_url.clone(),
            shutdown,
        )));
        info!("Bridge context started");
        Ok(())
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Stop tasks, drain pending deliveries briefly and close the pool.
    /// Upstream subscriptions survive shutdown; the next boot reconciles.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.fanout
            .delivery_queue()
            .wait_until_empty(SHUTDOWN_DRAIN_DEADLINE)
            .await;
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        self.db.close().await;
        info!("Bridge context stopped");
    }
}
