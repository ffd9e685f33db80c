// src/repositories/postgres/mod.rs

pub mod bot_accounts;
pub mod channel_state;
pub mod interests;
pub mod runtime_stats;
pub mod service_accounts;
pub mod subscriptions;

pub use bot_accounts::PostgresBotAccountRepository;
pub use channel_state::PostgresChannelStateRepository;
pub use interests::PostgresInterestRepository;
pub use runtime_stats::PostgresRuntimeStatsRepository;
pub use service_accounts::PostgresServiceAccountRepository;
pub use subscriptions::PostgresSubscriptionRepository;
