use std::sync::Arc;

use config::Config;
use store::StorageBackend;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod binding;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod delivery;
pub mod error;
pub mod exchange;
pub mod filter;
pub mod message;
pub mod queue;
pub mod store;
pub mod topic;
pub mod transaction;
pub mod utils;

pub use broker::Broker;

/// Returns a builder for the main application.
///
/// The broker runs until ctrl-c, then drains its store and exits.
#[bon::builder(finish_fn = start)]
pub async fn run(backend: Option<Arc<dyn StorageBackend>>) -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("SWITCHMQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("SWITCHMQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = Config::load()?;

    let broker = Broker::builder()
        .maybe_backend(backend)
        .config(config)
        .build()?;

    broker.activate().await?;
    broker.start_message_delivery().await;

    tokio::signal::ctrl_c().await?;

    broker.shutdown().await;

    Ok(())
}
