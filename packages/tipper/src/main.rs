use std::sync::Arc;

use alloy::primitives::utils::format_ether;
use anyhow::{Context, Result};
use envconfig::Envconfig;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mention_tipper::backoff::BackoffPolicy;
use mention_tipper::feed::poll::SearchMentions;
use mention_tipper::feed::{FeedMode, PollingSource, StreamingSource, XClient};
use mention_tipper::notifier::ReplyChannel;
use mention_tipper::{
    Coordinator, ReplyNotifier, RpcChain, RpcConnection, TipDispatcher, TipperConfig,
    TransactionResolver,
};

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("failed to register SIGTERM handler")?;
    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("failed to register SIGINT handler")?;

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
        _ = token.cancelled() => return Ok(()),
    };

    info!("Shutting down gracefully...");
    token.cancel();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let config = TipperConfig::init_from_env().context("failed to load configuration from env")?;
    config.validate().context("invalid configuration")?;

    // The signer is built once and moved into the provider.
    let signer = config.signer()?;
    let tipper = signer.address();
    info!(wallet = %tipper, account = config.handle(), feed = ?config.feed_mode, "Starting mention tipper");

    let mut connection = RpcConnection::new(config.rpc_url.clone(), BackoffPolicy::default());
    let provider = connection
        .connect_with_retry(signer)
        .await
        .context("failed to connect to RPC endpoint")?;
    let chain = Arc::new(RpcChain::new(provider, tipper, config.confirmation_policy()));

    let chain_id = chain.chain_id().await?;
    let balance = chain.tipper_balance().await?;
    info!(chain_id, balance = %format_ether(balance), "Connected to chain");
    let settings = config.coordinator_settings()?;
    if balance < settings.tip_amount {
        warn!("Wallet balance is below a single tip");
    }

    let client = XClient::new(config.x_api_url.clone(), config.x_bearer_token.clone(), config.x_user_token.clone());
    if config.x_user_token.is_none() {
        warn!("TIPPER_X_USER_TOKEN is not set, replies will fail");
    }

    let resolver = TransactionResolver::new(chain.clone());
    let dispatcher = TipDispatcher::new(chain.clone())
        .with_confirmation_timeout(config.confirmation_policy().timeout);
    let channel: Arc<dyn ReplyChannel> = Arc::new(client.clone());
    let notifier = ReplyNotifier::new(channel);
    let coordinator = Arc::new(Coordinator::new(resolver, dispatcher, notifier, settings));

    let shutdown = CancellationToken::new();
    let signals = tokio::spawn(shutdown_signal(shutdown.clone()));

    let stats = match config.feed_mode {
        FeedMode::Poll => {
            let searcher: Arc<dyn SearchMentions> = Arc::new(client);
            let source = PollingSource::new(searcher, config.poll_config());
            coordinator.run(source, shutdown.clone()).await
        }
        FeedMode::Stream => {
            let source = StreamingSource::start(client, config.stream_config(), shutdown.clone())
                .await
                .context("failed to start filtered stream")?;
            coordinator.run(source, shutdown.clone()).await
        }
    };

    shutdown.cancel();
    signals.await??;
    info!(completed = stats.completed, "Exited");
    Ok(())
}
