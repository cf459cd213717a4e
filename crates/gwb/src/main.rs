use std::sync::Arc;

use anyhow::Context;
use gwb_bridge::BridgeProvider;
use gwb_core::{
    config::Config,
    control::{Controller, StartOutcome, StartRequest},
    logging::{self, ActivityLog},
    provider::{
        retry::{RetryConfig, RetryingProvider},
        throttled::{ThrottleConfig, ThrottledProvider},
        GroupProvider,
    },
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init("gwb")?;

    let cfg = Config::load().context("loading configuration")?;
    std::fs::create_dir_all(&cfg.state_dir)
        .with_context(|| format!("creating state dir {}", cfg.state_dir.display()))?;

    let bridge: Arc<dyn GroupProvider> =
        Arc::new(BridgeProvider::new(&cfg.bridge_url, cfg.bridge_token.clone())?);
    let retrying: Arc<dyn GroupProvider> =
        Arc::new(RetryingProvider::new(bridge, RetryConfig::default()));
    let shutdown = CancellationToken::new();
    let provider: Arc<dyn GroupProvider> = Arc::new(
        ThrottledProvider::new(
            retrying,
            ThrottleConfig {
                per_target_min_interval: cfg.send_min_interval,
                ..ThrottleConfig::default()
            },
        )
        .with_shutdown(shutdown.clone()),
    );

    let log = ActivityLog::new(cfg.log_capacity).with_mirror(cfg.log_file_path());
    let controller = Controller::new(provider, log)
        .with_dedup_file(cfg.welcomed_cache_path())
        .with_sessions_dir(cfg.sessions_dir());

    let req = StartRequest::from_settings(cfg.settings(), cfg.accounts.clone());
    match controller.start(req) {
        StartOutcome::Accepted { task_id } => {
            tracing::info!(%task_id, bridge = %cfg.bridge_url, "worker started");
        }
        StartOutcome::AlreadyRunning => anyhow::bail!("worker already running"),
        StartOutcome::Rejected(reason) => anyhow::bail!("cannot start: {reason}"),
    }

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("listening for ctrl-c")?;
            controller.stop();
            shutdown.cancel();
            controller.wait().await;
        }
        reason = controller.wait() => {
            if let Some(reason) = reason {
                tracing::warn!("worker exited: {}", reason.as_str());
            }
        }
    }

    let st = controller.status();
    tracing::info!(
        total_welcomed = st.total_welcomed,
        stop_reason = st.stop_reason.as_deref().unwrap_or("-"),
        "shutdown complete"
    );
    Ok(())
}
