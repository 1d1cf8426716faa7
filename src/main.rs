use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use funding_sniper::alerts::AlertClient;
use funding_sniper::auth::Credentials;
use funding_sniper::bybit::BybitClient;
use funding_sniper::config::Config;
use funding_sniper::engine::Engine;
use funding_sniper::gateway::ExchangeGateway;
use funding_sniper::retry::retry_async;
use funding_sniper::risk::RiskGuard;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Load config
    let config = Config::from_env()?;

    // Setup logging
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(match config.log_level.as_str() {
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let strategy = &config.strategy;
    info!("╔═══════════════════════════════════════╗");
    info!("║     Funding Rate Sniper               ║");
    info!("║     Bybit Linear Perpetuals           ║");
    info!("╠═══════════════════════════════════════╣");
    info!("║ Notional: ${:27} ║", strategy.notional_usd);
    info!("║ Threshold: {:27} ║", strategy.funding_threshold);
    info!("║ Top N: {:31} ║", strategy.top_n);
    info!("║ Entry/exit offset: {:>8}s / {:>7}s ║", strategy.pre_offset.num_seconds(), strategy.post_offset.num_seconds());
    info!("╚═══════════════════════════════════════╝");

    let credentials = Credentials {
        api_key: config.api_key.clone(),
        api_secret: config.api_secret.clone(),
    };
    let gateway: Arc<dyn ExchangeGateway> = Arc::new(BybitClient::new(
        &config.base_url,
        Some(credentials),
        config.recv_window_ms,
    )?);

    let alerts = Arc::new(AlertClient::new(config.discord_webhook.clone()));

    // Starting equity is the baseline for the drawdown check; no baseline, no trading.
    let starting_equity = {
        let gw = gateway.as_ref();
        let coin = strategy.settle_coin.as_str();
        match retry_async("read starting equity", 5, || gw.get_account_equity(coin)).await {
            Ok(equity) => equity.total,
            Err(e) => {
                error!("Could not read starting equity, aborting: {}", e);
                alerts.error("startup", &e.to_string()).await;
                return Err(e);
            }
        }
    };
    info!("Starting equity: {} {}", starting_equity, strategy.settle_coin);

    alerts.bot_started(starting_equity).await;

    let risk = RiskGuard::new(starting_equity, config.halt_model);
    if let Some(limit) = risk.drawdown_limit() {
        info!("Drawdown limit: {} {}", limit, strategy.settle_coin);
    }
    let engine = Engine::new(config.strategy.clone(), gateway, risk, alerts);

    let runner = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run().await })
    };

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            engine.shutdown("operator signal").await;
        }
        _ = engine.wait_halted() => {}
    }
    // A risk halt may still be finishing on another task.
    engine.wait_halted().await;

    if let Err(e) = runner.await {
        error!("Poll loop task failed: {}", e);
    }

    info!(
        "Exiting: {} trades, cumulative net PnL {}",
        engine.risk().trade_count(),
        engine.risk().cumulative_net_pnl()
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
