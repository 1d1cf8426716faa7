/// Read-only scan of current funding rates
///
/// Fetches every linear perpetual ticker, ranks by |funding rate| and prints
/// what the sniper would do with each selected symbol right now. Needs no API
/// keys and places no orders. Run with:
///   cargo run --bin funding_scan

use anyhow::Result;
use chrono::Utc;
use std::env;

use funding_sniper::bybit::BybitClient;
use funding_sniper::config::{StrategyConfig, DEFAULT_BASE_URL};
use funding_sniper::gateway::ExchangeGateway;
use funding_sniper::poller::select_top;
use funding_sniper::scheduler::{decide, ArmDecision};
use funding_sniper::types::Side;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    println!("═══════════════════════════════════════");
    println!("       Funding Sniper - Rate Scan      ");
    println!("═══════════════════════════════════════\n");

    let base_url = env::var("BYBIT_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
    let strategy = StrategyConfig::default();
    let client = BybitClient::public(&base_url)?;

    let snapshots = client.list_instrument_snapshots().await?;
    println!("✓ {} instruments fetched from {}\n", snapshots.len(), base_url);

    let now = Utc::now();
    let top = select_top(snapshots.iter(), strategy.top_n);
    let mut qualifying = 0;
    for snapshot in top {
        let rate = snapshot.funding_rate.unwrap_or_default();
        let event = snapshot
            .next_event_time
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        let decision = decide(snapshot, now, &strategy);
        if decision.qualifies() {
            qualifying += 1;
        }
        let action = match decision {
            ArmDecision::Skip(reason) => format!("skip ({:?})", reason),
            ArmDecision::TooEarly { fire_at } => format!("wait, fires {}", fire_at.format("%H:%M:%S")),
            ArmDecision::Arm { fire_at, .. } => format!("arm, fires {}", fire_at.format("%H:%M:%S")),
            ArmDecision::FireNow { .. } => "fire now".to_string(),
        };
        println!(
            "  {:<16} {:>10} {:<4} event {} ({}h)  {}",
            snapshot.symbol,
            rate,
            Side::for_funding_rate(rate),
            event,
            snapshot.event_interval_hours.map(|h| h.to_string()).unwrap_or_else(|| "?".to_string()),
            action
        );
    }

    println!(
        "\n{} ready to enter | threshold {} | top {}",
        qualifying, strategy.funding_threshold, strategy.top_n
    );
    Ok(())
}
