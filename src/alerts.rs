use anyhow::Result;
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::error;

use crate::pnl::ClosedTradeSummary;
use crate::types::Side;

/// Discord webhook client for alerts
pub struct AlertClient {
    client: Client,
    webhook_url: Option<String>,
}

impl AlertClient {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            client: Client::new(),
            webhook_url,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// Send a Discord message
    async fn send(&self, content: &str, color: u32) -> Result<()> {
        let Some(url) = &self.webhook_url else {
            return Ok(());
        };

        let payload = json!({
            "embeds": [{
                "description": content,
                "color": color
            }]
        });

        if let Err(e) = self.client.post(url).json(&payload).send().await {
            error!("Failed to send Discord alert: {}", e);
        }
        Ok(())
    }

    pub async fn bot_started(&self, starting_equity: Decimal) {
        let msg = format!("🤖 **Funding Sniper Started**\nStarting equity: ${}", starting_equity);
        let _ = self.send(&msg, 0x00FF00).await;
    }

    pub async fn position_opened(&self, symbol: &str, side: Side, qty: Decimal, price: Decimal) {
        let msg = format!("📝 **Position Opened**\n{} {} {} @ {}", symbol, side, qty, price);
        let _ = self.send(&msg, 0x0099FF).await;
    }

    pub async fn position_closed(&self, summary: &ClosedTradeSummary) {
        let color = if summary.net_pnl >= Decimal::ZERO { 0x00FF00 } else { 0xFF0000 };
        let msg = format!(
            "💰 **Position Closed**\n{}\nGross: ${}\nFees: ${}\nFunding: ${}\nNet: ${}",
            summary.symbol, summary.gross_pnl, summary.fees, summary.funding_fee, summary.net_pnl
        );
        let _ = self.send(&msg, color).await;
    }

    pub async fn residual_position(&self, symbol: &str, residual: Decimal) {
        let msg = format!(
            "⚖️ **Residual Position**\n{} still has {} open after all close attempts",
            symbol, residual
        );
        let _ = self.send(&msg, 0xFFA500).await;
    }

    pub async fn risk_breach(&self, loss: Decimal, limit: Decimal) {
        let msg = format!("🛑 **Risk Limit Breached**\nLoss: ${}\nLimit: ${}\nTrading halted", loss, limit);
        let _ = self.send(&msg, 0xFF0000).await;
    }

    pub async fn shutdown_complete(&self, reason: &str) {
        let msg = format!("🔌 **Shutdown Complete**\nReason: {}", reason);
        let _ = self.send(&msg, 0xFFFF00).await;
    }

    pub async fn error(&self, context: &str, error: &str) {
        let msg = format!("❌ **Error**\n{}\n```{}```", context, error);
        let _ = self.send(&msg, 0xFF0000).await;
    }
}
