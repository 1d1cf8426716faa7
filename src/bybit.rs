//! Bybit v5 REST binding for linear perpetuals.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::auth::{generate_headers, Credentials};
use crate::error::GatewayError;
use crate::gateway::{ExchangeGateway, GatewayResult};
use crate::sizing::{floor_to_step, round_to_step};
use crate::types::{
    Equity, Fill, FundingAccrual, InstrumentRules, InstrumentSnapshot, LimitOrder, OrderAck, Side,
};

const CATEGORY: &str = "linear";
const TRANSACTION_LOG_PAGE: u32 = 50;
const TRANSACTION_LOG_MAX_PAGES: usize = 20;

/// Response envelope shared by every v5 endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    ret_code: i64,
    ret_msg: String,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResult<T> {
    #[serde(default = "Vec::new")]
    list: Vec<T>,
    #[serde(default)]
    next_page_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker {
    symbol: String,
    #[serde(default)]
    funding_rate: String,
    #[serde(default)]
    mark_price: String,
    #[serde(default)]
    last_price: String,
    #[serde(default)]
    bid1_price: String,
    #[serde(default)]
    ask1_price: String,
    #[serde(default)]
    next_funding_time: String,
    #[serde(default)]
    funding_interval_hour: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentInfo {
    price_filter: PriceFilter,
    lot_size_filter: LotSizeFilter,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PriceFilter {
    tick_size: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LotSizeFilter {
    qty_step: String,
    min_order_qty: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedOrder {
    order_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderStatus {
    #[serde(default)]
    avg_price: String,
    #[serde(default)]
    cum_exec_qty: String,
}

#[derive(Debug, Deserialize)]
struct PositionInfo {
    #[serde(default)]
    size: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Execution {
    side: Side,
    exec_price: String,
    exec_qty: String,
    #[serde(default)]
    exec_fee: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionLog {
    #[serde(default)]
    symbol: String,
    transaction_time: String,
    #[serde(default)]
    funding: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletAccount {
    #[serde(default)]
    coin: Vec<WalletCoin>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletCoin {
    coin: String,
    #[serde(default)]
    equity: String,
    #[serde(default)]
    wallet_balance: String,
    #[serde(default)]
    available_to_withdraw: String,
}

pub(crate) fn parse_decimal(raw: &str) -> Option<Decimal> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    raw.parse().ok()
}

pub(crate) fn parse_millis(raw: &str) -> Option<DateTime<Utc>> {
    let ms: i64 = raw.trim().parse().ok()?;
    if ms <= 0 {
        return None;
    }
    Utc.timestamp_millis_opt(ms).single()
}

/// The transaction log is account-wide; keep only settlements for `symbol`.
fn funding_accruals_for(symbol: &str, logs: Vec<TransactionLog>) -> Vec<FundingAccrual> {
    logs.into_iter()
        .filter(|log| log.symbol == symbol)
        .filter_map(|log| {
            Some(FundingAccrual {
                time: parse_millis(&log.transaction_time)?,
                fee: parse_decimal(&log.funding)?,
            })
        })
        .collect()
}

impl Ticker {
    fn into_snapshot(self) -> InstrumentSnapshot {
        InstrumentSnapshot {
            funding_rate: parse_decimal(&self.funding_rate),
            mark_price: parse_decimal(&self.mark_price),
            last_price: parse_decimal(&self.last_price),
            bid_price: parse_decimal(&self.bid1_price),
            ask_price: parse_decimal(&self.ask1_price),
            next_event_time: parse_millis(&self.next_funding_time),
            event_interval_hours: self
                .funding_interval_hour
                .as_deref()
                .and_then(|h| h.trim().parse().ok()),
            symbol: self.symbol,
        }
    }
}

pub struct BybitClient {
    client: Client,
    base_url: String,
    credentials: Option<Credentials>,
    recv_window_ms: u64,
    rules: Mutex<HashMap<String, InstrumentRules>>,
}

impl BybitClient {
    pub fn new(base_url: &str, credentials: Option<Credentials>, recv_window_ms: u64) -> anyhow::Result<Self> {
        let client = Client::builder()
            .tcp_nodelay(true)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            recv_window_ms,
            rules: Mutex::new(HashMap::new()),
        })
    }

    /// Client for public market data only.
    pub fn public(base_url: &str) -> anyhow::Result<Self> {
        Self::new(base_url, None, 5000)
    }

    fn credentials(&self) -> GatewayResult<&Credentials> {
        self.credentials
            .as_ref()
            .ok_or_else(|| GatewayError::Rejected {
                code: -1,
                message: "private endpoint called without credentials".to_string(),
            })
    }

    fn unwrap_envelope<T>(path: &str, envelope: Envelope<T>) -> GatewayResult<T> {
        if envelope.ret_code != 0 {
            return Err(GatewayError::Rejected {
                code: envelope.ret_code,
                message: envelope.ret_msg,
            });
        }
        envelope
            .result
            .ok_or_else(|| GatewayError::Parse(format!("{}: missing result", path)))
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &str,
        signed: bool,
    ) -> GatewayResult<T> {
        let start = Instant::now();
        let url = format!("{}{}?{}", self.base_url, path, query);

        let mut request = self.client.get(&url);
        if signed {
            let headers = generate_headers(self.credentials()?, self.recv_window_ms, query)
                .map_err(|e| GatewayError::Parse(e.to_string()))?;
            for (key, value) in headers {
                request = request.header(key, value);
            }
        }

        let body = request.send().await?.text().await?;
        trace!("GET {} took {:?}", path, start.elapsed());
        let envelope: Envelope<T> = serde_json::from_str(&body)?;
        Self::unwrap_envelope(path, envelope)
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &serde_json::Value) -> GatewayResult<T> {
        let start = Instant::now();
        let url = format!("{}{}", self.base_url, path);
        let payload = body.to_string();

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        let headers = generate_headers(self.credentials()?, self.recv_window_ms, &payload)
            .map_err(|e| GatewayError::Parse(e.to_string()))?;
        for (key, value) in headers {
            request = request.header(key, value);
        }

        let text = request.body(payload).send().await?.text().await?;
        debug!("POST {} took {:?}", path, start.elapsed());
        let envelope: Envelope<T> = serde_json::from_str(&text)?;
        Self::unwrap_envelope(path, envelope)
    }

    async fn order_status(&self, symbol: &str, order_id: &str) -> GatewayResult<Option<OrderStatus>> {
        let query = format!("category={}&symbol={}&orderId={}", CATEGORY, symbol, order_id);
        let result: ListResult<OrderStatus> = self.get("/v5/order/realtime", &query, true).await?;
        Ok(result.list.into_iter().next())
    }
}

#[async_trait]
impl ExchangeGateway for BybitClient {
    async fn list_instrument_snapshots(&self) -> GatewayResult<Vec<InstrumentSnapshot>> {
        let query = format!("category={}", CATEGORY);
        let result: ListResult<Ticker> = self.get("/v5/market/tickers", &query, false).await?;
        Ok(result.list.into_iter().map(Ticker::into_snapshot).collect())
    }

    async fn get_snapshot(&self, symbol: &str) -> GatewayResult<Option<InstrumentSnapshot>> {
        let query = format!("category={}&symbol={}", CATEGORY, symbol);
        let result: ListResult<Ticker> = self.get("/v5/market/tickers", &query, false).await?;
        Ok(result.list.into_iter().next().map(Ticker::into_snapshot))
    }

    async fn get_instrument_rules(&self, symbol: &str) -> GatewayResult<InstrumentRules> {
        if let Some(rules) = self.rules.lock().get(symbol) {
            return Ok(*rules);
        }

        let query = format!("category={}&symbol={}", CATEGORY, symbol);
        let result: ListResult<InstrumentInfo> =
            self.get("/v5/market/instruments-info", &query, false).await?;
        let info = result
            .list
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::NotFound(format!("instrument {}", symbol)))?;

        let field = |raw: &str, name: &str| {
            parse_decimal(raw).ok_or_else(|| GatewayError::Parse(format!("{}: bad {}", symbol, name)))
        };
        let rules = InstrumentRules {
            tick_size: field(&info.price_filter.tick_size, "tickSize")?,
            qty_step: field(&info.lot_size_filter.qty_step, "qtyStep")?,
            min_qty: field(&info.lot_size_filter.min_order_qty, "minOrderQty")?,
        };
        self.rules.lock().insert(symbol.to_string(), rules);
        Ok(rules)
    }

    async fn place_limit_order(&self, order: &LimitOrder) -> GatewayResult<OrderAck> {
        let rules = self.get_instrument_rules(&order.symbol).await?;
        let price = round_to_step(order.price, rules.tick_size);
        let qty = floor_to_step(order.qty, rules.qty_step);
        if qty <= Decimal::ZERO {
            return Err(GatewayError::Rejected {
                code: -1,
                message: format!("quantity {} conforms to zero", order.qty),
            });
        }

        let body = json!({
            "category": CATEGORY,
            "symbol": order.symbol,
            "side": order.side,
            "orderType": "Limit",
            "qty": qty.to_string(),
            "price": price.to_string(),
            "timeInForce": "GTC",
            "reduceOnly": order.reduce_only,
            "orderLinkId": uuid::Uuid::new_v4().simple().to_string(),
        });
        let created: CreatedOrder = self.post("/v5/order/create", &body).await?;

        // Prefer what actually executed; fall back to the submitted values.
        let (confirmed_qty, confirmed_price) = match self.order_status(&order.symbol, &created.order_id).await {
            Ok(Some(status)) => {
                let filled = parse_decimal(&status.cum_exec_qty).unwrap_or_default();
                let avg = parse_decimal(&status.avg_price).unwrap_or_default();
                if filled > Decimal::ZERO && avg > Decimal::ZERO {
                    (filled, avg)
                } else {
                    (qty, price)
                }
            }
            Ok(None) => (qty, price),
            Err(e) => {
                warn!("{}: order {} status lookup failed: {}", order.symbol, created.order_id, e);
                (qty, price)
            }
        };

        Ok(OrderAck {
            order_ref: created.order_id,
            confirmed_qty,
            confirmed_price,
        })
    }

    async fn get_open_quantity(&self, symbol: &str) -> GatewayResult<Decimal> {
        let query = format!("category={}&symbol={}", CATEGORY, symbol);
        let result: ListResult<PositionInfo> = self.get("/v5/position/list", &query, true).await?;
        Ok(result
            .list
            .iter()
            .filter_map(|p| parse_decimal(&p.size))
            .map(|s| s.abs())
            .sum())
    }

    async fn get_fills(&self, symbol: &str, order_ref: &str) -> GatewayResult<Vec<Fill>> {
        let query = format!("category={}&symbol={}&orderId={}", CATEGORY, symbol, order_ref);
        let result: ListResult<Execution> = self.get("/v5/execution/list", &query, true).await?;
        result
            .list
            .into_iter()
            .map(|e| {
                Ok(Fill {
                    side: e.side,
                    price: parse_decimal(&e.exec_price)
                        .ok_or_else(|| GatewayError::Parse("execPrice".to_string()))?,
                    qty: parse_decimal(&e.exec_qty)
                        .ok_or_else(|| GatewayError::Parse("execQty".to_string()))?,
                    fee: parse_decimal(&e.exec_fee).unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn get_funding_accruals(
        &self,
        symbol: &str,
        coin: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> GatewayResult<Vec<FundingAccrual>> {
        let base = format!(
            "accountType=UNIFIED&category={}&currency={}&endTime={}&limit={}&startTime={}&type=SETTLEMENT",
            CATEGORY,
            coin,
            to.timestamp_millis(),
            TRANSACTION_LOG_PAGE,
            from.timestamp_millis(),
        );

        let mut accruals = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..TRANSACTION_LOG_MAX_PAGES {
            let query = match &cursor {
                Some(c) => format!("{}&cursor={}", base, c),
                None => base.clone(),
            };
            let page: ListResult<TransactionLog> =
                self.get("/v5/account/transaction-log", &query, true).await?;
            accruals.extend(funding_accruals_for(symbol, page.list));

            match page.next_page_cursor.filter(|c| !c.is_empty()) {
                Some(next) => cursor = Some(next),
                None => return Ok(accruals),
            }
        }
        warn!(
            "{}: transaction log still paging after {} pages, funding may be incomplete",
            symbol, TRANSACTION_LOG_MAX_PAGES
        );
        Ok(accruals)
    }

    async fn get_account_equity(&self, coin: &str) -> GatewayResult<Equity> {
        let query = format!("accountType=UNIFIED&coin={}", coin);
        let result: ListResult<WalletAccount> =
            self.get("/v5/account/wallet-balance", &query, true).await?;
        let entry = result
            .list
            .into_iter()
            .flat_map(|account| account.coin)
            .find(|c| c.coin == coin)
            .ok_or_else(|| GatewayError::NotFound(format!("wallet coin {}", coin)))?;

        let total = parse_decimal(&entry.equity)
            .or_else(|| parse_decimal(&entry.wallet_balance))
            .ok_or_else(|| GatewayError::Parse(format!("{} equity", coin)))?;
        let available = parse_decimal(&entry.available_to_withdraw).unwrap_or(total);
        Ok(Equity { total, available })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_ticker_parsing() {
        let body = r#"{
            "retCode": 0,
            "retMsg": "OK",
            "result": {
                "category": "linear",
                "list": [
                    {
                        "symbol": "BTCUSDT",
                        "lastPrice": "43000.5",
                        "markPrice": "43001",
                        "bid1Price": "43000",
                        "ask1Price": "43000.5",
                        "fundingRate": "-0.0061",
                        "nextFundingTime": "1767254400000",
                        "fundingIntervalHour": "8"
                    },
                    {
                        "symbol": "NEWUSDT",
                        "lastPrice": "1.2",
                        "markPrice": "",
                        "fundingRate": "",
                        "nextFundingTime": "0"
                    }
                ]
            }
        }"#;
        let envelope: Envelope<ListResult<Ticker>> = serde_json::from_str(body).unwrap();
        let list = BybitClient::unwrap_envelope("/v5/market/tickers", envelope).unwrap().list;
        let snapshots: Vec<_> = list.into_iter().map(Ticker::into_snapshot).collect();

        let btc = &snapshots[0];
        assert_eq!(btc.funding_rate, Some(dec!(-0.0061)));
        assert_eq!(btc.mark_price, Some(dec!(43001)));
        assert_eq!(btc.event_interval_hours, Some(8));
        assert_eq!(
            btc.next_event_time,
            Some(Utc.with_ymd_and_hms(2026, 1, 1, 8, 0, 0).unwrap())
        );

        let new = &snapshots[1];
        assert_eq!(new.funding_rate, None);
        assert_eq!(new.mark_price, None);
        assert_eq!(new.next_event_time, None);
        assert_eq!(new.reference_price(), Some(dec!(1.2)));
    }

    #[test]
    fn test_error_envelope_is_rejection() {
        let body = r#"{"retCode": 110007, "retMsg": "ab not enough for new order", "result": {}}"#;
        let envelope: Envelope<serde_json::Value> = serde_json::from_str(body).unwrap();
        match BybitClient::unwrap_envelope("/v5/order/create", envelope) {
            Err(GatewayError::Rejected { code, message }) => {
                assert_eq!(code, 110007);
                assert!(message.contains("not enough"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_funding_rows_filtered_by_symbol() {
        let body = r#"{
            "retCode": 0,
            "retMsg": "OK",
            "result": {
                "list": [
                    {"symbol": "AUSDT", "transactionTime": "1767254400000", "type": "SETTLEMENT", "funding": "0.42"},
                    {"symbol": "BUSDT", "transactionTime": "1767254400000", "type": "SETTLEMENT", "funding": "-1.10"},
                    {"symbol": "AUSDT", "transactionTime": "1767283200000", "type": "SETTLEMENT", "funding": ""}
                ],
                "nextPageCursor": "21963%3A1%2C14954%3A1"
            }
        }"#;
        let envelope: Envelope<ListResult<TransactionLog>> = serde_json::from_str(body).unwrap();
        let page = BybitClient::unwrap_envelope("/v5/account/transaction-log", envelope).unwrap();
        assert_eq!(page.next_page_cursor.as_deref(), Some("21963%3A1%2C14954%3A1"));

        let accruals = funding_accruals_for("AUSDT", page.list);
        assert_eq!(
            accruals,
            vec![FundingAccrual {
                time: Utc.with_ymd_and_hms(2026, 1, 1, 8, 0, 0).unwrap(),
                fee: dec!(0.42),
            }]
        );
    }

    #[test]
    fn test_execution_side_and_order_side_wire_names() {
        let body = r#"{"list": [{"side": "Sell", "execPrice": "100.5", "execQty": "2", "execFee": "0.1"}]}"#;
        let result: ListResult<Execution> = serde_json::from_str(body).unwrap();
        assert_eq!(result.list[0].side, Side::Sell);
        assert!(result.next_page_cursor.is_none());
        assert_eq!(json!({ "side": Side::Buy })["side"], "Buy");
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_decimal(" 0.005 "), Some(dec!(0.005)));
        assert_eq!(parse_decimal(""), None);
        assert_eq!(parse_decimal("abc"), None);
        assert_eq!(parse_millis("0"), None);
        assert!(parse_millis("1767254400000").is_some());
    }
}
