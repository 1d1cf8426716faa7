/// Funding-rate sniper for Bybit linear perpetuals
///
/// Polls funding snapshots, keeps the strongest |funding rate| instruments,
/// enters a position a few seconds before each funding event on the side that
/// receives the payment, and closes it a few seconds after. Every closed trade
/// is booked against a one-way risk kill switch.

pub mod alerts;
pub mod auth;
pub mod bybit;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod pnl;
pub mod poller;
pub mod position;
pub mod retry;
pub mod risk;
pub mod scheduler;
pub mod sizing;
pub mod timer;
pub mod types;
