//! Selfx402 facilitator server.
//!
//! HTTP surface over the [`selfx402`] core: payment verification and
//! EIP-3009 settlement, deferred voucher intake and aggregated
//! settlement, and Self-proof identity gating. Money-moving endpoints are
//! HMAC-authenticated; `/metrics` is bearer-gated.
//!
//! # Modules
//!
//! - [`routes`] — health, supported, verify, settle, identity/verify, metrics
//! - [`deferred`] — deferred/verify, deferred/settle, deferred/balance
//! - [`state`] — shared [`AppState`](state::AppState) and capability flags
//! - [`metrics`] — Prometheus counters and histograms

pub mod deferred;
pub mod metrics;
pub mod routes;
pub mod state;
