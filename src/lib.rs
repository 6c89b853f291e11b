//! # trading-control
//!
//! Trading control core for a derivatives desk. One event loop owns the
//! ledger, the order manager and the circuit breaker; strategies propose, the
//! risk gatekeeper disposes, and brokers and feeds sit behind traits.
//!
//! ```text
//!  feed ──▶ FeedRunner ──┐                         ┌──▶ Executor ──▶ Broker
//!                        ├──▶ ControlLoop ─────────┤                   │
//!  broker callbacks ─────┤    (ledger, orders,     ├──▶ Journal        │
//!  operator commands ────┘     breaker, risk)      └──▶ /ws/monitor    │
//!          ▲                                                           │
//!          └───────────────────── order events ◀───────────────────────┘
//! ```

pub mod auth;
pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod feed;
pub mod journal;
pub mod ledger;
pub mod models;
pub mod retry;
pub mod risk;
pub mod routes;
pub mod shutdown;
pub mod state;
pub mod strategy;
