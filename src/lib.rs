//! Tollgate - metered LLM gateway.
//!
//! Features:
//! - Sliding-window throughput, daily volume and monthly token-allowance admission control
//! - Model resolution across an administered catalog and caller-owned BYOM endpoints
//! - Template-driven request building and dotted-path response mapping for external providers
//! - Per-attempt usage records with marked-up cost metering
//! - Atomic monthly billing-ledger increments

pub mod admission;
pub mod api;
pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod ledger;
pub mod logger;
pub mod metering;
pub mod pipeline;
pub mod resolver;
pub mod secrets;
pub mod store;
pub mod usage;
