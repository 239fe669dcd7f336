//! Cost accounting and metric aggregation for the gateway.
//!
//! Provides a per-model pricing table, a per-key hourly cost ledger, and
//! the counter/histogram registry behind the admin stats endpoint.

pub mod ledger;
pub mod metrics;
pub mod pricing;

pub use ledger::{CostLedger, LedgerWindow};
pub use metrics::{MetricsRegistry, MetricsSnapshot, ProviderStats};
pub use pricing::{ModelPricing, PricingTable};
