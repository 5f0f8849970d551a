//! # Utility Modules
//!
//! Supporting utilities for logging, metrics, and reactor fairness.
//!
//! ## Components
//! - **Logging**: Structured logging configuration
//! - **Metrics**: Thread-safe counters and latency histograms
//! - **Yield Timer**: Time and iteration budget for synchronous read draining

pub mod logging;
pub mod metrics;
pub mod yield_timer;

pub use metrics::{global_metrics, Metrics, MetricsSnapshot, PeerMetrics};
pub use yield_timer::YieldTimer;
