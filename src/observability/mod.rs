//! Observability: structured logging, per-client metrics and the health endpoint

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::HealthServer;
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{ClientMetrics, MetricsSnapshot};

pub use logging::{connection_span, dispatch_span};
