//! Tracehouse Observability
//!
//! Process-wide Prometheus metrics and the `/metrics` HTTP router.
//!
//! # Usage
//!
//! ```no_run
//! use tracehouse_observability::{exporter, metrics};
//!
//! metrics::init();
//! let router = exporter::create_metrics_router();
//! ```

pub mod exporter;
pub mod metrics;

pub use metrics::{init as init_metrics, REGISTRY};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_metrics();
        init_metrics();
        let _registry = &*REGISTRY;
    }
}
