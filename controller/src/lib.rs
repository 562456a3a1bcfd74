//! Nhc_controller holds the remediation metrics for the node healthcheck controller.
//!
//! A [`Context`] carries a [`metrics::Metrics`] bound to the process registry; callers
//! report stale remediation CRs and ongoing remediations through it.
//! The [`introspection`] module exposes the same registry over HTTP.

use std::sync::Arc;

// Re-exports for everyone's easy use.
pub(crate) mod prelude {
    pub use tracing::{debug, error, info, instrument, warn};

    pub use super::{Error, Result};
}

pub mod introspection;
pub mod metrics;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("tracing_subscriber error: {0}")]
    TracingConfig(#[from] tracing_subscriber::filter::ParseError),
    #[error("tracing error: {0}")]
    Tracing(#[from] tracing::subscriber::SetGlobalDefaultError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
    #[error("metric {metric:?} is already registered")]
    DuplicateRegistration { metric: &'static str },
    #[error("metric {metric:?} used before registration")]
    UnregisteredInstrument { metric: &'static str },
    #[error("unable to register metric {metric:?}: {source}")]
    Register {
        metric: &'static str,
        source: prometheus::Error,
    },
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// Result typedef for the controller.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Context shares one set of initialized [`metrics::Metrics`] between callers and threads.
#[derive(Clone)]
pub struct Context {
    pub metrics: Arc<metrics::Metrics>,
}

impl Context {
    /// New builds a Context around already-initialized metrics.
    pub fn new(metrics: metrics::Metrics) -> Self {
        Self {
            metrics: Arc::new(metrics),
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ctx")
    }
}
