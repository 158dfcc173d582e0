//! Defines helpers for logging and metrics setup

use std::{error::Error, fmt::Display};
pub use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::err_str;

pub mod metrics;

/// Possible errors that occur when setting up telemetry
#[derive(Debug)]
pub enum TelemetrySetupError {
    /// Error emitted when setting up the statsd metrics recorder
    Metrics(String),
    /// Error emitted when a global subscriber is already installed
    Subscriber(String),
}

impl Error for TelemetrySetupError {}
impl Display for TelemetrySetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A builder for configuring telemetry
#[derive(Default)]
pub struct TelemetryBuilder {
    /// The subscriber layers to add to the telemetry stack
    layers: Vec<Box<dyn Layer<Registry> + Send + Sync + 'static>>,
    /// The default level used when `RUST_LOG` is unset
    default_level: Option<LevelFilter>,
}

impl TelemetryBuilder {
    /// Add a subscriber layer to the telemetry builder
    fn with_layer<L: Layer<Registry> + Send + Sync>(mut self, layer: L) -> Self {
        self.layers.push(layer.boxed());
        self
    }

    /// Configure logging, either as JSON lines or pretty printed
    pub fn with_logging(self, json: bool) -> Self {
        if json {
            self.with_layer(fmt::layer().json().with_current_span(true))
        } else {
            self.with_layer(fmt::layer().pretty())
        }
    }

    /// Set the level used when no `RUST_LOG` directive is given
    pub fn with_default_level(mut self, level: LevelFilter) -> Self {
        self.default_level = Some(level);
        self
    }

    /// Configure StatsD metrics
    pub fn with_metrics(
        self,
        statsd_host: &str,
        statsd_port: u16,
    ) -> Result<Self, TelemetrySetupError> {
        metrics::configure_metrics_statsd_recorder(statsd_host, statsd_port)?;
        Ok(self.with_layer(metrics_tracing_context::MetricsLayer::new()))
    }

    /// Initialize the global subscriber with the configured telemetry layers
    pub fn build(self) -> Result<(), TelemetrySetupError> {
        let level = self.default_level.unwrap_or(LevelFilter::INFO);
        let filter = EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();
        let layers = self.layers.with_filter(filter);
        tracing_subscriber::registry()
            .with(layers)
            .try_init()
            .map_err(err_str!(TelemetrySetupError::Subscriber))
    }
}

/// Configures logging and metrics based on the given options
///
/// Metrics are only configured when a statsd host is given
pub fn configure_telemetry(
    json_logs: bool,
    level: LevelFilter,
    statsd: Option<(&str, u16)>,
) -> Result<(), TelemetrySetupError> {
    let mut telemetry =
        TelemetryBuilder::default().with_logging(json_logs).with_default_level(level);

    if let Some((host, port)) = statsd {
        telemetry = telemetry.with_metrics(host, port)?;
    }

    telemetry.build()
}
