//! Prometheus metrics.

use crate::{Error, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether a recorder is installed at all.
    pub enabled: bool,
    /// Whether to serve `/metrics` over HTTP.
    pub expose: bool,
    /// Listener port when `expose` is set.
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            expose: false,
            port: 9090,
        }
    }
}

impl MetricsConfig {
    /// Enables the recorder.
    #[must_use]
    pub const fn enabled(mut self) -> Self {
        self.enabled = true;
        self
    }

    /// Returns the listener address.
    #[must_use]
    pub const fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port)
    }

    /// Applies environment variable overrides.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `CAPGRAPH_METRICS_ENABLED` | Install the recorder |
    /// | `CAPGRAPH_METRICS_EXPOSE` | Serve `/metrics` |
    /// | `CAPGRAPH_METRICS_PORT` | Listener port |
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(enabled) = parse_bool_env("CAPGRAPH_METRICS_ENABLED") {
            self.enabled = enabled;
        }
        if let Some(expose) = parse_bool_env("CAPGRAPH_METRICS_EXPOSE") {
            self.expose = expose;
        }
        if let Ok(v) = std::env::var("CAPGRAPH_METRICS_PORT")
            && let Ok(port) = v.parse::<u16>()
        {
            self.port = port;
        }
        self
    }
}

fn parse_bool_env(key: &str) -> Option<bool> {
    let value = std::env::var(key).ok()?;
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Handle to the installed recorder.
#[derive(Debug, Clone)]
pub struct MetricsHandle {
    prometheus: PrometheusHandle,
}

impl MetricsHandle {
    /// Renders the current metrics in Prometheus text format.
    #[must_use]
    pub fn render(&self) -> String {
        self.prometheus.render()
    }
}

/// Installs the Prometheus recorder, and the HTTP listener when exposed.
///
/// Returns `None` when metrics are disabled. The listener needs a running
/// tokio runtime.
///
/// # Errors
///
/// Returns an error if a recorder is already installed or the listener
/// cannot bind.
pub fn install_metrics(config: &MetricsConfig) -> Result<Option<MetricsHandle>> {
    if !config.enabled {
        return Ok(None);
    }

    let builder = PrometheusBuilder::new();
    let prometheus = if config.expose {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| Error::OperationFailed {
            operation: "metrics_listener".to_string(),
            cause: e.to_string(),
        })?;
        install_with_runtime(builder.with_http_listener(config.listen_addr()), &runtime)?
    } else {
        builder.install_recorder().map_err(install_error)?
    };

    tracing::info!(
        expose = config.expose,
        port = config.port,
        "Metrics recorder installed"
    );
    Ok(Some(MetricsHandle { prometheus }))
}

fn install_with_runtime(
    builder: PrometheusBuilder,
    runtime: &tokio::runtime::Handle,
) -> Result<PrometheusHandle> {
    let (recorder, exporter) = {
        let _guard = runtime.enter();
        builder.build().map_err(install_error)?
    };
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder).map_err(|e| Error::OperationFailed {
        operation: "metrics_recorder_install".to_string(),
        cause: e.to_string(),
    })?;
    runtime.spawn(exporter);
    Ok(handle)
}

#[allow(clippy::needless_pass_by_value)]
fn install_error(e: metrics_exporter_prometheus::BuildError) -> Error {
    Error::OperationFailed {
        operation: "metrics_recorder_install".to_string(),
        cause: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_installs_nothing() {
        let handle = install_metrics(&MetricsConfig::default()).unwrap();
        assert!(handle.is_none());
    }

    #[test]
    fn test_listen_addr_uses_port() {
        let config = MetricsConfig {
            port: 9191,
            ..MetricsConfig::default()
        };
        assert_eq!(config.listen_addr().port(), 9191);
    }
}
