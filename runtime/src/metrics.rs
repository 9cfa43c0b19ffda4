//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for the party planner services:
//! - Lifecycle operations and their rejections
//! - Live feed subscribers
//! - Account operations
//!
//! # Example
//!
//! ```rust,no_run
//! use party_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Start metrics server on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use party_core::command::Outcome;
use party_core::error::LifecycleError;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the recorder and spawn the HTTP listener on the current runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), the call
    /// is logged and otherwise ignored.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                tokio::spawn(async move {
                    if exporter.await.is_err() {
                        tracing::error!("Metrics exporter stopped");
                    }
                });
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics server started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Metrics recorder already initialized, skipping re-initialization"
                );
                Ok(())
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    // Lifecycle
    describe_counter!(
        "party_lifecycle_operations_total",
        "Lifecycle operations completed, by operation and outcome"
    );
    describe_counter!(
        "party_lifecycle_rejections_total",
        "Lifecycle operations rejected, by operation and reason"
    );
    describe_histogram!(
        "party_lifecycle_duration_seconds",
        "Time taken by a lifecycle operation, store round trips included"
    );

    // Feed
    describe_gauge!(
        "party_feed_subscribers",
        "Live feed subscriptions currently open"
    );
    describe_gauge!(
        "party_feed_upstream_queries",
        "Distinct store subscriptions backing the live feed"
    );

    // Accounts
    describe_counter!(
        "party_account_operations_total",
        "Account operations, by operation and result"
    );

    // Backends
    describe_counter!(
        "party_store_writes_total",
        "Committed document writes, by operation and collection"
    );
    describe_counter!(
        "party_identity_registrations_total",
        "Accounts created by the identity backend"
    );
    describe_counter!(
        "party_identity_sign_ins_total",
        "Sign-in attempts checked by the identity backend, by outcome"
    );
}

/// Lifecycle metrics recorder.
pub struct LifecycleMetrics;

impl LifecycleMetrics {
    /// Record one lifecycle operation.
    pub fn record(
        operation: &'static str,
        result: Result<&Outcome, &LifecycleError>,
        duration: Duration,
    ) {
        match result {
            Ok(outcome) => {
                counter!(
                    "party_lifecycle_operations_total",
                    "operation" => operation,
                    "outcome" => outcome.label()
                )
                .increment(1);
            }
            Err(error) => {
                counter!(
                    "party_lifecycle_rejections_total",
                    "operation" => operation,
                    "reason" => error.kind()
                )
                .increment(1);
            }
        }
        histogram!("party_lifecycle_duration_seconds", "operation" => operation)
            .record(duration.as_secs_f64());
    }
}

/// Feed metrics recorder.
pub struct FeedMetrics;

impl FeedMetrics {
    /// Record the current subscription counts.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_subscribers(subscribers: usize, upstream_queries: usize) {
        gauge!("party_feed_subscribers").set(subscribers as f64);
        gauge!("party_feed_upstream_queries").set(upstream_queries as f64);
    }
}

/// Account metrics recorder.
pub struct AccountMetrics;

impl AccountMetrics {
    /// Record an account operation.
    pub fn record(operation: &'static str, success: bool) {
        let result = if success { "ok" } else { "error" };
        counter!("party_account_operations_total", "operation" => operation, "result" => result)
            .increment(1);
    }
}
