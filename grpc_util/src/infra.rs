// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::net::SocketAddr;
use std::time::Duration;

use futures::FutureExt;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use tokio::runtime::Builder;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use warp::Filter;

/// Default Prometheus histogram buckets.
/// These have been chosen to hopefully be better for latencies internal to the AWS cloud.
/// Originally, these were set to the default used by the [Prometheus Go client], but those
/// defaults are more useful for Web API calls over the Internet and less so for internal data
/// center requests.
/// [Prometheus Go client]: https://github.com/prometheus/client_golang/blob/9ef86855d4e52661184748b7a6fd9ed39985b479/prometheus/histogram.go#L63
const DEFAULT_PROMETHEUS_BUCKETS: &[f64] = &[
    0.0005, // 0.5 ms
    0.001,  // 1 ms
    0.002,  // 2 ms
    0.003,  // 3 ms
    0.004,  // 4 ms
    0.005,  // 5 ms
    0.010,  // 10 ms
    0.020,  // 20 ms
    0.030,  // 30 ms
    0.040,  // 40 ms
    0.050,  // 50 ms
    0.100,  // 100 ms
    0.250,  // 250 ms
    0.5,    // 500 ms
    1.0,    // 1 sec
    2.5,    // 2.5 secs
    5.0,    // 5 secs
    10.0,   // 10 secs
    30.0,   // 30 secs
];

/// Admin endpoints configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct InfraConfig {
    /// Bind address for the metricsz endpoint.
    #[serde(default = "default_metricsz_bind_addr")]
    pub metricsz_bind_addr: String,

    /// Bind address for the other infra endpoints.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for InfraConfig {
    fn default() -> Self {
        InfraConfig {
            metricsz_bind_addr: default_metricsz_bind_addr(),
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_metricsz_bind_addr() -> String {
    "0.0.0.0:8010".to_owned()
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_owned()
}

/// Configuration of gRPC-specific properties.
///
/// The keepalive defaults are deliberately aggressive: the telemetry peer is
/// on the same host, and a dead peer must be detected within seconds so that
/// stale VRRP state can be reset.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct GrpcConfig {
    /// Interval between HTTP/2 keepalive pings sent to the connected peer.
    #[serde(default = "default_keepalive_seconds")]
    pub keepalive_interval_seconds: u64,

    /// How long to wait for a keepalive acknowledgement before the transport
    /// declares the connection lost.
    #[serde(default = "default_keepalive_seconds")]
    pub keepalive_timeout_seconds: u64,

    /// Number of in-flight requests allowed inbound per connection.
    pub concurrency_limit_per_connection: Option<usize>,
}

impl Default for GrpcConfig {
    fn default() -> Self {
        GrpcConfig {
            keepalive_interval_seconds: default_keepalive_seconds(),
            keepalive_timeout_seconds: default_keepalive_seconds(),
            concurrency_limit_per_connection: None,
        }
    }
}

fn default_keepalive_seconds() -> u64 {
    1
}

impl GrpcConfig {
    pub fn apply_to_server(
        &self,
        mut server: tonic::transport::Server,
    ) -> tonic::transport::Server {
        server = server
            .http2_keepalive_interval(Some(Duration::from_secs(self.keepalive_interval_seconds)))
            .http2_keepalive_timeout(Some(Duration::from_secs(self.keepalive_timeout_seconds)));

        if let Some(limit) = self.concurrency_limit_per_connection {
            server = server.concurrency_limit_per_connection(limit);
        }

        server
    }
}

/// Setup metrics collection and scraping endpoint.
fn setup_metrics_handler() -> Result<PrometheusHandle, String> {
    // Build the Prometheus metrics recorder and exporter.
    let recorder = PrometheusBuilder::new()
        .set_buckets(DEFAULT_PROMETHEUS_BUCKETS)
        .map_err(|err| format!("Failed to install set histogram buckets: {err}"))?
        .build_recorder();
    let handle = recorder.handle();
    metrics::set_boxed_recorder(Box::new(recorder))
        .map_err(|err| format!("Failed to install Prometheus metrics recorder: {err}"))?;
    Ok(handle)
}

/// Setup infra endpoints for use by devops systems.
///
/// Returns a `sync::watch` receiver that should be used by all servers as a signal for when they
/// should be shut down by looking for RecvError when calling `.changed()`.
pub fn setup_infra_endpoints(
    config: InfraConfig,
    run_before_metrics_collection: impl Fn() + Clone + Send + Sync + 'static,
) -> Result<watch::Receiver<()>, String> {
    // Setup metrics collection.
    let metrics_handle = setup_metrics_handler()?;

    let metricsz_bind_addr: SocketAddr = config
        .metricsz_bind_addr
        .parse()
        .map_err(|err| format!("Failed to parse metricsz bind address: {err}"))?;

    let bind_addr: SocketAddr = config
        .bind_addr
        .parse()
        .map_err(|err| format!("Failed to parse infra bind address: {err}"))?;

    // Setup shutdown signal handler.
    let (shutdown_sender, shutdown_receiver) = watch::channel(());

    // Spawn a thread for all admin tasks to isolate them from the main event loop.
    std::thread::spawn(move || {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .thread_name("admin")
            .build()
            .expect("initialize admin event loop");

        runtime.block_on(async move {
            let mut sigint_stream = signal(SignalKind::interrupt())
                .map_err(|err| format!("Failed to create SIGINT handler: {err}"))
                .expect("attach SIGINT handler");
            let mut sigterm_stream = signal(SignalKind::terminate())
                .map_err(|err| format!("Failed to create SIGTERM handler: {err}"))
                .expect("attach SIGTERM handler");
            tokio::spawn(async move {
                futures::future::select(
                    sigint_stream.recv().boxed(),
                    sigterm_stream.recv().boxed(),
                )
                .await;
                log::info!("Received shutdown signal. Starting graceful shutdown ...");
                // This will cause all receivers to get RecvError when calling `.changed()`.
                drop(shutdown_sender);
            });

            // Setup health endpoint.
            let healthz = warp::path("healthz").and(warp::get()).map(|| "OK");

            // Build Warp handler to render the metrics.
            let metrics = warp::path!("metricsz").and(warp::get()).map(move || {
                run_before_metrics_collection();
                metrics_handle.render()
            });
            let metrics_fut = warp::serve(metrics).bind(metricsz_bind_addr);

            // Spawn the infra endpoints server.
            let server_fut = warp::serve(healthz).bind(bind_addr);

            // Join on both admin servers.
            futures::future::join(server_fut, metrics_fut).await
        });
    });

    Ok(shutdown_receiver)
}
