// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Arg, Command};
use grpc_util::hyper::AddrIncomingWithStream;
use grpc_util::infra::setup_infra_endpoints;
use grpc_util::logging::setup_logging;
use hyper::server::conn::AddrIncoming;
use protos::mdt_dialout::g_rpc_mdt_dialout_server::GRpcMdtDialoutServer;
use tokio::io::AsyncReadExt;
use tonic::transport::Server;

use cloud::Ec2Adapter;
use engine::backend::CloudBackend;
use engine::pool::WorkerPool;
use engine::{Engine, RoleObserver};
use telemetry::DialoutService;

pub mod config;

/// Unexpected runtime failure; the supervisor should restart the process.
const EXIT_RUNTIME_FAILURE: i32 = 1;
/// Initialization failure; operator intervention is required.
const EXIT_INIT_FAILURE: i32 = 2;

fn init_failure(context: &str, err: impl std::fmt::Display) -> ! {
    log::error!("{context}: {err}");
    std::process::exit(EXIT_INIT_FAILURE);
}

/// Any panic exits the whole process so the supervisor restarts it into a
/// clean cold start. Tokio would otherwise contain the panic to one task and
/// leave a half-working controller behind.
fn install_panic_exit_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        log::error!("unexpected panic, exiting: {panic_info}");
        std::process::exit(EXIT_RUNTIME_FAILURE);
    }));
}

#[tokio::main]
async fn main() {
    setup_logging();
    install_panic_exit_hook();

    let matches = Command::new("ha_server")
        .arg(
            Arg::new("config")
                .short('c')
                .value_name("FILE")
                .default_value("/etc/ha_app/config.yaml"),
        )
        .get_matches();

    let config = {
        let config_filename = matches.get_one::<String>("config").unwrap();
        let mut file = match tokio::fs::File::open(config_filename).await {
            Ok(file) => file,
            Err(err) => init_failure(&format!("failed to open {config_filename}"), err),
        };
        let mut config_str = String::new();
        if let Err(err) = file.read_to_string(&mut config_str).await {
            init_failure(&format!("failed to read {config_filename}"), err);
        }
        match config::Config::from_str(&config_str).and_then(config::Config::resolve) {
            Ok(resolved) => resolved,
            Err(err) => init_failure("invalid configuration", err),
        }
    };
    let config::ResolvedConfig {
        global,
        actions,
        infra,
        grpc,
    } = config;
    log::info!("ha server config: {global:?}, {} group(s)", actions.len());

    let adapter = match Ec2Adapter::initialize(&global.ec2_endpoint_url).await {
        Ok(adapter) => Arc::new(adapter),
        Err(err) => init_failure("cloud adapter initialization failed", err),
    };

    // Every cloud object the action table references must exist before the
    // telemetry listener comes up.
    for (key, action) in actions.iter() {
        for resource in action.resources() {
            if let Err(err) = adapter.validate_resource(&resource).await {
                init_failure(&format!("[{key}] validation of {resource} failed"), err);
            }
        }
    }

    // One worker per configured group plus slack, bounded so a misbehaving
    // peer cannot make the pool grow.
    let pool_size = (actions.len() + 2).clamp(2, 8);
    let cloud: Arc<dyn CloudBackend> = adapter;
    let engine = Engine::new(
        Arc::new(actions),
        cloud,
        WorkerPool::new(pool_size),
        Duration::from_secs(global.reconcile_interval_seconds),
    );

    // Setup infra endpoints.
    let mut shutdown_receiver = {
        let engine = engine.clone();
        match setup_infra_endpoints(infra, move || engine.update_gauges()) {
            Ok(receiver) => receiver,
            Err(err) => init_failure("failed to start admin endpoints", err),
        }
    };

    let address = SocketAddr::from(([0, 0, 0, 0], global.port));
    let incoming = match AddrIncoming::bind(&address) {
        Ok(incoming) => incoming,
        Err(err) => init_failure(&format!("failed to bind telemetry listener on {address}"), err),
    };
    log::info!("serving telemetry dial-out on {address}");

    // The reconcile loop runs on its own task for the life of the process;
    // a panic inside it exits through the panic hook.
    {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run_reconcile_loop().await });
    }

    let observer: Arc<dyn RoleObserver> = Arc::new(engine);
    let server = grpc
        .apply_to_server(Server::builder())
        .add_service(GRpcMdtDialoutServer::new(DialoutService::new(observer)))
        .serve_with_incoming_shutdown(AddrIncomingWithStream(incoming), async move {
            while shutdown_receiver.changed().await.is_ok() {}
        });

    if let Err(err) = server.await {
        log::error!("telemetry server failed: {err}");
        std::process::exit(EXIT_RUNTIME_FAILURE);
    }
    log::info!("telemetry server stopped; exiting");
}
