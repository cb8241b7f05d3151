// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tonic::{Request, Response, Status, Streaming};

use engine::{DisconnectReason, RoleObserver};
use protos::mdt_dialout::g_rpc_mdt_dialout_server::GRpcMdtDialout;
use protos::mdt_dialout::MdtDialoutArgs;

use crate::decode::{decode_payload, MessageOutcome, VRRP_ENCODING_PATH};

/// Terminates the router's telemetry dial-out.
///
/// At most one stream is admitted at a time; the router re-dials after any
/// disconnect, and the transport's keepalive discipline bounds how long a
/// dead peer can hold the slot.
#[derive(Clone)]
pub struct DialoutService {
    inner: Arc<DialoutInner>,
}

struct DialoutInner {
    observer: Arc<dyn RoleObserver>,
    stream_active: AtomicBool,
    // Paths already complained about, so a peer with a misconfigured
    // subscription cannot flood the logs.
    logged_non_kv_paths: Mutex<HashSet<String>>,
    logged_unexpected_paths: Mutex<HashSet<String>>,
}

impl DialoutService {
    pub fn new(observer: Arc<dyn RoleObserver>) -> DialoutService {
        DialoutService {
            inner: Arc::new(DialoutInner {
                observer,
                stream_active: AtomicBool::new(false),
                logged_non_kv_paths: Mutex::default(),
                logged_unexpected_paths: Mutex::default(),
            }),
        }
    }
}

impl DialoutInner {
    fn handle_message(&self, peer: &str, message: &MdtDialoutArgs) {
        metrics::increment_counter!("ha_app_telemetry_messages_total");

        if !message.errors.is_empty() {
            log::warn!("telemetry peer {peer} reported an error: {}", message.errors);
            return;
        }

        match decode_payload(&message.data) {
            Ok(MessageOutcome::Observations {
                observations,
                malformed_rows,
            }) => {
                for context in malformed_rows {
                    metrics::increment_counter!("ha_app_telemetry_decode_failures_total");
                    log::error!("malformed telemetry row on {VRRP_ENCODING_PATH}: {context}");
                }
                for observation in observations {
                    self.observer.observe(&observation.key, observation.role);
                }
            }
            Ok(MessageOutcome::NotKeyValue { path }) => {
                if self.logged_non_kv_paths.lock().insert(path.clone()) {
                    log::warn!("dropping non-key-value telemetry for path {path:?}");
                }
            }
            Ok(MessageOutcome::UnexpectedPath { path }) => {
                if self.logged_unexpected_paths.lock().insert(path.clone()) {
                    log::warn!("dropping telemetry for unexpected path {path:?}");
                }
            }
            Err(err) => {
                metrics::increment_counter!("ha_app_telemetry_decode_failures_total");
                log::error!("dropping undecodable telemetry message from {peer}: {err}");
            }
        }
    }
}

/// Releases the single-stream slot and fires the disconnect callback on
/// every exit path, including server-side teardown of the stream task.
struct StreamGuard {
    inner: Arc<DialoutInner>,
    peer: String,
    reason: DisconnectReason,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.inner.stream_active.store(false, Ordering::SeqCst);
        self.inner.observer.on_disconnect(&self.peer, self.reason);
    }
}

#[tonic::async_trait]
impl GRpcMdtDialout for DialoutService {
    type MdtDialoutStream = Pin<Box<dyn Stream<Item = Result<MdtDialoutArgs, Status>> + Send>>;

    #[tracing::instrument(skip_all)]
    async fn mdt_dialout(
        &self,
        request: Request<Streaming<MdtDialoutArgs>>,
    ) -> Result<Response<Self::MdtDialoutStream>, Status> {
        let peer = request
            .remote_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_owned());

        if self
            .inner
            .stream_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::warn!("refusing second concurrent telemetry stream from {peer}");
            return Err(Status::resource_exhausted(
                "a telemetry stream is already active",
            ));
        }

        log::info!("telemetry stream accepted from {peer}");
        self.inner.observer.on_connect(&peer);

        // Messages are consumed on a single task, which keeps delivery
        // single-threaded and in wire order. Nothing is ever written back to
        // the router; the pending response stream just holds the RPC open.
        let inner = self.inner.clone();
        let mut inbound = request.into_inner();
        tokio::spawn(async move {
            let mut guard = StreamGuard {
                inner: inner.clone(),
                peer: peer.clone(),
                reason: DisconnectReason::TransportLost,
            };
            loop {
                match inbound.next().await {
                    Some(Ok(message)) => inner.handle_message(&peer, &message),
                    Some(Err(status)) => {
                        log::warn!("telemetry stream from {peer} failed: {status}");
                        break;
                    }
                    None => {
                        guard.reason = DisconnectReason::ClosedByPeer;
                        break;
                    }
                }
            }
        });

        Ok(Response::new(Box::pin(futures::stream::pending::<
            Result<MdtDialoutArgs, Status>,
        >())))
    }
}
