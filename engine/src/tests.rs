// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use parking_lot::Mutex;
use tokio::sync::Barrier;
use tokio::time::{sleep, timeout, Duration};

use crate::action::{Action, ActionTable, CloudResource, GroupKey};
use crate::backend::{ApplyOutcome, CloudBackend, CloudError};
use crate::pool::WorkerPool;
use crate::session::Role;
use crate::{DisconnectReason, Engine, RoleObserver};

#[derive(Clone, Debug, PartialEq, Eq)]
enum CloudCall {
    Assign {
        device_index: u32,
        address: Ipv4Addr,
        precheck: bool,
    },
    Route {
        route_table_id: String,
        target_interface_id: String,
        precheck: bool,
    },
}

impl CloudCall {
    fn precheck(&self) -> bool {
        match self {
            CloudCall::Assign { precheck, .. } | CloudCall::Route { precheck, .. } => *precheck,
        }
    }
}

/// Records every adapter invocation; behavior knobs emulate precheck hits,
/// transient failures, and overlapping in-flight calls.
#[derive(Default)]
struct MockCloud {
    calls: Mutex<Vec<CloudCall>>,
    /// When set, prechecks report the cloud as already in the desired state.
    precheck_hit: AtomicBool,
    /// Fail this many upcoming replace_route calls with a Transient error.
    fail_routes: AtomicUsize,
    /// When present, every mutating call rendezvouses here, proving overlap.
    mutation_barrier: Option<Arc<Barrier>>,
}

impl MockCloud {
    fn calls(&self) -> Vec<CloudCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl CloudBackend for MockCloud {
    async fn validate_resource(&self, _resource: &CloudResource) -> Result<(), CloudError> {
        Ok(())
    }

    async fn assign_secondary_address(
        &self,
        device_index: u32,
        address: Ipv4Addr,
        precheck: bool,
    ) -> Result<ApplyOutcome, CloudError> {
        self.calls.lock().push(CloudCall::Assign {
            device_index,
            address,
            precheck,
        });
        if precheck && self.precheck_hit.load(Ordering::SeqCst) {
            return Ok(ApplyOutcome::AlreadyCurrent);
        }
        if !precheck {
            if let Some(barrier) = &self.mutation_barrier {
                barrier.wait().await;
            }
        }
        Ok(ApplyOutcome::Applied)
    }

    async fn replace_route(
        &self,
        route_table_id: &str,
        _destination: Ipv4Net,
        target_interface_id: &str,
        precheck: bool,
    ) -> Result<ApplyOutcome, CloudError> {
        self.calls.lock().push(CloudCall::Route {
            route_table_id: route_table_id.to_owned(),
            target_interface_id: target_interface_id.to_owned(),
            precheck,
        });
        if self
            .fail_routes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CloudError::Transient("throttled".to_owned()));
        }
        if precheck && self.precheck_hit.load(Ordering::SeqCst) {
            return Ok(ApplyOutcome::AlreadyCurrent);
        }
        if !precheck {
            if let Some(barrier) = &self.mutation_barrier {
                barrier.wait().await;
            }
        }
        Ok(ApplyOutcome::Applied)
    }
}

fn key_a() -> GroupKey {
    GroupKey::new("HundredGigE0/0/0/1", 1)
}

fn key_b() -> GroupKey {
    GroupKey::new("HundredGigE0/0/0/2", 2)
}

fn assign_action() -> Action {
    Action::AssignAddress {
        device_index: 0,
        address: "10.0.2.100".parse().unwrap(),
    }
}

fn route_action() -> Action {
    Action::ReplaceRoute {
        route_table_id: "rtb-abc".to_owned(),
        destination: "192.0.2.0/24".parse().unwrap(),
        target_interface_id: "eni-xyz".to_owned(),
    }
}

fn engine_with(entries: Vec<(GroupKey, Action)>, cloud: Arc<MockCloud>) -> Engine {
    let actions = Arc::new(ActionTable::new(entries).unwrap());
    Engine::new(actions, cloud, WorkerPool::new(4), Duration::from_secs(10))
}

async fn wait_for_calls(cloud: &MockCloud, want: usize) {
    timeout(Duration::from_secs(5), async {
        while cloud.calls.lock().len() < want {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for cloud calls");
}

#[tokio::test]
async fn cold_bring_up_dispatches_one_assignment() {
    let cloud = Arc::new(MockCloud::default());
    let engine = engine_with(vec![(key_a(), assign_action())], cloud.clone());

    engine.on_connect("peer");
    engine.observe(&key_a(), Role::Active);
    wait_for_calls(&cloud, 1).await;

    assert_eq!(
        cloud.calls(),
        vec![CloudCall::Assign {
            device_index: 0,
            address: "10.0.2.100".parse().unwrap(),
            precheck: false,
        }]
    );
    assert_eq!(engine.sessions().get(&key_a()), Some(Role::Active));
}

#[tokio::test]
async fn duplicate_active_is_not_redispatched() {
    let cloud = Arc::new(MockCloud::default());
    let engine = engine_with(vec![(key_a(), assign_action())], cloud.clone());

    engine.observe(&key_a(), Role::Active);
    wait_for_calls(&cloud, 1).await;
    engine.observe(&key_a(), Role::Active);

    // Allow any (incorrect) second dispatch a chance to land.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(cloud.calls().len(), 1);
}

#[tokio::test]
async fn reconcile_uses_precheck_and_does_not_mutate_on_hit() {
    let cloud = Arc::new(MockCloud::default());
    cloud.precheck_hit.store(true, Ordering::SeqCst);
    let engine = engine_with(vec![(key_a(), assign_action())], cloud.clone());

    engine.observe(&key_a(), Role::Active);
    wait_for_calls(&cloud, 1).await;

    engine.reconcile_once().await;

    let calls = cloud.calls();
    assert_eq!(calls.len(), 2);
    assert!(!calls[0].precheck());
    assert!(calls[1].precheck());
}

#[tokio::test]
async fn reconcile_skips_inactive_entries() {
    let cloud = Arc::new(MockCloud::default());
    let engine = engine_with(vec![(key_a(), assign_action())], cloud.clone());

    engine.reconcile_once().await;

    assert!(cloud.calls().is_empty());
}

#[tokio::test]
async fn disconnect_resets_sessions_and_silences_reconcile() {
    let cloud = Arc::new(MockCloud::default());
    let engine = engine_with(vec![(key_a(), assign_action())], cloud.clone());

    engine.observe(&key_a(), Role::Active);
    wait_for_calls(&cloud, 1).await;

    engine.on_disconnect("peer", DisconnectReason::TransportLost);
    assert_eq!(engine.sessions().get(&key_a()), Some(Role::Inactive));

    engine.reconcile_once().await;
    assert_eq!(cloud.calls().len(), 1);
}

#[tokio::test]
async fn reconnect_and_repeated_active_redispatches_once() {
    let cloud = Arc::new(MockCloud::default());
    let engine = engine_with(vec![(key_a(), assign_action())], cloud.clone());

    engine.observe(&key_a(), Role::Active);
    wait_for_calls(&cloud, 1).await;

    engine.on_disconnect("peer", DisconnectReason::ClosedByPeer);
    engine.on_connect("peer");
    engine.observe(&key_a(), Role::Active);
    wait_for_calls(&cloud, 2).await;

    let calls = cloud.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|call| !call.precheck()));
}

#[tokio::test]
async fn mixed_actions_dispatch_with_overlapping_lifetimes() {
    let barrier = Arc::new(Barrier::new(2));
    let cloud = Arc::new(MockCloud {
        mutation_barrier: Some(barrier),
        ..MockCloud::default()
    });
    let engine = engine_with(
        vec![(key_a(), assign_action()), (key_b(), route_action())],
        cloud.clone(),
    );

    // Both observations arrive in one telemetry message; the dispatched
    // tasks only complete if they are in flight at the same time.
    engine.observe(&key_a(), Role::Active);
    engine.observe(&key_b(), Role::Active);
    wait_for_calls(&cloud, 2).await;

    let calls = cloud.calls();
    assert!(calls.contains(&CloudCall::Assign {
        device_index: 0,
        address: "10.0.2.100".parse().unwrap(),
        precheck: false,
    }));
    assert!(calls.contains(&CloudCall::Route {
        route_table_id: "rtb-abc".to_owned(),
        target_interface_id: "eni-xyz".to_owned(),
        precheck: false,
    }));
}

#[tokio::test]
async fn transient_failure_leaves_session_active_for_reconcile() {
    let cloud = Arc::new(MockCloud::default());
    cloud.fail_routes.store(1, Ordering::SeqCst);
    let engine = engine_with(vec![(key_b(), route_action())], cloud.clone());

    engine.observe(&key_b(), Role::Active);
    wait_for_calls(&cloud, 1).await;

    // The failed go-active must not flip the session back.
    assert_eq!(engine.sessions().get(&key_b()), Some(Role::Active));

    engine.reconcile_once().await;

    let calls = cloud.calls();
    assert_eq!(calls.len(), 2);
    assert!(!calls[0].precheck());
    assert!(calls[1].precheck());
}

#[tokio::test]
async fn unknown_group_is_dropped_without_dispatch() {
    let cloud = Arc::new(MockCloud::default());
    let engine = engine_with(vec![(key_a(), assign_action())], cloud.clone());

    let stranger = GroupKey::new("HundredGigE0/0/0/9", 7);
    engine.observe(&stranger, Role::Active);

    sleep(Duration::from_millis(100)).await;
    assert!(cloud.calls().is_empty());
    assert_eq!(engine.sessions().get(&stranger), None);
    assert_eq!(engine.sessions().snapshot().len(), 1);
}

#[tokio::test]
async fn active_to_inactive_has_no_side_effect() {
    let cloud = Arc::new(MockCloud::default());
    let engine = engine_with(vec![(key_a(), assign_action())], cloud.clone());

    engine.observe(&key_a(), Role::Active);
    wait_for_calls(&cloud, 1).await;
    engine.observe(&key_a(), Role::Inactive);

    sleep(Duration::from_millis(100)).await;
    assert_eq!(cloud.calls().len(), 1);
    assert_eq!(engine.sessions().get(&key_a()), Some(Role::Inactive));
}
