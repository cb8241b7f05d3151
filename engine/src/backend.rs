// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnet::Ipv4Net;

use crate::action::{Action, CloudResource};

/// Classified failure of a cloud operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloudError {
    /// The referenced cloud object does not exist or does not resolve.
    ResourceNotFound(String),
    /// Provider-side 5xx, timeout, or throttling. The next reconcile tick is
    /// the retry path.
    Transient(String),
    /// Authorization or malformed-input failure. Recovery requires operator
    /// intervention.
    Permanent(String),
}

impl std::error::Error for CloudError {}

impl fmt::Display for CloudError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloudError::ResourceNotFound(msg) => write!(f, "resource not found: {msg}"),
            CloudError::Transient(msg) => write!(f, "transient cloud failure: {msg}"),
            CloudError::Permanent(msg) => write!(f, "permanent cloud failure: {msg}"),
        }
    }
}

/// Whether an operation found the cloud already in the desired state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Precheck hit: the desired state was already in place, nothing was
    /// mutated.
    AlreadyCurrent,
    /// The mutating provider call was issued.
    Applied,
}

/// The abstract cloud surface the engine drives.
///
/// All operations complete before their future resolves; implementations
/// must not spawn background work that calls back into the engine.
#[async_trait]
pub trait CloudBackend: Send + Sync + 'static {
    /// Confirms that a referenced cloud object exists. Called once per
    /// referenced resource at startup; failures are fatal.
    async fn validate_resource(&self, resource: &CloudResource) -> Result<(), CloudError>;

    /// Assigns `address` as a secondary private address of the network
    /// interface at `device_index`, moving it from any other interface that
    /// currently holds it. With `precheck`, returns `AlreadyCurrent` without
    /// side effect when the address is already present.
    async fn assign_secondary_address(
        &self,
        device_index: u32,
        address: Ipv4Addr,
        precheck: bool,
    ) -> Result<ApplyOutcome, CloudError>;

    /// Points the route for `destination` in `route_table_id` at
    /// `target_interface_id`. With `precheck`, returns `AlreadyCurrent`
    /// without side effect when the route already targets that interface.
    async fn replace_route(
        &self,
        route_table_id: &str,
        destination: Ipv4Net,
        target_interface_id: &str,
        precheck: bool,
    ) -> Result<ApplyOutcome, CloudError>;
}

/// Runs the provider call an action is bound to.
pub async fn apply_action(
    backend: &dyn CloudBackend,
    action: &Action,
    precheck: bool,
) -> Result<ApplyOutcome, CloudError> {
    match action {
        Action::AssignAddress {
            device_index,
            address,
        } => {
            backend
                .assign_secondary_address(*device_index, *address, precheck)
                .await
        }
        Action::ReplaceRoute {
            route_table_id,
            destination,
            target_interface_id,
        } => {
            backend
                .replace_route(route_table_id, *destination, target_interface_id, precheck)
                .await
        }
    }
}
