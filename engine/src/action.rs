// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

/// Canonical identity of a protected VRRP session: the router interface the
/// group runs on plus the virtual router ID (1..=255).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub interface: String,
    pub vrid: u8,
}

impl GroupKey {
    pub fn new(interface: impl Into<String>, vrid: u8) -> Self {
        GroupKey {
            interface: interface.into(),
            vrid,
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.interface, self.vrid)
    }
}

/// The cloud-side mutation bound to a VRRP group. Exactly one action is
/// configured per group; the variant fields are closed (the configuration
/// loader is the single site of discrimination).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Attract traffic for a virtual IP by assigning it as a secondary private
    /// address of the local instance's network interface at `device_index`,
    /// reassigning it away from whichever interface held it before.
    AssignAddress {
        device_index: u32,
        address: Ipv4Addr,
    },

    /// Point the route for `destination` in a route table at the local
    /// router's network interface.
    ReplaceRoute {
        route_table_id: String,
        destination: Ipv4Net,
        target_interface_id: String,
    },
}

impl Action {
    /// The cloud objects this action depends on. Each is confirmed to exist
    /// once at startup, before the telemetry listener comes up.
    pub fn resources(&self) -> Vec<CloudResource> {
        match self {
            Action::AssignAddress { device_index, .. } => {
                vec![CloudResource::DeviceIndex(*device_index)]
            }
            Action::ReplaceRoute {
                route_table_id,
                target_interface_id,
                ..
            } => vec![
                CloudResource::RouteTable(route_table_id.clone()),
                CloudResource::NetworkInterface(target_interface_id.clone()),
            ],
        }
    }
}

/// A cloud object referenced by an `Action`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloudResource {
    RouteTable(String),
    NetworkInterface(String),
    /// A device index that must resolve to a network interface attached to
    /// the local instance.
    DeviceIndex(u32),
}

impl fmt::Display for CloudResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloudResource::RouteTable(id) => write!(f, "route table {id}"),
            CloudResource::NetworkInterface(id) => write!(f, "network interface {id}"),
            CloudResource::DeviceIndex(index) => write!(f, "device index {index}"),
        }
    }
}

/// Immutable mapping from group to bound action, fixed at startup.
///
/// Iteration follows configuration order, which is also the order the
/// reconcile loop sweeps in.
#[derive(Debug)]
pub struct ActionTable {
    order: Vec<GroupKey>,
    actions: HashMap<GroupKey, Action>,
}

impl ActionTable {
    /// Builds the table, rejecting duplicate group keys.
    pub fn new(entries: Vec<(GroupKey, Action)>) -> Result<ActionTable, String> {
        let mut order = Vec::with_capacity(entries.len());
        let mut actions = HashMap::with_capacity(entries.len());
        for (key, action) in entries {
            if actions.insert(key.clone(), action).is_some() {
                return Err(format!("duplicate group {key}"));
            }
            order.push(key);
        }
        Ok(ActionTable { order, actions })
    }

    pub fn get(&self, key: &GroupKey) -> Option<&Action> {
        self.actions.get(key)
    }

    pub fn contains(&self, key: &GroupKey) -> bool {
        self.actions.contains_key(key)
    }

    /// Group keys in configuration order.
    pub fn keys(&self) -> impl Iterator<Item = &GroupKey> {
        self.order.iter()
    }

    /// (key, action) pairs in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = (&GroupKey, &Action)> {
        self.order.iter().map(|key| (key, &self.actions[key]))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
