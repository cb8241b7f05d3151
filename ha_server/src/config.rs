// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnet::Ipv4Net;
use serde::Deserialize;

use engine::action::{Action, ActionTable, GroupKey};
use grpc_util::infra::{GrpcConfig, InfraConfig};

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub global: GlobalSection,

    /// Protected VRRP groups; may be empty, in which case the controller
    /// idles.
    #[serde(default)]
    pub groups: Vec<GroupSection>,

    /// Admin endpoints configuration.
    pub infra: Option<InfraConfig>,

    /// gRPC configuration.
    pub grpc: Option<GrpcConfig>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct GlobalSection {
    /// Port the telemetry dial-out listener binds.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds between reconciliation sweeps.
    #[serde(default = "default_consistency_check_interval_seconds")]
    pub consistency_check_interval_seconds: u64,

    pub aws: AwsSection,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct AwsSection {
    /// VPC-internal EC2 API endpoint; the controller never reaches the
    /// public service endpoints.
    pub ec2_private_endpoint_url: String,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct GroupSection {
    pub xr_interface: String,
    pub vrid: u16,
    pub action: ActionSection,
}

/// Raw action section: one tag plus the union of per-type fields. Resolution
/// into the closed `Action` type happens in `resolve_action`, which rejects
/// fields that do not belong to the tagged type.
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct ActionSection {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub device_index: Option<u32>,
    pub vip: Option<String>,
    pub route_table_id: Option<String>,
    pub destination: Option<String>,
    pub target_network_interface: Option<String>,
}

#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    AwsActivateVip,
    AwsUpdateRouteTable,
}

fn default_port() -> u16 {
    50051
}

fn default_consistency_check_interval_seconds() -> u64 {
    10
}

/// Runtime settings that are not per-group.
#[derive(Clone, Debug)]
pub struct GlobalConfig {
    pub port: u16,
    pub reconcile_interval_seconds: u64,
    pub ec2_endpoint_url: String,
}

#[derive(Debug)]
pub struct ResolvedConfig {
    pub global: GlobalConfig,
    pub actions: ActionTable,
    pub infra: InfraConfig,
    pub grpc: GrpcConfig,
}

impl FromStr for Config {
    type Err = String;

    fn from_str(raw_config: &str) -> Result<Self, Self::Err> {
        serde_yaml::from_str(raw_config).map_err(|e| format!("config parse error: {e}"))
    }
}

impl Config {
    /// Validates the parsed document and produces the immutable runtime
    /// tables.
    pub fn resolve(self) -> Result<ResolvedConfig, String> {
        if self.global.aws.ec2_private_endpoint_url.is_empty() {
            return Err("global.aws.ec2_private_endpoint_url must be non-empty".to_owned());
        }

        let entries = self
            .groups
            .into_iter()
            .map(resolve_group)
            .collect::<Result<Vec<_>, String>>()?;
        let actions = ActionTable::new(entries)?;

        Ok(ResolvedConfig {
            global: GlobalConfig {
                port: self.global.port,
                reconcile_interval_seconds: self.global.consistency_check_interval_seconds,
                ec2_endpoint_url: self.global.aws.ec2_private_endpoint_url,
            },
            actions,
            infra: self.infra.unwrap_or_default(),
            grpc: self.grpc.unwrap_or_default(),
        })
    }
}

fn resolve_group(group: GroupSection) -> Result<(GroupKey, Action), String> {
    let GroupSection {
        xr_interface,
        vrid,
        action,
    } = group;
    let context = format!("group {xr_interface}/{vrid}");

    if !(1..=255).contains(&vrid) {
        return Err(format!("{context}: vrid must be in 1..=255"));
    }
    let key = GroupKey::new(xr_interface, vrid as u8);
    let action = resolve_action(&context, action)?;
    Ok((key, action))
}

fn resolve_action(context: &str, action: ActionSection) -> Result<Action, String> {
    match action.kind {
        ActionKind::AwsActivateVip => {
            reject_field(context, "route_table_id", &action.route_table_id)?;
            reject_field(context, "destination", &action.destination)?;
            reject_field(
                context,
                "target_network_interface",
                &action.target_network_interface,
            )?;

            let device_index = action
                .device_index
                .ok_or_else(|| format!("{context}: aws_activate_vip requires device_index"))?;
            let vip = action
                .vip
                .ok_or_else(|| format!("{context}: aws_activate_vip requires vip"))?;
            let address: Ipv4Addr = vip
                .parse()
                .map_err(|_| format!("{context}: vip {vip:?} is not a valid IPv4 address"))?;

            Ok(Action::AssignAddress {
                device_index,
                address,
            })
        }
        ActionKind::AwsUpdateRouteTable => {
            if action.device_index.is_some() {
                return Err(format!(
                    "{context}: field device_index is not valid for aws_update_route_table"
                ));
            }
            reject_field(context, "vip", &action.vip)?;

            let route_table_id = require_string(context, "route_table_id", action.route_table_id)?;
            let destination_raw = require_string(context, "destination", action.destination)?;
            let destination: Ipv4Net = destination_raw.parse().map_err(|_| {
                format!("{context}: destination {destination_raw:?} is not a valid IPv4 CIDR")
            })?;
            let target_interface_id = require_string(
                context,
                "target_network_interface",
                action.target_network_interface,
            )?;

            Ok(Action::ReplaceRoute {
                route_table_id,
                destination,
                target_interface_id,
            })
        }
    }
}

fn reject_field(context: &str, name: &str, value: &Option<String>) -> Result<(), String> {
    if value.is_some() {
        Err(format!(
            "{context}: field {name} is not valid for this action type"
        ))
    } else {
        Ok(())
    }
}

fn require_string(context: &str, name: &str, value: Option<String>) -> Result<String, String> {
    match value {
        Some(value) if !value.is_empty() => Ok(value),
        Some(_) => Err(format!("{context}: field {name} must be non-empty")),
        None => Err(format!("{context}: field {name} is required")),
    }
}
