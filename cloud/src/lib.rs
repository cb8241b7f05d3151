// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

use std::net::Ipv4Addr;

use async_trait::async_trait;
use aws_config::imds;
use aws_config::imds::credentials::ImdsCredentialsProvider;
use aws_sdk_ec2::error::{
    AssignPrivateIpAddressesError, CreateRouteError, DescribeNetworkInterfacesError,
    DescribeRouteTablesError, ReplaceRouteError,
};
use aws_sdk_ec2::model::{Filter, NetworkInterface};
use aws_sdk_ec2::types::SdkError;
use aws_sdk_ec2::{Client, Region};
use aws_credential_types::provider::SharedCredentialsProvider;
use http::Uri;
use ipnet::Ipv4Net;

use engine::action::CloudResource;
use engine::backend::{ApplyOutcome, CloudBackend, CloudError};

/// Service error codes that the provider documents as retry-worthy.
const TRANSIENT_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "RequestTimeout",
    "ServiceUnavailable",
    "InternalError",
    "Unavailable",
];

/// EC2-backed implementation of the engine's cloud surface.
///
/// Identity (instance-id, region) and credentials come from the host
/// metadata service; the SDK performs the IMDSv2 token-then-fetch handshake
/// on every read and rotates credentials internally. All calls go to the
/// caller-supplied private endpoint.
pub struct Ec2Adapter {
    client: Client,
    instance_id: String,
}

impl Ec2Adapter {
    /// Builds the long-lived EC2 client. Failures here are fatal to the
    /// process; there is no point serving telemetry without a working cloud
    /// surface.
    pub async fn initialize(endpoint_url: &str) -> Result<Ec2Adapter, String> {
        let endpoint_uri: Uri = endpoint_url
            .parse()
            .map_err(|err| format!("invalid EC2 endpoint URL {endpoint_url:?}: {err}"))?;

        let imds_client = imds::Client::builder()
            .build()
            .await
            .map_err(|err| format!("failed to construct instance metadata client: {err}"))?;
        let instance_id = imds_client
            .get("/latest/meta-data/instance-id")
            .await
            .map_err(|err| format!("failed to read instance-id from metadata service: {err}"))?;
        let region = imds_client
            .get("/latest/meta-data/placement/region")
            .await
            .map_err(|err| format!("failed to read region from metadata service: {err}"))?;
        log::info!(
            "cloud adapter bound to instance {instance_id} in {region}, endpoint {endpoint_url}"
        );

        let credentials = ImdsCredentialsProvider::builder()
            .imds_client(imds_client)
            .build();
        let config = aws_sdk_ec2::Config::builder()
            .region(Region::new(region))
            .credentials_provider(SharedCredentialsProvider::new(credentials))
            .endpoint_url(endpoint_uri.to_string())
            .build();

        Ok(Ec2Adapter {
            client: Client::from_conf(config),
            instance_id,
        })
    }

    /// Resolves a device index to the network interface attached to the
    /// local instance at that index.
    async fn resolve_device_index(&self, device_index: u32) -> Result<NetworkInterface, CloudError> {
        let response = self
            .client
            .describe_network_interfaces()
            .filters(
                Filter::builder()
                    .name("attachment.instance-id")
                    .values(&self.instance_id)
                    .build(),
            )
            .filters(
                Filter::builder()
                    .name("attachment.device-index")
                    .values(device_index.to_string())
                    .build(),
            )
            .send()
            .await
            .map_err(|err| classify_sdk_error("DescribeNetworkInterfaces", err))?;

        response
            .network_interfaces()
            .unwrap_or_default()
            .first()
            .cloned()
            .ok_or_else(|| {
                CloudError::ResourceNotFound(format!(
                    "no network interface at device index {device_index} on instance {}",
                    self.instance_id
                ))
            })
    }
}

#[async_trait]
impl CloudBackend for Ec2Adapter {
    async fn validate_resource(&self, resource: &CloudResource) -> Result<(), CloudError> {
        match resource {
            CloudResource::RouteTable(id) => {
                let response = self
                    .client
                    .describe_route_tables()
                    .route_table_ids(id)
                    .send()
                    .await
                    .map_err(|err| classify_sdk_error("DescribeRouteTables", err))?;
                if response.route_tables().unwrap_or_default().is_empty() {
                    return Err(CloudError::ResourceNotFound(format!("route table {id}")));
                }
            }
            CloudResource::NetworkInterface(id) => {
                let response = self
                    .client
                    .describe_network_interfaces()
                    .network_interface_ids(id)
                    .send()
                    .await
                    .map_err(|err| classify_sdk_error("DescribeNetworkInterfaces", err))?;
                if response.network_interfaces().unwrap_or_default().is_empty() {
                    return Err(CloudError::ResourceNotFound(format!(
                        "network interface {id}"
                    )));
                }
            }
            CloudResource::DeviceIndex(index) => {
                self.resolve_device_index(*index).await?;
            }
        }
        log::debug!("validated {resource}");
        Ok(())
    }

    async fn assign_secondary_address(
        &self,
        device_index: u32,
        address: Ipv4Addr,
        precheck: bool,
    ) -> Result<ApplyOutcome, CloudError> {
        let interface = self.resolve_device_index(device_index).await?;
        let interface_id = interface
            .network_interface_id()
            .ok_or_else(|| {
                CloudError::Permanent(format!(
                    "network interface at device index {device_index} has no id"
                ))
            })?
            .to_owned();

        if precheck {
            let needle = address.to_string();
            let present = interface
                .private_ip_addresses()
                .unwrap_or_default()
                .iter()
                .filter_map(|entry| entry.private_ip_address())
                .any(|ip| ip == needle);
            if present {
                log::debug!("{address} already assigned to {interface_id}");
                return Ok(ApplyOutcome::AlreadyCurrent);
            }
        }

        self.client
            .assign_private_ip_addresses()
            .network_interface_id(&interface_id)
            .private_ip_addresses(address.to_string())
            .allow_reassignment(true)
            .send()
            .await
            .map_err(|err| classify_sdk_error("AssignPrivateIpAddresses", err))?;
        log::info!("assigned {address} to {interface_id} (device index {device_index})");
        Ok(ApplyOutcome::Applied)
    }

    async fn replace_route(
        &self,
        route_table_id: &str,
        destination: Ipv4Net,
        target_interface_id: &str,
        precheck: bool,
    ) -> Result<ApplyOutcome, CloudError> {
        let destination_cidr = destination.to_string();

        if precheck {
            let response = self
                .client
                .describe_route_tables()
                .route_table_ids(route_table_id)
                .send()
                .await
                .map_err(|err| classify_sdk_error("DescribeRouteTables", err))?;
            let table = response
                .route_tables()
                .unwrap_or_default()
                .first()
                .cloned()
                .ok_or_else(|| {
                    CloudError::ResourceNotFound(format!("route table {route_table_id}"))
                })?;
            let in_place = table.routes().unwrap_or_default().iter().any(|route| {
                route.destination_cidr_block() == Some(destination_cidr.as_str())
                    && route.network_interface_id() == Some(target_interface_id)
            });
            if in_place {
                log::debug!(
                    "route {destination_cidr} -> {target_interface_id} already in {route_table_id}"
                );
                return Ok(ApplyOutcome::AlreadyCurrent);
            }
        }

        let replace = self
            .client
            .replace_route()
            .route_table_id(route_table_id)
            .destination_cidr_block(&destination_cidr)
            .network_interface_id(target_interface_id)
            .send()
            .await;
        match replace {
            Ok(_) => {
                log::info!(
                    "replaced route {destination_cidr} -> {target_interface_id} in {route_table_id}"
                );
                Ok(ApplyOutcome::Applied)
            }
            // The route is absent from the table; create it instead. This is
            // the only fallback the adapter performs.
            Err(SdkError::ServiceError(ref service_err))
                if service_err.err().code() == Some("InvalidRoute.NotFound") =>
            {
                self.client
                    .create_route()
                    .route_table_id(route_table_id)
                    .destination_cidr_block(&destination_cidr)
                    .network_interface_id(target_interface_id)
                    .send()
                    .await
                    .map_err(|err| classify_sdk_error("CreateRoute", err))?;
                log::info!(
                    "created route {destination_cidr} -> {target_interface_id} in {route_table_id}"
                );
                Ok(ApplyOutcome::Applied)
            }
            Err(err) => Err(classify_sdk_error("ReplaceRoute", err)),
        }
    }
}

/// Access to the provider error code/message shared by all EC2 operation
/// errors this adapter issues.
trait ErrorMeta {
    fn error_code(&self) -> Option<&str>;
    fn error_message(&self) -> Option<&str>;
}

impl ErrorMeta for DescribeNetworkInterfacesError {
    fn error_code(&self) -> Option<&str> {
        self.code()
    }
    fn error_message(&self) -> Option<&str> {
        self.message()
    }
}

impl ErrorMeta for DescribeRouteTablesError {
    fn error_code(&self) -> Option<&str> {
        self.code()
    }
    fn error_message(&self) -> Option<&str> {
        self.message()
    }
}

impl ErrorMeta for AssignPrivateIpAddressesError {
    fn error_code(&self) -> Option<&str> {
        self.code()
    }
    fn error_message(&self) -> Option<&str> {
        self.message()
    }
}

impl ErrorMeta for ReplaceRouteError {
    fn error_code(&self) -> Option<&str> {
        self.code()
    }
    fn error_message(&self) -> Option<&str> {
        self.message()
    }
}

impl ErrorMeta for CreateRouteError {
    fn error_code(&self) -> Option<&str> {
        self.code()
    }
    fn error_message(&self) -> Option<&str> {
        self.message()
    }
}

/// Buckets an SDK failure into the engine's error taxonomy. Transport-level
/// failures (timeouts, connector errors, unparseable responses) are always
/// transient; service errors are classified by provider code and HTTP
/// status.
fn classify_sdk_error<E>(op: &'static str, err: SdkError<E>) -> CloudError
where
    E: ErrorMeta + std::fmt::Debug,
{
    match err {
        SdkError::ServiceError(service_err) => {
            let raw = service_err.raw().http().status().as_u16();
            let err = service_err.into_err();
            classify_service_error(op, err.error_code(), err.error_message(), raw)
        }
        SdkError::TimeoutError(source) => {
            CloudError::Transient(format!("{op}: request timed out: {source:?}"))
        }
        SdkError::DispatchFailure(source) => {
            CloudError::Transient(format!("{op}: dispatch failure: {source:?}"))
        }
        SdkError::ResponseError(source) => {
            CloudError::Transient(format!("{op}: unparseable response: {source:?}"))
        }
        SdkError::ConstructionFailure(source) => {
            CloudError::Permanent(format!("{op}: failed to construct request: {source:?}"))
        }
        other => CloudError::Transient(format!("{op}: {other:?}")),
    }
}

fn classify_service_error(
    op: &'static str,
    code: Option<&str>,
    message: Option<&str>,
    http_status: u16,
) -> CloudError {
    let code = code.unwrap_or("Unknown");
    let detail = format!("{op}: {code}: {}", message.unwrap_or("(no message)"));

    if http_status >= 500 || TRANSIENT_CODES.contains(&code) {
        CloudError::Transient(detail)
    } else if code.starts_with("Invalid") && code.ends_with(".NotFound") {
        CloudError::ResourceNotFound(detail)
    } else {
        CloudError::Permanent(detail)
    }
}
