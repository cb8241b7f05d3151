// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

use prost::Message;

use engine::action::GroupKey;
use engine::session::Role;
use protos::telemetry::telemetry_field::ValueByType;
use protos::telemetry::{Telemetry, TelemetryField};

/// YANG operational path whose key-value payloads this receiver consumes.
pub const VRRP_ENCODING_PATH: &str =
    "Cisco-IOS-XR-ipv4-vrrp-oper:vrrp/ipv4/virtual-routers/virtual-router";

const INTERFACE_FIELD: &str = "interface-name";
const VRID_FIELD: &str = "virtual-router-id";
const STATE_FIELD: &str = "vrrp-state";

/// Literal the router reports while holding the master role, matched as an
/// ASCII-case-insensitive suffix. Every other state string maps to Inactive;
/// no further mappings are inferred from the wire dictionary.
const MASTER_STATE_SUFFIX: &str = "state-master";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VrrpObservation {
    pub key: GroupKey,
    pub role: Role,
}

/// One decoded dial-out payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Key-value payload on the VRRP path. `observations` is in wire order;
    /// `malformed_rows` names rows that lacked an expected subfield.
    Observations {
        observations: Vec<VrrpObservation>,
        malformed_rows: Vec<String>,
    },
    /// The envelope carried compact GPB rather than self-describing
    /// key-value content.
    NotKeyValue { path: String },
    /// Key-value payload for a path this controller does not consume.
    UnexpectedPath { path: String },
}

/// Failure to decode a dial-out payload at the envelope level.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodeError(String);

impl std::error::Error for DecodeError {}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "telemetry decode failed: {}", self.0)
    }
}

/// Decodes one `MdtDialoutArgs.data` payload into VRRP role observations.
pub fn decode_payload(data: &[u8]) -> Result<MessageOutcome, DecodeError> {
    let envelope =
        Telemetry::decode(data).map_err(|err| DecodeError(format!("envelope: {err}")))?;
    let path = envelope.encoding_path.clone();

    if envelope.data_gpb.is_some() {
        return Ok(MessageOutcome::NotKeyValue { path });
    }
    if path != VRRP_ENCODING_PATH {
        return Ok(MessageOutcome::UnexpectedPath { path });
    }

    let mut observations = Vec::new();
    let mut malformed_rows = Vec::new();
    for (row_index, row) in envelope.data_gpbkv.iter().enumerate() {
        match extract_row(row) {
            Ok(observation) => observations.push(observation),
            Err(context) => malformed_rows.push(format!("row {row_index}: {context}")),
        }
    }

    Ok(MessageOutcome::Observations {
        observations,
        malformed_rows,
    })
}

/// One `data_gpbkv` row describes one virtual router: a `keys` subtree
/// carrying the YANG list keys and a `content` subtree carrying the
/// operational leaves.
fn extract_row(row: &TelemetryField) -> Result<VrrpObservation, String> {
    let keys = child(row, "keys").ok_or("missing keys subtree")?;
    let content = child(row, "content").ok_or("missing content subtree")?;

    let interface = child(keys, INTERFACE_FIELD)
        .and_then(string_value)
        .ok_or_else(|| format!("missing keys/{INTERFACE_FIELD}"))?;
    let vrid_raw = child(keys, VRID_FIELD)
        .and_then(uint_value)
        .ok_or_else(|| format!("missing keys/{VRID_FIELD}"))?;
    let vrid = u8::try_from(vrid_raw)
        .ok()
        .filter(|vrid| *vrid >= 1)
        .ok_or_else(|| format!("keys/{VRID_FIELD} out of range: {vrid_raw}"))?;
    let state = child(content, STATE_FIELD)
        .and_then(string_value)
        .ok_or_else(|| format!("missing content/{STATE_FIELD}"))?;

    Ok(VrrpObservation {
        key: GroupKey::new(interface, vrid),
        role: role_from_state(&state),
    })
}

fn child<'a>(field: &'a TelemetryField, name: &str) -> Option<&'a TelemetryField> {
    field.fields.iter().find(|child| child.name == name)
}

fn string_value(field: &TelemetryField) -> Option<String> {
    match &field.value_by_type {
        Some(ValueByType::StringValue(value)) => Some(value.clone()),
        _ => None,
    }
}

fn uint_value(field: &TelemetryField) -> Option<u64> {
    match field.value_by_type {
        Some(ValueByType::Uint32Value(value)) => Some(u64::from(value)),
        Some(ValueByType::Uint64Value(value)) => Some(value),
        _ => None,
    }
}

fn role_from_state(state: &str) -> Role {
    if state.to_ascii_lowercase().ends_with(MASTER_STATE_SUFFIX) {
        Role::Active
    } else {
        Role::Inactive
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use prost::Message;
    use protos::telemetry::telemetry_field::ValueByType;
    use protos::telemetry::{Telemetry, TelemetryField};

    use super::VRRP_ENCODING_PATH;

    pub fn string_field(name: &str, value: &str) -> TelemetryField {
        TelemetryField {
            name: name.to_owned(),
            value_by_type: Some(ValueByType::StringValue(value.to_owned())),
            ..TelemetryField::default()
        }
    }

    pub fn uint_field(name: &str, value: u32) -> TelemetryField {
        TelemetryField {
            name: name.to_owned(),
            value_by_type: Some(ValueByType::Uint32Value(value)),
            ..TelemetryField::default()
        }
    }

    pub fn subtree(name: &str, fields: Vec<TelemetryField>) -> TelemetryField {
        TelemetryField {
            name: name.to_owned(),
            fields,
            ..TelemetryField::default()
        }
    }

    pub fn vrrp_row(interface: &str, vrid: u32, state: &str) -> TelemetryField {
        subtree(
            "",
            vec![
                subtree(
                    "keys",
                    vec![
                        string_field("interface-name", interface),
                        uint_field("virtual-router-id", vrid),
                    ],
                ),
                subtree("content", vec![string_field("vrrp-state", state)]),
            ],
        )
    }

    pub fn envelope(path: &str, rows: Vec<TelemetryField>) -> Vec<u8> {
        let envelope = Telemetry {
            encoding_path: path.to_owned(),
            data_gpbkv: rows,
            ..Telemetry::default()
        };
        envelope.encode_to_vec()
    }

    pub fn vrrp_envelope(rows: Vec<TelemetryField>) -> Vec<u8> {
        envelope(VRRP_ENCODING_PATH, rows)
    }
}

#[cfg(test)]
mod tests {
    use engine::action::GroupKey;
    use engine::session::Role;
    use protos::telemetry::{Telemetry, TelemetryGpbTable};

    use super::testutil::{envelope, string_field, subtree, uint_field, vrrp_envelope, vrrp_row};
    use super::{decode_payload, MessageOutcome, VrrpObservation, VRRP_ENCODING_PATH};
    use prost::Message;

    fn observations(outcome: MessageOutcome) -> (Vec<VrrpObservation>, Vec<String>) {
        match outcome {
            MessageOutcome::Observations {
                observations,
                malformed_rows,
            } => (observations, malformed_rows),
            other => panic!("expected observations, got {other:?}"),
        }
    }

    #[test]
    fn master_state_maps_to_active_in_wire_order() {
        let payload = vrrp_envelope(vec![
            vrrp_row("HundredGigE0/0/0/1", 1, "state-master"),
            vrrp_row("HundredGigE0/0/0/2", 2, "state-backup"),
        ]);

        let (observations, malformed) = observations(decode_payload(&payload).unwrap());
        assert!(malformed.is_empty());
        assert_eq!(
            observations,
            vec![
                VrrpObservation {
                    key: GroupKey::new("HundredGigE0/0/0/1", 1),
                    role: Role::Active,
                },
                VrrpObservation {
                    key: GroupKey::new("HundredGigE0/0/0/2", 2),
                    role: Role::Inactive,
                },
            ]
        );
    }

    #[test]
    fn master_literal_matches_case_insensitively_as_suffix() {
        let payload = vrrp_envelope(vec![
            vrrp_row("HundredGigE0/0/0/1", 1, "STATE-MASTER"),
            vrrp_row("HundredGigE0/0/0/2", 2, "vrrp-state-master"),
            vrrp_row("HundredGigE0/0/0/3", 3, "state-initial"),
        ]);

        let (observations, _) = observations(decode_payload(&payload).unwrap());
        let roles: Vec<Role> = observations.iter().map(|o| o.role).collect();
        assert_eq!(roles, vec![Role::Active, Role::Active, Role::Inactive]);
    }

    #[test]
    fn compact_gpb_payload_is_reported_not_key_value() {
        let payload = Telemetry {
            encoding_path: VRRP_ENCODING_PATH.to_owned(),
            data_gpb: Some(TelemetryGpbTable::default()),
            ..Telemetry::default()
        }
        .encode_to_vec();

        assert_eq!(
            decode_payload(&payload).unwrap(),
            MessageOutcome::NotKeyValue {
                path: VRRP_ENCODING_PATH.to_owned(),
            }
        );
    }

    #[test]
    fn unexpected_path_is_dropped() {
        let payload = envelope(
            "Cisco-IOS-XR-infra-statsd-oper:infra-statistics",
            vec![vrrp_row("HundredGigE0/0/0/1", 1, "state-master")],
        );

        assert_eq!(
            decode_payload(&payload).unwrap(),
            MessageOutcome::UnexpectedPath {
                path: "Cisco-IOS-XR-infra-statsd-oper:infra-statistics".to_owned(),
            }
        );
    }

    #[test]
    fn rows_missing_subfields_are_reported_without_dropping_the_rest() {
        let broken = subtree(
            "",
            vec![subtree(
                "keys",
                vec![
                    string_field("interface-name", "HundredGigE0/0/0/9"),
                    uint_field("virtual-router-id", 9),
                ],
            )],
        );
        let payload = vrrp_envelope(vec![
            broken,
            vrrp_row("HundredGigE0/0/0/1", 1, "state-master"),
        ]);

        let (observations, malformed) = observations(decode_payload(&payload).unwrap());
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].key, GroupKey::new("HundredGigE0/0/0/1", 1));
        assert_eq!(malformed.len(), 1);
        assert!(malformed[0].contains("row 0"), "{}", malformed[0]);
        assert!(malformed[0].contains("content"), "{}", malformed[0]);
    }

    #[test]
    fn out_of_range_vrid_is_malformed() {
        let payload = vrrp_envelope(vec![vrrp_row("HundredGigE0/0/0/1", 300, "state-master")]);

        let (observations, malformed) = observations(decode_payload(&payload).unwrap());
        assert!(observations.is_empty());
        assert_eq!(malformed.len(), 1);
        assert!(malformed[0].contains("out of range"), "{}", malformed[0]);
    }

    #[test]
    fn garbage_bytes_fail_decode() {
        let err = decode_payload(&[0xff, 0xff, 0xff, 0x01]).unwrap_err();
        assert!(err.to_string().contains("envelope"), "{err}");
    }
}
