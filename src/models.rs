//! The data model: wire-level input types, validated internal types, and
//! the stored result type.
//!
//! Validation and normalization (protocol uppercasing, IP parsing, id
//! pattern checks) happen only here, at the boundary between untrusted
//! input and the core components — the core components never see an
//! un-validated value.

use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FirewallError;

/// The four connection attributes a [`PolicyCondition`] may match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionField {
    SourceIp,
    DestinationIp,
    DestinationPort,
    Protocol,
}

/// The only supported condition operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "==")]
    Eq,
}

/// A condition value: a port is compared as an integer, every other field
/// as a canonicalized string. Untagged so the wire form is a bare JSON
/// string or number rather than a nested object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    Port(u16),
    Str(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyCondition {
    pub field: ConnectionField,
    pub operator: Operator,
    pub value: ConditionValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    Allow,
    Block,
    Alert,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub policy_id: String,
    #[serde(default)]
    pub conditions: Vec<PolicyCondition>,
    pub action: PolicyAction,
    /// Assigned by `PolicyManager::add_policy`; ignored on input.
    #[serde(skip_deserializing, default)]
    pub insertion_order: u64,
}

impl Policy {
    /// Checks the `policy_id` against `^[A-Za-z0-9_-]{1,64}$` without pulling
    /// in a regex engine for a single fixed pattern.
    pub fn validate(&self) -> Result<(), FirewallError> {
        let id = &self.policy_id;
        let valid_chars = !id.is_empty()
            && id.len() <= 64
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid_chars {
            return Err(FirewallError::Validation(format!(
                "policy_id '{id}' must match ^[A-Za-z0-9_-]{{1,64}}$"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Block,
    Alert,
    Drop,
}

/// Wire-level request body for `POST /connections`, pre-validation.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionInput {
    pub source_ip: String,
    pub destination_ip: String,
    pub destination_port: i64,
    pub protocol: String,
    pub timestamp: DateTime<Utc>,
}

/// A validated, immutable, server-timestamped connection record.
#[derive(Debug, Clone, Serialize)]
pub struct Connection {
    pub connection_id: String,
    pub source_ip: String,
    pub destination_ip: String,
    pub destination_port: u16,
    pub protocol: String,
    pub timestamp: DateTime<Utc>,
}

impl Connection {
    /// Validates and normalizes a [`ConnectionInput`], assigning a fresh
    /// `connection_id`.
    pub fn from_input(input: ConnectionInput) -> Result<Self, FirewallError> {
        let source_ip = parse_ip(&input.source_ip)?;
        let destination_ip = parse_ip(&input.destination_ip)?;
        let destination_port = parse_port(input.destination_port)?;
        let protocol = parse_protocol(&input.protocol)?;

        Ok(Self {
            connection_id: Uuid::new_v4().to_string(),
            source_ip,
            destination_ip,
            destination_port,
            protocol,
            timestamp: input.timestamp,
        })
    }

    /// The canonical value of `field` on this connection, used by both the
    /// policy index and per-condition verification.
    pub fn field_value(&self, field: ConnectionField) -> ConditionValue {
        match field {
            ConnectionField::SourceIp => ConditionValue::Str(self.source_ip.clone()),
            ConnectionField::DestinationIp => ConditionValue::Str(self.destination_ip.clone()),
            ConnectionField::DestinationPort => ConditionValue::Port(self.destination_port),
            ConnectionField::Protocol => ConditionValue::Str(self.protocol.clone()),
        }
    }

    /// The `source_ip-destination_ip-destination_port-protocol` string the
    /// anomaly-score fingerprint is hashed from.
    pub fn fingerprint_input(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.source_ip, self.destination_ip, self.destination_port, self.protocol
        )
    }
}

/// The stored, returned result of evaluating a [`Connection`].
#[derive(Debug, Clone, Serialize)]
pub struct AnalyzedConnection {
    pub connection_id: String,
    pub source_ip: String,
    pub destination_ip: String,
    pub destination_port: u16,
    pub protocol: String,
    pub timestamp: DateTime<Utc>,
    pub anomaly_score: f64,
    pub decision: Decision,
    pub policy_id: Option<String>,
}

fn parse_ip(raw: &str) -> Result<String, FirewallError> {
    IpAddr::from_str(raw)
        .map(|ip| ip.to_string())
        .map_err(|_| FirewallError::Validation(format!("invalid IP address literal: '{raw}'")))
}

fn parse_port(raw: i64) -> Result<u16, FirewallError> {
    u16::try_from(raw)
        .map_err(|_| FirewallError::Validation(format!("destination_port {raw} out of range 0..65535")))
}

fn parse_protocol(raw: &str) -> Result<String, FirewallError> {
    match raw.to_ascii_uppercase().as_str() {
        "TCP" => Ok("TCP".to_string()),
        "UDP" => Ok("UDP".to_string()),
        other => Err(FirewallError::Validation(format!(
            "unsupported protocol '{other}', expected TCP or UDP"
        ))),
    }
}
