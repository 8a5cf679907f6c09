//! Identifiers shared across the cluster.
//!
//! Device ids carry a protocol-scheme prefix (`pof:0000000000000001`,
//! `of:00000000000000a1`, `netconf:10.0.0.1:830`). The scheme selects the
//! protocol adapter that talks to the device.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity of a controller replica in the cluster.
pub type ReplicaId = String;

/// Identity of the application that owns a table or rule.
pub type AppId = String;

/// Mastership term for a device. Strictly increases on every change of master.
pub type Epoch = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("device id is empty")]
    Empty,
    #[error("device id has no scheme prefix: {0}")]
    MissingScheme(String),
    #[error("invalid table id: {0}")]
    InvalidTableId(String),
}

/// Cluster-wide identity of a managed network element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

/// Protocol family named by a device id's scheme prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceScheme {
    /// Protocol-oblivious forwarding switch.
    Pof,
    OpenFlow,
    Netconf,
    Other(String),
}

impl DeviceId {
    /// Wrap a raw id without validation.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parse an id of the form `scheme:rest`.
    pub fn parse(id: &str) -> Result<Self, IdError> {
        if id.is_empty() {
            return Err(IdError::Empty);
        }
        match id.split_once(':') {
            Some((scheme, rest)) if !scheme.is_empty() && !rest.is_empty() => {
                Ok(Self(id.to_string()))
            }
            _ => Err(IdError::MissingScheme(id.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The raw scheme prefix, or `""` when the id has none.
    pub fn scheme(&self) -> &str {
        self.0.split_once(':').map(|(s, _)| s).unwrap_or("")
    }

    pub fn protocol(&self) -> DeviceScheme {
        DeviceScheme::from_prefix(self.scheme())
    }
}

impl DeviceScheme {
    pub fn from_prefix(prefix: &str) -> Self {
        match prefix {
            "pof" => DeviceScheme::Pof,
            "of" => DeviceScheme::OpenFlow,
            "netconf" => DeviceScheme::Netconf,
            other => DeviceScheme::Other(other.to_string()),
        }
    }

    pub fn prefix(&self) -> &str {
        match self {
            DeviceScheme::Pof => "pof",
            DeviceScheme::OpenFlow => "of",
            DeviceScheme::Netconf => "netconf",
            DeviceScheme::Other(p) => p,
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Cluster-stable identifier of a flow table bound to a device.
///
/// This is the only table id exposed to management clients and carried in
/// cluster messages.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LogicalTableId(pub u64);

/// Compact device-local table id, as addressed on the wire by the switch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LocalTableId(pub u8);

/// Identifier of a flow rule, unique within its device.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FlowEntryId(pub u64);

impl LogicalTableId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl FromStr for LogicalTableId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(LogicalTableId)
            .map_err(|_| IdError::InvalidTableId(s.to_string()))
    }
}

impl LocalTableId {
    pub fn value(&self) -> u8 {
        self.0
    }
}

impl FlowEntryId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogicalTableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LocalTableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FlowEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pof_device() {
        let id = DeviceId::parse("pof:0000000000000001").unwrap();
        assert_eq!(id.scheme(), "pof");
        assert_eq!(id.protocol(), DeviceScheme::Pof);
    }

    #[test]
    fn parse_netconf_keeps_port_in_id() {
        let id: DeviceId = "netconf:10.0.0.1:830".parse().unwrap();
        assert_eq!(id.scheme(), "netconf");
        assert_eq!(id.as_str(), "netconf:10.0.0.1:830");
    }

    #[test]
    fn unknown_scheme_is_other() {
        let id = DeviceId::parse("dev:1").unwrap();
        assert_eq!(id.protocol(), DeviceScheme::Other("dev".to_string()));
        assert_eq!(id.protocol().prefix(), "dev");
    }

    #[test]
    fn parse_rejects_missing_scheme() {
        assert_eq!(DeviceId::parse(""), Err(IdError::Empty));
        assert!(matches!(
            DeviceId::parse("0001"),
            Err(IdError::MissingScheme(_))
        ));
        assert!(matches!(
            DeviceId::parse("pof:"),
            Err(IdError::MissingScheme(_))
        ));
    }

    #[test]
    fn device_id_serializes_as_plain_string() {
        let id = DeviceId::new("of:1");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""of:1""#);
    }

    #[test]
    fn entry_id_displays_as_hex() {
        assert_eq!(FlowEntryId(255).to_string(), "0xff");
        assert_eq!("42".parse::<LogicalTableId>().unwrap(), LogicalTableId(42));
        assert!("x".parse::<LogicalTableId>().is_err());
    }
}
