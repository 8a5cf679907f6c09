//! Flow tables and their match-field schema.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ids::{AppId, DeviceId, LocalTableId, LogicalTableId};

/// Lookup discipline of a flow table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TableType {
    MaskedMatch,
    LongestPrefixMatch,
    ExactMatch,
    Linear,
}

impl TableType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableType::MaskedMatch => "masked-match",
            TableType::LongestPrefixMatch => "longest-prefix-match",
            TableType::ExactMatch => "exact-match",
            TableType::Linear => "linear",
        }
    }

    /// Linear tables are indexed by position and carry no match key.
    pub fn requires_match_fields(&self) -> bool {
        !matches!(self, TableType::Linear)
    }
}

impl fmt::Display for TableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TableType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "masked-match" | "mm" => Ok(TableType::MaskedMatch),
            "longest-prefix-match" | "lpm" => Ok(TableType::LongestPrefixMatch),
            "exact-match" | "em" => Ok(TableType::ExactMatch),
            "linear" => Ok(TableType::Linear),
            other => Err(format!("unknown table type: {other}")),
        }
    }
}

/// One field of a table's match key, addressed by bit offset into the packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchField {
    pub field_id: u16,
    pub name: String,
    /// Offset in bits from the start of the packet.
    pub offset: u16,
    /// Length in bits.
    pub length: u16,
}

/// Client request to create a table. The logical id is assigned on install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub device_id: DeviceId,
    pub name: String,
    pub table_type: TableType,
    /// Maximum number of entries.
    pub size: u32,
    #[serde(default)]
    pub match_fields: Vec<MatchField>,
    pub app_id: AppId,
}

/// A table of match-action entries installed on one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowTable {
    pub id: LogicalTableId,
    pub device_id: DeviceId,
    pub name: String,
    pub table_type: TableType,
    pub size: u32,
    pub match_fields: Vec<MatchField>,
    pub app_id: AppId,
}

/// A table together with the device-local id it is addressed by.
///
/// Only handed to protocol adapters; never exposed to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundTable {
    pub local_id: LocalTableId,
    pub table: FlowTable,
}

impl TableSpec {
    /// Check the table can be installed. Returns a human-readable reason otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.size == 0 {
            return Err(format!("table {} declares size 0", self.name));
        }
        if self.table_type.requires_match_fields() && self.match_fields.is_empty() {
            return Err(format!(
                "{} table {} has no match fields",
                self.table_type, self.name
            ));
        }
        Ok(())
    }

    pub fn into_table(self, id: LogicalTableId) -> FlowTable {
        FlowTable {
            id,
            device_id: self.device_id,
            name: self.name,
            table_type: self.table_type,
            size: self.size,
            match_fields: self.match_fields,
            app_id: self.app_id,
        }
    }
}

impl FlowTable {
    /// Total width of the match key in bits.
    pub fn key_width(&self) -> u32 {
        self.match_fields.iter().map(|f| u32::from(f.length)).sum()
    }
}
