//! Flow rules and the per-entry lifecycle.
//!
//! ```text
//! PendingAdd ──confirm──▶ Added ──remove──▶ PendingRemove ──confirm──▶ Removed
//!     │                                          ▲
//!     ├──reject──▶ Failed                        │
//!     └──remove (install never confirmed) ───────┘
//!
//! any state ──device disconnect──▶ Removed
//! ```
//!
//! Transitions only move forward. `Failed` and `Removed` are terminal.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::action::PiTableAction;
use crate::error::{FlowError, FlowResult};
use crate::ids::{AppId, DeviceId, FlowEntryId, LogicalTableId};

/// One match criterion: a field of the table's match key and the value to match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criterion {
    pub field_id: u16,
    /// Hex-encoded value.
    pub value: String,
    /// Hex-encoded mask; `None` means exact.
    #[serde(default)]
    pub mask: Option<String>,
}

/// A match + action rule as requested by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRule {
    pub id: FlowEntryId,
    pub device_id: DeviceId,
    pub table_id: LogicalTableId,
    pub priority: u16,
    pub app_id: AppId,
    #[serde(default)]
    pub criteria: Vec<Criterion>,
    pub actions: Vec<PiTableAction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowEntryState {
    PendingAdd,
    Added,
    Failed,
    PendingRemove,
    Removed,
}

impl FlowEntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowEntryState::PendingAdd => "PENDING_ADD",
            FlowEntryState::Added => "ADDED",
            FlowEntryState::Failed => "FAILED",
            FlowEntryState::PendingRemove => "PENDING_REMOVE",
            FlowEntryState::Removed => "REMOVED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowEntryState::Failed | FlowEntryState::Removed)
    }

    /// Whether a confirmation or removal request may move `self` to `to`.
    ///
    /// Forced removal on disconnect bypasses this check.
    pub fn can_transition_to(&self, to: FlowEntryState) -> bool {
        use FlowEntryState::*;
        matches!(
            (self, to),
            (PendingAdd, Added)
                | (PendingAdd, Failed)
                | (PendingAdd, PendingRemove)
                | (Added, PendingRemove)
                | (PendingRemove, Removed)
        )
    }
}

impl fmt::Display for FlowEntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Packet/byte counters reported by the adapter for one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStats {
    pub entry_id: FlowEntryId,
    pub packets: u64,
    pub bytes: u64,
    /// Adapter sample time, milliseconds since the unix epoch.
    pub sampled_at: u64,
}

/// A flow rule plus its runtime state on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEntry {
    pub rule: FlowRule,
    pub state: FlowEntryState,
    pub packets: u64,
    pub bytes: u64,
    /// Sample time of the last accepted statistics, 0 if none yet.
    pub stats_sampled_at: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl FlowEntry {
    /// A freshly submitted entry awaiting device confirmation.
    pub fn pending(rule: FlowRule, now: u64) -> Self {
        Self {
            rule,
            state: FlowEntryState::PendingAdd,
            packets: 0,
            bytes: 0,
            stats_sampled_at: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> FlowEntryId {
        self.rule.id
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.rule.device_id
    }

    pub fn table_id(&self) -> LogicalTableId {
        self.rule.table_id
    }

    /// Move to `to` if the lifecycle allows it.
    pub fn transition(&mut self, to: FlowEntryState, now: u64) -> FlowResult<()> {
        if !self.state.can_transition_to(to) {
            return Err(FlowError::InvalidState {
                device_id: self.rule.device_id.clone(),
                entry_id: self.rule.id,
                state: self.state,
            });
        }
        self.state = to;
        self.updated_at = now;
        Ok(())
    }

    /// Unconditionally mark the entry removed. Returns the state it was in.
    pub fn force_removed(&mut self, now: u64) -> FlowEntryState {
        let previous = self.state;
        self.state = FlowEntryState::Removed;
        self.updated_at = now;
        previous
    }

    /// Replace the rule of an installed entry after the device confirmed it.
    pub fn modify(&mut self, rule: FlowRule, now: u64) -> FlowResult<()> {
        if self.state != FlowEntryState::Added {
            return Err(FlowError::InvalidState {
                device_id: self.rule.device_id.clone(),
                entry_id: self.rule.id,
                state: self.state,
            });
        }
        self.rule = rule;
        self.updated_at = now;
        Ok(())
    }

    /// Fold in adapter statistics.
    ///
    /// Returns `false` (and changes nothing) when the entry is not `Added` or
    /// the sample is not newer than the last accepted one.
    pub fn apply_stats(&mut self, stats: &FlowStats) -> bool {
        if self.state != FlowEntryState::Added || stats.sampled_at <= self.stats_sampled_at {
            return false;
        }
        self.packets = stats.packets;
        self.bytes = stats.bytes;
        self.stats_sampled_at = stats.sampled_at;
        true
    }
}

/// Wall-clock milliseconds since the Unix epoch. Every timestamp the store
/// records (entry lifetimes, snapshots, mastership records) uses this clock.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: u64) -> FlowRule {
        FlowRule {
            id: FlowEntryId(id),
            device_id: DeviceId::new("pof:1"),
            table_id: LogicalTableId(1),
            priority: 100,
            app_id: "org.example.fwd".to_string(),
            criteria: vec![Criterion {
                field_id: 1,
                value: "0a0000000001".to_string(),
                mask: None,
            }],
            actions: vec![PiTableAction::group(1)],
        }
    }

    fn stats(sampled_at: u64, packets: u64) -> FlowStats {
        FlowStats {
            entry_id: FlowEntryId(1),
            packets,
            bytes: packets * 64,
            sampled_at,
        }
    }

    #[test]
    fn install_then_remove_lifecycle() {
        let mut entry = FlowEntry::pending(rule(1), 10);
        entry.transition(FlowEntryState::Added, 11).unwrap();
        entry.transition(FlowEntryState::PendingRemove, 12).unwrap();
        entry.transition(FlowEntryState::Removed, 13).unwrap();
        assert_eq!(entry.state, FlowEntryState::Removed);
        assert_eq!(entry.updated_at, 13);
    }

    #[test]
    fn failed_is_terminal() {
        let mut entry = FlowEntry::pending(rule(1), 0);
        entry.transition(FlowEntryState::Failed, 1).unwrap();
        assert!(entry.state.is_terminal());
        let err = entry.transition(FlowEntryState::Added, 2).unwrap_err();
        assert!(matches!(
            err,
            FlowError::InvalidState {
                state: FlowEntryState::Failed,
                ..
            }
        ));
    }

    #[test]
    fn transitions_never_move_backwards() {
        let mut entry = FlowEntry::pending(rule(1), 0);
        entry.transition(FlowEntryState::Added, 1).unwrap();
        assert!(entry.transition(FlowEntryState::PendingAdd, 2).is_err());
        assert!(entry.transition(FlowEntryState::Removed, 2).is_err());
    }

    #[test]
    fn forced_removal_from_any_state() {
        for state in [
            FlowEntryState::PendingAdd,
            FlowEntryState::Added,
            FlowEntryState::PendingRemove,
        ] {
            let mut entry = FlowEntry::pending(rule(1), 0);
            entry.state = state;
            assert_eq!(entry.force_removed(5), state);
            assert_eq!(entry.state, FlowEntryState::Removed);
        }
    }

    #[test]
    fn stats_only_counted_while_added() {
        let mut entry = FlowEntry::pending(rule(1), 0);
        assert!(!entry.apply_stats(&stats(100, 5)));

        entry.transition(FlowEntryState::Added, 1).unwrap();
        assert!(entry.apply_stats(&stats(100, 5)));
        assert_eq!(entry.packets, 5);

        entry.transition(FlowEntryState::PendingRemove, 2).unwrap();
        assert!(!entry.apply_stats(&stats(200, 9)));
        assert_eq!(entry.packets, 5);
    }

    #[test]
    fn out_of_order_stats_discarded() {
        let mut entry = FlowEntry::pending(rule(1), 0);
        entry.transition(FlowEntryState::Added, 1).unwrap();
        assert!(entry.apply_stats(&stats(200, 20)));
        assert!(!entry.apply_stats(&stats(150, 15)));
        assert!(!entry.apply_stats(&stats(200, 21)));
        assert_eq!(entry.packets, 20);
        assert_eq!(entry.bytes, 20 * 64);
    }

    #[test]
    fn modify_requires_added() {
        let mut entry = FlowEntry::pending(rule(1), 0);
        let mut updated = rule(1);
        updated.priority = 200;
        assert!(entry.modify(updated.clone(), 1).is_err());

        entry.transition(FlowEntryState::Added, 1).unwrap();
        entry.modify(updated, 2).unwrap();
        assert_eq!(entry.rule.priority, 200);
        assert_eq!(entry.state, FlowEntryState::Added);
    }

    #[test]
    fn clock_is_wall_time() {
        let before = epoch_millis();
        let after = epoch_millis();
        // 2020-01-01T00:00:00Z
        assert!(before > 1_577_836_800_000);
        assert!(after >= before);
    }
}
