//! What a flow entry does on match.
//!
//! `PiTableAction` is a closed set. Adding a variant is a breaking change and
//! every consumer matches on it exhaustively.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of an action group on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionGroupId(pub u32);

/// Identifier of a single member of an action group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupMemberId(pub u32);

/// A runtime parameter supplied by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionParam {
    pub name: String,
    /// Big-endian parameter bytes.
    pub value: Vec<u8>,
}

/// An action invocation with its runtime parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PiAction {
    pub action_id: String,
    #[serde(default)]
    pub params: Vec<ActionParam>,
}

/// The action executed when an entry matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PiTableAction {
    /// Action executed with control-plane supplied parameters.
    DirectAction(PiAction),
    /// Execute the action group with this id.
    ActionGroupRef { group_id: ActionGroupId },
    /// Execute a single member of a group.
    GroupMemberRef { member_id: GroupMemberId },
}

/// Discriminant of [`PiTableAction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PiTableActionType {
    DirectAction,
    ActionGroupRef,
    GroupMemberRef,
}

impl PiTableAction {
    pub fn direct(action_id: &str, params: Vec<ActionParam>) -> Self {
        PiTableAction::DirectAction(PiAction {
            action_id: action_id.to_string(),
            params,
        })
    }

    pub fn group(group_id: u32) -> Self {
        PiTableAction::ActionGroupRef {
            group_id: ActionGroupId(group_id),
        }
    }

    pub fn member(member_id: u32) -> Self {
        PiTableAction::GroupMemberRef {
            member_id: GroupMemberId(member_id),
        }
    }

    pub fn action_type(&self) -> PiTableActionType {
        match self {
            PiTableAction::DirectAction(_) => PiTableActionType::DirectAction,
            PiTableAction::ActionGroupRef { .. } => PiTableActionType::ActionGroupRef,
            PiTableAction::GroupMemberRef { .. } => PiTableActionType::GroupMemberRef,
        }
    }

    /// Group ids this action depends on, if any.
    pub fn referenced_group(&self) -> Option<ActionGroupId> {
        match self {
            PiTableAction::DirectAction(_) => None,
            PiTableAction::ActionGroupRef { group_id } => Some(*group_id),
            PiTableAction::GroupMemberRef { .. } => None,
        }
    }
}

impl fmt::Display for PiTableAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PiTableAction::DirectAction(action) => {
                write!(f, "{}(", action.action_id)?;
                for (i, param) in action.params.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}=0x", param.name)?;
                    for byte in &param.value {
                        write!(f, "{byte:02x}")?;
                    }
                }
                f.write_str(")")
            }
            PiTableAction::ActionGroupRef { group_id } => write!(f, "group:{}", group_id.0),
            PiTableAction::GroupMemberRef { member_id } => write!(f, "member:{}", member_id.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_matches_variant() {
        assert_eq!(
            PiTableAction::direct("drop", vec![]).action_type(),
            PiTableActionType::DirectAction
        );
        assert_eq!(PiTableAction::group(7).action_type(), PiTableActionType::ActionGroupRef);
        assert_eq!(PiTableAction::member(3).action_type(), PiTableActionType::GroupMemberRef);
    }

    #[test]
    fn json_shape_is_tagged() {
        let json = serde_json::to_value(PiTableAction::group(7)).unwrap();
        assert_eq!(json["type"], "action_group_ref");
        assert_eq!(json["group_id"], 7);

        let json = serde_json::to_value(PiTableAction::direct("fwd", vec![])).unwrap();
        assert_eq!(json["type"], "direct_action");
        assert_eq!(json["action_id"], "fwd");
    }

    #[test]
    fn display_renders_params_as_hex() {
        let action = PiTableAction::direct(
            "set_port",
            vec![ActionParam {
                name: "port".to_string(),
                value: vec![0x00, 0x02],
            }],
        );
        assert_eq!(action.to_string(), "set_port(port=0x0002)");
        assert_eq!(PiTableAction::member(4).to_string(), "member:4");
    }

    #[test]
    fn only_group_ref_references_a_group() {
        assert_eq!(PiTableAction::group(9).referenced_group(), Some(ActionGroupId(9)));
        assert_eq!(PiTableAction::member(9).referenced_group(), None);
    }
}
