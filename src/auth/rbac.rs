//! Role-based access control: permission table lookup and group→role mapping.

use crate::dispatcher::context::Role;
use crate::error::TypedError;
use std::collections::HashMap;

/// `role_hierarchy` ordered low to high, used when folding multiple claim
/// groups down to a single highest-privilege role.
const ROLE_HIERARCHY: [Role; 3] = [Role::Viewer, Role::Operator, Role::Admin];

fn hierarchy_index(role: Role) -> usize {
    ROLE_HIERARCHY.iter().position(|r| *r == role).unwrap_or(0)
}

/// Maps claim group names (from `groups`/`roles`/`cf_groups`/`custom:groups`)
/// to a single resolved role: the highest-privilege role reached by any
/// mapped group wins. An unmapped/unknown group name is simply skipped; an
/// unrecognized *mapped* role name is only adopted if nothing better has
/// been found yet (mirrors the "still at default" guard in the source).
pub fn map_groups_to_role(
    groups: &[String],
    role_mappings: &HashMap<String, String>,
    default_role: Role,
) -> Role {
    let mut highest = default_role;
    let mut highest_index = hierarchy_index(default_role);
    for group in groups {
        let Some(mapped_name) = role_mappings.get(group) else {
            continue;
        };
        match Role::parse(mapped_name) {
            Some(mapped_role) => {
                let idx = hierarchy_index(mapped_role);
                if idx > highest_index {
                    highest = mapped_role;
                    highest_index = idx;
                }
            }
            None if highest == default_role => {
                // Unknown role name mapped by config; only adopt it as a
                // last resort, and only if we're still sitting at default.
                continue;
            }
            None => continue,
        }
    }
    highest
}

/// Static + namespace-wildcard permission table: `"gpio.read" -> Operator`,
/// `"gpio.*" -> Operator`. Lookup order is exact match, then namespace
/// wildcard, then secure-default-deny (`default_role`, normally the highest
/// defined role) for any tool the table doesn't mention.
pub struct PermissionTable {
    exact: HashMap<String, Role>,
    wildcard: HashMap<String, Role>,
    default_role: Role,
}

impl PermissionTable {
    pub fn new(default_role: Role) -> Self {
        Self {
            exact: HashMap::new(),
            wildcard: HashMap::new(),
            default_role,
        }
    }

    /// `pattern` is either an exact tool name (`"gpio.read"`) or a
    /// namespace wildcard (`"gpio.*"`).
    pub fn insert(&mut self, pattern: impl Into<String>, role: Role) {
        let pattern = pattern.into();
        if let Some(namespace) = pattern.strip_suffix(".*") {
            self.wildcard.insert(namespace.to_string(), role);
        } else {
            self.exact.insert(pattern, role);
        }
    }

    /// The role required to call `tool_name`. Falls back to the configured
    /// default (secure-default-deny) when nothing in the table matches.
    pub fn required_role(&self, tool_name: &str) -> Role {
        if let Some(role) = self.exact.get(tool_name) {
            return *role;
        }
        if let Some((namespace, _)) = tool_name.split_once('.') {
            if let Some(role) = self.wildcard.get(namespace) {
                return *role;
            }
        }
        self.default_role
    }

    /// Returns `Ok(())` when `caller_role` satisfies the tool's requirement,
    /// else a populated `permission_denied` error.
    pub fn enforce(&self, tool_name: &str, caller_role: Role) -> Result<(), TypedError> {
        let required = self.required_role(tool_name);
        if caller_role.has_role(required) {
            Ok(())
        } else {
            Err(TypedError::permission_denied(format!(
                "role '{caller_role}' cannot call '{tool_name}' (requires '{required}')"
            ))
            .with_detail("tool", tool_name)
            .with_detail("required_role", required.as_str())
            .with_detail("user_role", caller_role.as_str()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_wins_over_wildcard() {
        let mut table = PermissionTable::new(Role::Admin);
        table.insert("gpio.*", Role::Operator);
        table.insert("gpio.reboot", Role::Admin);
        assert_eq!(table.required_role("gpio.reboot"), Role::Admin);
        assert_eq!(table.required_role("gpio.read"), Role::Operator);
    }

    #[test]
    fn unknown_tool_defaults_to_highest_role() {
        let table = PermissionTable::new(Role::Admin);
        assert_eq!(table.required_role("unknown.tool"), Role::Admin);
    }

    #[test]
    fn enforce_rejects_insufficient_role() {
        let mut table = PermissionTable::new(Role::Admin);
        table.insert("gpio.read", Role::Operator);
        let err = table.enforce("gpio.read", Role::Viewer).unwrap_err();
        assert_eq!(err.details["required_role"], "operator");
    }

    #[test]
    fn group_mapping_picks_highest_privilege() {
        let mut mappings = HashMap::new();
        mappings.insert("eng".to_string(), "operator".to_string());
        mappings.insert("sre".to_string(), "admin".to_string());
        let groups = vec!["eng".to_string(), "sre".to_string()];
        let role = map_groups_to_role(&groups, &mappings, Role::Viewer);
        assert_eq!(role, Role::Admin);
    }

    #[test]
    fn unmapped_groups_leave_default_role() {
        let mappings = HashMap::new();
        let groups = vec!["nobody-cares".to_string()];
        let role = map_groups_to_role(&groups, &mappings, Role::Viewer);
        assert_eq!(role, Role::Viewer);
    }
}
