use serde::{Deserialize, Serialize};

/// Well-known SID of the local Administrators group.
pub const BUILTIN_ADMINISTRATORS_SID: &str = "S-1-5-32-544";

pub mod group_attributes {
    pub const MANDATORY: u32 = 0x0000_0001;
    pub const ENABLED_BY_DEFAULT: u32 = 0x0000_0002;
    pub const ENABLED: u32 = 0x0000_0004;
    pub const OWNER: u32 = 0x0000_0008;
    pub const USE_FOR_DENY_ONLY: u32 = 0x0000_0010;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembership {
    pub sid: String,
    pub attributes: u32,
}

impl GroupMembership {
    pub fn new(sid: impl Into<String>, attributes: u32) -> Self {
        Self {
            sid: sid.into(),
            attributes,
        }
    }

    /// A deny-only group still proves membership: UAC filters the
    /// administrators group to deny-only in the unelevated token.
    fn counts(&self) -> bool {
        self.attributes & (group_attributes::ENABLED | group_attributes::USE_FOR_DENY_ONLY) != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountType {
    User,
    Service,
    System,
}

/// The principal logged on to an interactive session, as read from its
/// primary token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub username: String,
    pub account_type: AccountType,
    pub groups: Vec<GroupMembership>,
    /// Groups of the elevated token linked to a filtered one, if any.
    #[serde(default)]
    pub linked_groups: Option<Vec<GroupMembership>>,
}

impl UserIdentity {
    pub fn is_member_of_builtin_administrators(&self) -> bool {
        let is_admin = |groups: &[GroupMembership]| {
            groups
                .iter()
                .any(|g| g.sid == BUILTIN_ADMINISTRATORS_SID && g.counts())
        };
        is_admin(&self.groups) || self.linked_groups.as_deref().is_some_and(is_admin)
    }

    /// Only real administrator users get a UI process.
    pub fn may_run_ui(&self) -> bool {
        self.account_type == AccountType::User && self.is_member_of_builtin_administrators()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(groups: Vec<GroupMembership>) -> UserIdentity {
        UserIdentity {
            username: "alice".to_string(),
            account_type: AccountType::User,
            groups,
            linked_groups: None,
        }
    }

    #[test]
    fn test_enabled_admin_group() {
        let identity = user(vec![GroupMembership::new(
            BUILTIN_ADMINISTRATORS_SID,
            group_attributes::ENABLED | group_attributes::ENABLED_BY_DEFAULT,
        )]);
        assert!(identity.is_member_of_builtin_administrators());
        assert!(identity.may_run_ui());
    }

    #[test]
    fn test_deny_only_admin_group_counts() {
        let identity = user(vec![GroupMembership::new(
            BUILTIN_ADMINISTRATORS_SID,
            group_attributes::USE_FOR_DENY_ONLY,
        )]);
        assert!(identity.may_run_ui());
    }

    #[test]
    fn test_disabled_admin_group_does_not_count() {
        let identity = user(vec![GroupMembership::new(
            BUILTIN_ADMINISTRATORS_SID,
            group_attributes::MANDATORY,
        )]);
        assert!(!identity.is_member_of_builtin_administrators());
    }

    #[test]
    fn test_linked_token_is_consulted() {
        let mut identity = user(vec![GroupMembership::new("S-1-5-32-545", group_attributes::ENABLED)]);
        assert!(!identity.may_run_ui());
        identity.linked_groups = Some(vec![GroupMembership::new(
            BUILTIN_ADMINISTRATORS_SID,
            group_attributes::ENABLED,
        )]);
        assert!(identity.may_run_ui());
    }

    #[test]
    fn test_service_account_is_refused() {
        let mut identity = user(vec![GroupMembership::new(
            BUILTIN_ADMINISTRATORS_SID,
            group_attributes::ENABLED,
        )]);
        identity.account_type = AccountType::Service;
        assert!(!identity.may_run_ui());
    }
}
