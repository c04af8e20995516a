//! Access control primitives.
//!
//! Authentication itself is external; the identity provider hands the core an
//! authenticated [`UserRef`] and the core only evaluates predicates on it.

use serde::{Deserialize, Serialize};

/// Permission group assigned by the identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PermissionGroup {
    Applicant,
    Reader,
    Contributor,
    Editor,
    Commissioner,
}

impl PermissionGroup {
    /// Editors and commissioners govern curated tags and may act on
    /// ownerless resources.
    pub fn is_elevated(self) -> bool {
        matches!(self, Self::Editor | Self::Commissioner)
    }

    /// Contribution uploads require at least contributor rights.
    pub fn may_contribute(self) -> bool {
        self >= Self::Contributor
    }
}

/// An authenticated user as seen by the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub name: String,
    pub permission_group: PermissionGroup,
}

impl UserRef {
    pub fn new(name: impl Into<String>, permission_group: PermissionGroup) -> Self {
        Self {
            name: name.into(),
            permission_group,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elevated_groups() {
        assert!(PermissionGroup::Editor.is_elevated());
        assert!(PermissionGroup::Commissioner.is_elevated());
        assert!(!PermissionGroup::Contributor.is_elevated());
        assert!(!PermissionGroup::Reader.is_elevated());
        assert!(!PermissionGroup::Applicant.is_elevated());
    }

    #[test]
    fn test_contribution_rights_are_ordered() {
        assert!(PermissionGroup::Contributor.may_contribute());
        assert!(PermissionGroup::Commissioner.may_contribute());
        assert!(!PermissionGroup::Reader.may_contribute());
    }
}
