//! Role-based permission table.
//!
//! Every mutating endpoint asks [`permission`] for the caller's scope before
//! touching data. A `None` answer means the role may not perform the action
//! at all; `Own` restricts it to records the caller owns.
//!
//! | Action              | super_admin | admin | manager | staff | sales_rep |
//! |---------------------|-------------|-------|---------|-------|-----------|
//! | leads (view/create/update) | Org  | Org   | Org     | Org   | Own       |
//! | record review outcome | Org       | Org   | Org     | Org   | -         |
//! | delete lead         | Org         | Org   | -       | -     | -         |
//! | manage categories   | Org         | Org   | -       | -     | -         |
//! | view users          | Org         | Org   | Org     | -     | -         |
//! | manage users / org  | Org         | Org   | -       | -     | -         |
//! | create organization | Global      | -     | -       | -     | -         |
//! | view incentives     | Org         | Org   | Org     | -     | Own       |
//! | calculate / approve / pay | Org   | Org   | Org     | -     | -         |
//! | dashboard           | Org         | Org   | Org     | Org   | Own       |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SuperAdmin,
    Admin,
    Manager,
    Staff,
    SalesRep,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Self::SuperAdmin,
        Self::Admin,
        Self::Manager,
        Self::Staff,
        Self::SalesRep,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SuperAdmin => "super_admin",
            Self::Admin => "admin",
            Self::Manager => "manager",
            Self::Staff => "staff",
            Self::SalesRep => "sales_rep",
        }
    }

    /// Whether a user with this role may assign `target` to someone.
    pub fn can_grant(&self, target: Role) -> bool {
        match self {
            Self::SuperAdmin => true,
            Self::Admin => target != Self::SuperAdmin,
            _ => false,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "super_admin" => Ok(Self::SuperAdmin),
            "admin" => Ok(Self::Admin),
            "manager" => Ok(Self::Manager),
            "staff" => Ok(Self::Staff),
            "sales_rep" => Ok(Self::SalesRep),
            _ => Err(CoreError::InvalidRole(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    ViewLeads,
    CreateLead,
    UpdateLead,
    RecordReview,
    DeleteLead,
    ViewCategories,
    ManageCategories,
    ViewUsers,
    ManageUsers,
    ViewOrganization,
    ManageOrganization,
    CreateOrganization,
    ViewIncentives,
    CalculateIncentives,
    ApproveIncentives,
    MarkIncentivePaid,
    ViewDashboard,
}

impl Action {
    pub const ALL: [Action; 17] = [
        Self::ViewLeads,
        Self::CreateLead,
        Self::UpdateLead,
        Self::RecordReview,
        Self::DeleteLead,
        Self::ViewCategories,
        Self::ManageCategories,
        Self::ViewUsers,
        Self::ManageUsers,
        Self::ViewOrganization,
        Self::ManageOrganization,
        Self::CreateOrganization,
        Self::ViewIncentives,
        Self::CalculateIncentives,
        Self::ApproveIncentives,
        Self::MarkIncentivePaid,
        Self::ViewDashboard,
    ];
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ViewLeads => "view_leads",
            Self::CreateLead => "create_lead",
            Self::UpdateLead => "update_lead",
            Self::RecordReview => "record_review",
            Self::DeleteLead => "delete_lead",
            Self::ViewCategories => "view_categories",
            Self::ManageCategories => "manage_categories",
            Self::ViewUsers => "view_users",
            Self::ManageUsers => "manage_users",
            Self::ViewOrganization => "view_organization",
            Self::ManageOrganization => "manage_organization",
            Self::CreateOrganization => "create_organization",
            Self::ViewIncentives => "view_incentives",
            Self::CalculateIncentives => "calculate_incentives",
            Self::ApproveIncentives => "approve_incentives",
            Self::MarkIncentivePaid => "mark_incentive_paid",
            Self::ViewDashboard => "view_dashboard",
        };
        f.write_str(name)
    }
}

/// How far a granted permission reaches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Only records owned by the caller.
    Own,
    /// Every record in the caller's organization.
    Org,
    /// Across organizations.
    Global,
}

/// Look up the scope `role` holds for `action`.
pub fn permission(role: Role, action: Action) -> Option<Scope> {
    use Action::*;
    use Role::*;
    use Scope::*;

    match (role, action) {
        (SuperAdmin, CreateOrganization) => Some(Global),
        (_, CreateOrganization) => None,
        (SuperAdmin | Admin, _) => Some(Org),

        (Manager, ViewLeads | CreateLead | UpdateLead | RecordReview) => Some(Org),
        (Manager, ViewCategories | ViewUsers | ViewOrganization) => Some(Org),
        (Manager, ViewIncentives | CalculateIncentives | ApproveIncentives) => Some(Org),
        (Manager, MarkIncentivePaid | ViewDashboard) => Some(Org),
        (Manager, _) => None,

        (Staff, ViewLeads | CreateLead | UpdateLead | RecordReview) => Some(Org),
        (Staff, ViewCategories | ViewOrganization | ViewDashboard) => Some(Org),
        (Staff, _) => None,

        (SalesRep, ViewLeads | CreateLead | UpdateLead) => Some(Own),
        (SalesRep, ViewIncentives | ViewDashboard) => Some(Own),
        (SalesRep, ViewCategories | ViewOrganization) => Some(Org),
        (SalesRep, _) => None,
    }
}

/// Every action the role may perform, with its scope.
pub fn permissions_for(role: Role) -> Vec<(Action, Scope)> {
    Action::ALL
        .iter()
        .filter_map(|action| permission(role, *action).map(|scope| (*action, scope)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_str() {
        for role in Role::ALL {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!(matches!(
            "owner".parse::<Role>(),
            Err(CoreError::InvalidRole(r)) if r == "owner"
        ));
    }

    #[test]
    fn only_super_admin_creates_organizations() {
        assert_eq!(
            permission(Role::SuperAdmin, Action::CreateOrganization),
            Some(Scope::Global)
        );
        for role in [Role::Admin, Role::Manager, Role::Staff, Role::SalesRep] {
            assert_eq!(permission(role, Action::CreateOrganization), None);
        }
    }

    #[test]
    fn sales_reps_are_limited_to_their_own_records() {
        assert_eq!(permission(Role::SalesRep, Action::ViewLeads), Some(Scope::Own));
        assert_eq!(
            permission(Role::SalesRep, Action::ViewIncentives),
            Some(Scope::Own)
        );
        assert_eq!(permission(Role::SalesRep, Action::ApproveIncentives), None);
        assert_eq!(permission(Role::SalesRep, Action::DeleteLead), None);
    }

    #[test]
    fn sales_reps_cannot_record_review_outcomes() {
        assert_eq!(permission(Role::SalesRep, Action::UpdateLead), Some(Scope::Own));
        assert_eq!(permission(Role::SalesRep, Action::RecordReview), None);
        for role in [Role::SuperAdmin, Role::Admin, Role::Manager, Role::Staff] {
            assert_eq!(permission(role, Action::RecordReview), Some(Scope::Org));
        }
    }

    #[test]
    fn managers_run_the_incentive_workflow_but_not_admin_tasks() {
        for action in [
            Action::CalculateIncentives,
            Action::ApproveIncentives,
            Action::MarkIncentivePaid,
        ] {
            assert_eq!(permission(Role::Manager, action), Some(Scope::Org));
        }
        assert_eq!(permission(Role::Manager, Action::ManageUsers), None);
        assert_eq!(permission(Role::Manager, Action::DeleteLead), None);
    }

    #[test]
    fn staff_cannot_see_incentives() {
        assert_eq!(permission(Role::Staff, Action::ViewIncentives), None);
        assert_eq!(permission(Role::Staff, Action::CreateLead), Some(Scope::Org));
    }

    #[test]
    fn admins_grant_everything_but_super_admin() {
        assert!(Role::Admin.can_grant(Role::Manager));
        assert!(!Role::Admin.can_grant(Role::SuperAdmin));
        assert!(Role::SuperAdmin.can_grant(Role::SuperAdmin));
        assert!(!Role::Manager.can_grant(Role::SalesRep));
    }

    #[test]
    fn permissions_for_lists_only_granted_actions() {
        let perms = permissions_for(Role::Staff);
        assert!(perms.iter().all(|(a, _)| permission(Role::Staff, *a).is_some()));
        assert!(!perms.iter().any(|(a, _)| *a == Action::ApproveIncentives));
        assert_eq!(permissions_for(Role::Admin).len(), Action::ALL.len() - 1);
    }
}
