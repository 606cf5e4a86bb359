//! Domain rules shared by the Leadflow service and CLI.
//!
//! Nothing in this crate touches storage or the network: the incentive
//! calculator, the approval state machine, and the permission table are all
//! plain functions over plain data.

pub mod approval;
pub mod error;
pub mod incentive;
pub mod lead;
pub mod money;
pub mod month;
pub mod role;

pub use approval::{IncentiveEvent, IncentiveStatus};
pub use error::CoreError;
pub use incentive::{
    IncentiveBreakdown, IncentiveRules, SaleRecord, StreakTier, calculate_monthly_incentive,
};
pub use lead::{LeadStatus, ReviewStatus};
pub use month::Month;
pub use role::{Action, Role, Scope, permission};
