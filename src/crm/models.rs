use serde::{Deserialize, Serialize};

use leadflow_core::{
    IncentiveBreakdown, IncentiveRules, IncentiveStatus, LeadStatus, Month, ReviewStatus, Role,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: i64,
    pub name: String,
    /// Per-organization override of the configured incentive rules.
    pub incentive_rules: Option<IncentiveRules>,
    pub is_active: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub organization_id: i64,
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
    pub role: Role,
    pub is_active: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub organization_id: i64,
    pub name: String,
    pub commission_bps: Option<u32>,
    pub is_active: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: i64,
    pub organization_id: i64,
    pub sales_rep_id: i64,
    pub category_id: Option<i64>,
    pub customer_name: String,
    pub customer_phone: String,
    pub status: LeadStatus,
    /// Minor currency units.
    pub deal_size: i64,
    pub review_status: ReviewStatus,
    pub sale_date: Option<String>,
    pub notes: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct NewLead {
    pub sales_rep_id: i64,
    pub category_id: Option<i64>,
    pub customer_name: String,
    pub customer_phone: String,
    pub deal_size: i64,
    pub notes: String,
}

#[derive(Debug, Clone, Default)]
pub struct LeadUpdate {
    pub category_id: Option<Option<i64>>,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub deal_size: Option<i64>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct LeadFilter {
    pub sales_rep_id: Option<i64>,
    pub status: Option<LeadStatus>,
    pub category_id: Option<i64>,
    /// Leads created in this month.
    pub month: Option<Month>,
    pub limit: Option<i64>,
}

/// A closed sale joined with its category rate, as fed to the calculator.
#[derive(Debug, Clone)]
pub struct SaleRow {
    pub lead_id: i64,
    pub deal_size: i64,
    pub sale_date: String,
    pub status: LeadStatus,
    pub review_status: ReviewStatus,
    pub category_commission_bps: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonthlyIncentive {
    pub id: i64,
    pub user_id: i64,
    pub organization_id: i64,
    pub month: Month,
    #[serde(flatten)]
    pub breakdown: IncentiveBreakdown,
    pub status: IncentiveStatus,
    pub final_approved_amount: Option<i64>,
    pub reviewed_by: Option<i64>,
    pub reviewed_at: Option<String>,
    pub review_notes: Option<String>,
    pub paid_at: Option<String>,
    pub payment_reference: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct IncentiveFilter {
    pub user_id: Option<i64>,
    pub month: Option<Month>,
    pub status: Option<IncentiveStatus>,
}

// API view types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusCount {
    pub status: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncentiveTotal {
    pub status: IncentiveStatus,
    pub count: i64,
    pub capped_amount: i64,
    pub final_approved_amount: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardView {
    pub month: Month,
    pub leads_by_status: Vec<StatusCount>,
    pub won_count: i64,
    pub won_revenue: i64,
    pub incentives: Vec<IncentiveTotal>,
}
