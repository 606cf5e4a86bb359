use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};

use leadflow_core::{
    IncentiveBreakdown, IncentiveRules, IncentiveStatus, LeadStatus, Month, ReviewStatus, Role,
};

use super::models::*;

/// Async-safe handle to the CRM database.
///
/// Wraps `CrmDb` behind `Arc<Mutex>` and runs all access on tokio's blocking
/// thread pool via `spawn_blocking`, so synchronous SQLite I/O never ties up
/// async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<CrmDb>>,
}

impl DbHandle {
    pub fn new(db: CrmDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&CrmDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            // Poisoning is ignored: SQLite rolls back any transaction a
            // panicking closure left open.
            let guard = db.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

/// True when `err` comes from a UNIQUE / CHECK constraint failure.
pub fn is_constraint_violation(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<rusqlite::Error>(),
        Some(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Quoted SQL list of status literals, e.g. `'calculating','pending_review'`.
fn status_list(statuses: &[IncentiveStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(",")
}

const ORGANIZATION_COLUMNS: &str = "id, name, incentive_rules, is_active, created_at";
const USER_COLUMNS: &str = "id, organization_id, name, phone, email, role, is_active, created_at";
const CATEGORY_COLUMNS: &str = "id, organization_id, name, commission_bps, is_active, created_at";
const LEAD_COLUMNS: &str = "id, organization_id, sales_rep_id, category_id, customer_name, customer_phone, status, deal_size, review_status, sale_date, notes, created_at, updated_at";
const INCENTIVE_COLUMNS: &str = "id, user_id, organization_id, month, sales_count, gross_commission, streak_days, streak_bonus, review_count, review_bonus, penalty_amount, net_incentive, capped_amount, status, final_approved_amount, reviewed_by, reviewed_at, review_notes, paid_at, payment_reference, created_at, updated_at";

pub struct CrmDb {
    conn: Connection,
}

impl CrmDb {
    /// Open (or create) a SQLite database at the given path and create the schema.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.create_schema().context("Failed to create schema")?;
        Ok(())
    }

    fn create_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS organizations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    incentive_rules TEXT,
                    is_active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    organization_id INTEGER NOT NULL REFERENCES organizations(id),
                    name TEXT NOT NULL,
                    phone TEXT NOT NULL,
                    email TEXT,
                    role TEXT NOT NULL,
                    is_active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(organization_id, phone)
                );

                CREATE TABLE IF NOT EXISTS categories (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    organization_id INTEGER NOT NULL REFERENCES organizations(id),
                    name TEXT NOT NULL,
                    commission_bps INTEGER,
                    is_active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(organization_id, name)
                );

                CREATE TABLE IF NOT EXISTS leads (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    organization_id INTEGER NOT NULL REFERENCES organizations(id),
                    sales_rep_id INTEGER NOT NULL REFERENCES users(id),
                    category_id INTEGER REFERENCES categories(id),
                    customer_name TEXT NOT NULL,
                    customer_phone TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'new',
                    deal_size INTEGER NOT NULL DEFAULT 0 CHECK (deal_size BETWEEN 0 AND 100000000000000),
                    review_status TEXT NOT NULL DEFAULT 'not_requested',
                    sale_date TEXT,
                    notes TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS monthly_incentives (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id),
                    organization_id INTEGER NOT NULL REFERENCES organizations(id),
                    month TEXT NOT NULL,
                    sales_count INTEGER NOT NULL DEFAULT 0,
                    gross_commission INTEGER NOT NULL DEFAULT 0,
                    streak_days INTEGER NOT NULL DEFAULT 0,
                    streak_bonus INTEGER NOT NULL DEFAULT 0,
                    review_count INTEGER NOT NULL DEFAULT 0,
                    review_bonus INTEGER NOT NULL DEFAULT 0,
                    penalty_amount INTEGER NOT NULL DEFAULT 0,
                    net_incentive INTEGER NOT NULL DEFAULT 0,
                    capped_amount INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL DEFAULT 'calculating',
                    final_approved_amount INTEGER,
                    reviewed_by INTEGER REFERENCES users(id),
                    reviewed_at TEXT,
                    review_notes TEXT,
                    paid_at TEXT,
                    payment_reference TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(user_id, month),
                    CHECK ((status IN ('approved', 'paid')) = (final_approved_amount IS NOT NULL))
                );

                CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_users_org ON users(organization_id, role);
                CREATE INDEX IF NOT EXISTS idx_categories_org ON categories(organization_id);
                CREATE INDEX IF NOT EXISTS idx_leads_org_rep ON leads(organization_id, sales_rep_id);
                CREATE INDEX IF NOT EXISTS idx_leads_sale_date ON leads(sales_rep_id, sale_date);
                CREATE INDEX IF NOT EXISTS idx_incentives_org_month ON monthly_incentives(organization_id, month);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Organizations ─────────────────────────────────────────────────

    pub fn create_organization(&self, name: &str) -> Result<Organization> {
        self.conn
            .execute("INSERT INTO organizations (name) VALUES (?1)", params![name])
            .context("Failed to insert organization")?;
        let id = self.conn.last_insert_rowid();
        self.get_organization(id)?
            .context("Organization not found after insert")
    }

    /// Create an organization together with its first admin, given as
    /// `(name, phone, email)`. Either both rows are written or neither is.
    pub fn create_organization_with_admin(
        &self,
        name: &str,
        admin: Option<(&str, &str, Option<&str>)>,
    ) -> Result<(Organization, Option<User>)> {
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let organization = self.create_organization(name)?;
        let admin = admin
            .map(|(admin_name, phone, email)| {
                self.create_user(organization.id, admin_name, phone, email, Role::Admin)
            })
            .transpose()?;

        tx.commit().context("Failed to commit organization")?;
        Ok((organization, admin))
    }

    pub fn get_organization(&self, id: i64) -> Result<Option<Organization>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE id = ?1"),
                params![id],
                organization_row,
            )
            .optional()
            .context("Failed to query organization")?;
        row.map(OrganizationRow::into_organization).transpose()
    }

    pub fn rename_organization(&self, id: i64, name: &str) -> Result<Option<Organization>> {
        self.conn
            .execute(
                "UPDATE organizations SET name = ?1 WHERE id = ?2",
                params![name, id],
            )
            .context("Failed to rename organization")?;
        self.get_organization(id)
    }

    /// Store (or clear, with `None`) the organization's incentive rule override.
    pub fn set_incentive_rules(
        &self,
        id: i64,
        rules: Option<&IncentiveRules>,
    ) -> Result<Option<Organization>> {
        let json = rules
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize incentive rules")?;
        self.conn
            .execute(
                "UPDATE organizations SET incentive_rules = ?1 WHERE id = ?2",
                params![json, id],
            )
            .context("Failed to update incentive rules")?;
        self.get_organization(id)
    }

    // ── Users ─────────────────────────────────────────────────────────

    pub fn create_user(
        &self,
        organization_id: i64,
        name: &str,
        phone: &str,
        email: Option<&str>,
        role: Role,
    ) -> Result<User> {
        self.conn
            .execute(
                "INSERT INTO users (organization_id, name, phone, email, role) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![organization_id, name, phone, email, role.as_str()],
            )
            .context("Failed to insert user")?;
        let id = self.conn.last_insert_rowid();
        self.get_user(organization_id, id)?
            .context("User not found after insert")
    }

    pub fn get_user(&self, organization_id: i64, id: i64) -> Result<Option<User>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1 AND organization_id = ?2"),
                params![id, organization_id],
                user_row,
            )
            .optional()
            .context("Failed to query user")?;
        row.map(UserRow::into_user).transpose()
    }

    pub fn list_users(&self, organization_id: i64, role: Option<Role>) -> Result<Vec<User>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {USER_COLUMNS} FROM users
                 WHERE organization_id = ?1 AND (?2 IS NULL OR role = ?2)
                 ORDER BY id"
            ))
            .context("Failed to prepare list_users")?;
        let rows = stmt
            .query_map(params![organization_id, role.map(|r| r.as_str())], user_row)
            .context("Failed to query users")?;
        let mut users = Vec::new();
        for row in rows {
            let r = row.context("Failed to read user row")?;
            users.push(r.into_user()?);
        }
        Ok(users)
    }

    pub fn list_active_sales_reps(&self, organization_id: i64) -> Result<Vec<User>> {
        Ok(self
            .list_users(organization_id, Some(Role::SalesRep))?
            .into_iter()
            .filter(|u| u.is_active)
            .collect())
    }

    pub fn update_user(
        &self,
        organization_id: i64,
        id: i64,
        name: Option<&str>,
        email: Option<Option<&str>>,
        role: Option<Role>,
        is_active: Option<bool>,
    ) -> Result<Option<User>> {
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        if let Some(n) = name {
            tx.execute(
                "UPDATE users SET name = ?1 WHERE id = ?2 AND organization_id = ?3",
                params![n, id, organization_id],
            )
            .context("Failed to update user name")?;
        }
        if let Some(e) = email {
            tx.execute(
                "UPDATE users SET email = ?1 WHERE id = ?2 AND organization_id = ?3",
                params![e, id, organization_id],
            )
            .context("Failed to update user email")?;
        }
        if let Some(r) = role {
            tx.execute(
                "UPDATE users SET role = ?1 WHERE id = ?2 AND organization_id = ?3",
                params![r.as_str(), id, organization_id],
            )
            .context("Failed to update user role")?;
        }
        if let Some(active) = is_active {
            tx.execute(
                "UPDATE users SET is_active = ?1 WHERE id = ?2 AND organization_id = ?3",
                params![active, id, organization_id],
            )
            .context("Failed to update user active flag")?;
        }

        tx.commit().context("Failed to commit user update")?;
        self.get_user(organization_id, id)
    }

    // ── Categories ────────────────────────────────────────────────────

    pub fn create_category(
        &self,
        organization_id: i64,
        name: &str,
        commission_bps: Option<u32>,
    ) -> Result<Category> {
        self.conn
            .execute(
                "INSERT INTO categories (organization_id, name, commission_bps) VALUES (?1, ?2, ?3)",
                params![organization_id, name, commission_bps],
            )
            .context("Failed to insert category")?;
        let id = self.conn.last_insert_rowid();
        self.get_category(organization_id, id)?
            .context("Category not found after insert")
    }

    pub fn get_category(&self, organization_id: i64, id: i64) -> Result<Option<Category>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {CATEGORY_COLUMNS} FROM categories WHERE id = ?1 AND organization_id = ?2"
                ),
                params![id, organization_id],
                category_row,
            )
            .optional()
            .context("Failed to query category")
    }

    pub fn list_categories(
        &self,
        organization_id: i64,
        include_inactive: bool,
    ) -> Result<Vec<Category>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {CATEGORY_COLUMNS} FROM categories
                 WHERE organization_id = ?1 AND (?2 OR is_active = 1)
                 ORDER BY name"
            ))
            .context("Failed to prepare list_categories")?;
        let rows = stmt
            .query_map(params![organization_id, include_inactive], category_row)
            .context("Failed to query categories")?;
        let mut categories = Vec::new();
        for row in rows {
            categories.push(row.context("Failed to read category row")?);
        }
        Ok(categories)
    }

    pub fn update_category(
        &self,
        organization_id: i64,
        id: i64,
        name: Option<&str>,
        commission_bps: Option<Option<u32>>,
        is_active: Option<bool>,
    ) -> Result<Option<Category>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        if let Some(n) = name {
            tx.execute(
                "UPDATE categories SET name = ?1 WHERE id = ?2 AND organization_id = ?3",
                params![n, id, organization_id],
            )
            .context("Failed to update category name")?;
        }
        if let Some(bps) = commission_bps {
            tx.execute(
                "UPDATE categories SET commission_bps = ?1 WHERE id = ?2 AND organization_id = ?3",
                params![bps, id, organization_id],
            )
            .context("Failed to update category commission")?;
        }
        if let Some(active) = is_active {
            tx.execute(
                "UPDATE categories SET is_active = ?1 WHERE id = ?2 AND organization_id = ?3",
                params![active, id, organization_id],
            )
            .context("Failed to update category active flag")?;
        }

        tx.commit().context("Failed to commit category update")?;
        self.get_category(organization_id, id)
    }

    // ── Leads ─────────────────────────────────────────────────────────

    pub fn create_lead(&self, organization_id: i64, lead: &NewLead) -> Result<Lead> {
        self.conn
            .execute(
                "INSERT INTO leads (organization_id, sales_rep_id, category_id, customer_name, customer_phone, deal_size, notes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    organization_id,
                    lead.sales_rep_id,
                    lead.category_id,
                    lead.customer_name,
                    lead.customer_phone,
                    lead.deal_size,
                    lead.notes
                ],
            )
            .context("Failed to insert lead")?;
        let id = self.conn.last_insert_rowid();
        self.get_lead(organization_id, id)?
            .context("Lead not found after insert")
    }

    pub fn get_lead(&self, organization_id: i64, id: i64) -> Result<Option<Lead>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?1 AND organization_id = ?2"),
                params![id, organization_id],
                lead_row,
            )
            .optional()
            .context("Failed to query lead")?;
        row.map(LeadRow::into_lead).transpose()
    }

    pub fn list_leads(&self, organization_id: i64, filter: &LeadFilter) -> Result<Vec<Lead>> {
        let mut sql = format!("SELECT {LEAD_COLUMNS} FROM leads WHERE organization_id = ?");
        let mut values: Vec<Value> = vec![Value::Integer(organization_id)];

        if let Some(rep) = filter.sales_rep_id {
            sql.push_str(" AND sales_rep_id = ?");
            values.push(Value::Integer(rep));
        }
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(category) = filter.category_id {
            sql.push_str(" AND category_id = ?");
            values.push(Value::Integer(category));
        }
        if let Some(month) = filter.month {
            sql.push_str(" AND substr(created_at, 1, 7) = ?");
            values.push(Value::Text(month.to_string()));
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");
        values.push(Value::Integer(filter.limit.unwrap_or(100)));

        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_leads")?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), lead_row)
            .context("Failed to query leads")?;
        let mut leads = Vec::new();
        for row in rows {
            let r = row.context("Failed to read lead row")?;
            leads.push(r.into_lead()?);
        }
        Ok(leads)
    }

    pub fn update_lead(
        &self,
        organization_id: i64,
        id: i64,
        update: &LeadUpdate,
    ) -> Result<Option<Lead>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        if let Some(category) = update.category_id {
            tx.execute(
                "UPDATE leads SET category_id = ?1, updated_at = datetime('now') WHERE id = ?2 AND organization_id = ?3",
                params![category, id, organization_id],
            )
            .context("Failed to update lead category")?;
        }
        if let Some(name) = &update.customer_name {
            tx.execute(
                "UPDATE leads SET customer_name = ?1, updated_at = datetime('now') WHERE id = ?2 AND organization_id = ?3",
                params![name, id, organization_id],
            )
            .context("Failed to update lead customer name")?;
        }
        if let Some(phone) = &update.customer_phone {
            tx.execute(
                "UPDATE leads SET customer_phone = ?1, updated_at = datetime('now') WHERE id = ?2 AND organization_id = ?3",
                params![phone, id, organization_id],
            )
            .context("Failed to update lead customer phone")?;
        }
        if let Some(deal_size) = update.deal_size {
            tx.execute(
                "UPDATE leads SET deal_size = ?1, updated_at = datetime('now') WHERE id = ?2 AND organization_id = ?3",
                params![deal_size, id, organization_id],
            )
            .context("Failed to update lead deal size")?;
        }
        if let Some(notes) = &update.notes {
            tx.execute(
                "UPDATE leads SET notes = ?1, updated_at = datetime('now') WHERE id = ?2 AND organization_id = ?3",
                params![notes, id, organization_id],
            )
            .context("Failed to update lead notes")?;
        }

        tx.commit().context("Failed to commit lead update")?;
        self.get_lead(organization_id, id)
    }

    /// Move a lead to `status`. `sale_date` is written as given; callers keep
    /// the existing date when a won sale is refunded.
    pub fn set_lead_status(
        &self,
        organization_id: i64,
        id: i64,
        status: LeadStatus,
        sale_date: Option<&str>,
    ) -> Result<Option<Lead>> {
        self.conn
            .execute(
                "UPDATE leads SET status = ?1, sale_date = ?2, updated_at = datetime('now')
                 WHERE id = ?3 AND organization_id = ?4",
                params![status.as_str(), sale_date, id, organization_id],
            )
            .context("Failed to update lead status")?;
        self.get_lead(organization_id, id)
    }

    pub fn set_review_status(
        &self,
        organization_id: i64,
        id: i64,
        review: ReviewStatus,
    ) -> Result<Option<Lead>> {
        self.conn
            .execute(
                "UPDATE leads SET review_status = ?1, updated_at = datetime('now')
                 WHERE id = ?2 AND organization_id = ?3",
                params![review.as_str(), id, organization_id],
            )
            .context("Failed to update lead review status")?;
        self.get_lead(organization_id, id)
    }

    pub fn delete_lead(&self, organization_id: i64, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "DELETE FROM leads WHERE id = ?1 AND organization_id = ?2",
                params![id, organization_id],
            )
            .context("Failed to delete lead")?;
        Ok(count > 0)
    }

    /// Closed sales (won or refunded) for one sales rep in one month, with
    /// each sale's category commission rate.
    pub fn sales_for_month(
        &self,
        organization_id: i64,
        sales_rep_id: i64,
        month: Month,
    ) -> Result<Vec<SaleRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT l.id, l.deal_size, l.sale_date, l.status, l.review_status, c.commission_bps
                 FROM leads l
                 LEFT JOIN categories c ON c.id = l.category_id
                 WHERE l.organization_id = ?1 AND l.sales_rep_id = ?2
                   AND l.status IN ('won', 'refunded')
                   AND l.sale_date >= ?3 AND l.sale_date <= ?4
                 ORDER BY l.sale_date, l.id",
            )
            .context("Failed to prepare sales_for_month")?;
        let first = month.first_day().to_string();
        let last = month.last_day().to_string();
        let rows = stmt
            .query_map(params![organization_id, sales_rep_id, first, last], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<u32>>(5)?,
                ))
            })
            .context("Failed to query sales")?;
        let mut sales = Vec::new();
        for row in rows {
            let (lead_id, deal_size, sale_date, status, review, bps) =
                row.context("Failed to read sale row")?;
            sales.push(SaleRow {
                lead_id,
                deal_size,
                sale_date,
                status: LeadStatus::from_str(&status).context("Failed to parse lead status")?,
                review_status: ReviewStatus::from_str(&review)
                    .context("Failed to parse review status")?,
                category_commission_bps: bps,
            });
        }
        Ok(sales)
    }

    // ── Monthly incentives ────────────────────────────────────────────

    pub fn get_incentive(&self, organization_id: i64, id: i64) -> Result<Option<MonthlyIncentive>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {INCENTIVE_COLUMNS} FROM monthly_incentives WHERE id = ?1 AND organization_id = ?2"
                ),
                params![id, organization_id],
                incentive_row,
            )
            .optional()
            .context("Failed to query incentive")?;
        row.map(IncentiveRow::into_incentive).transpose()
    }

    pub fn find_incentive(&self, user_id: i64, month: Month) -> Result<Option<MonthlyIncentive>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {INCENTIVE_COLUMNS} FROM monthly_incentives WHERE user_id = ?1 AND month = ?2"
                ),
                params![user_id, month.to_string()],
                incentive_row,
            )
            .optional()
            .context("Failed to query incentive by month")?;
        row.map(IncentiveRow::into_incentive).transpose()
    }

    pub fn list_incentives(
        &self,
        organization_id: i64,
        filter: &IncentiveFilter,
    ) -> Result<Vec<MonthlyIncentive>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {INCENTIVE_COLUMNS} FROM monthly_incentives
                 WHERE organization_id = ?1
                   AND (?2 IS NULL OR user_id = ?2)
                   AND (?3 IS NULL OR month = ?3)
                   AND (?4 IS NULL OR status = ?4)
                 ORDER BY month DESC, user_id"
            ))
            .context("Failed to prepare list_incentives")?;
        let rows = stmt
            .query_map(
                params![
                    organization_id,
                    filter.user_id,
                    filter.month.map(|m| m.to_string()),
                    filter.status.map(|s| s.as_str())
                ],
                incentive_row,
            )
            .context("Failed to query incentives")?;
        let mut incentives = Vec::new();
        for row in rows {
            let r = row.context("Failed to read incentive row")?;
            incentives.push(r.into_incentive()?);
        }
        Ok(incentives)
    }

    /// Insert a fresh record in `calculating` for `(user, month)`.
    pub fn insert_incentive(
        &self,
        organization_id: i64,
        user_id: i64,
        month: Month,
    ) -> Result<MonthlyIncentive> {
        self.conn
            .execute(
                "INSERT INTO monthly_incentives (user_id, organization_id, month, status) VALUES (?1, ?2, ?3, ?4)",
                params![
                    user_id,
                    organization_id,
                    month.to_string(),
                    IncentiveStatus::Calculating.as_str()
                ],
            )
            .context("Failed to insert incentive")?;
        let id = self.conn.last_insert_rowid();
        self.get_incentive(organization_id, id)?
            .context("Incentive not found after insert")
    }

    /// Put an existing record back into `calculating`, clearing any earlier
    /// review. Only applies when the current status is one of `from`.
    pub fn reset_incentive(&self, id: i64, from: &[IncentiveStatus]) -> Result<bool> {
        let count = self
            .conn
            .execute(
                &format!(
                    "UPDATE monthly_incentives
                     SET status = 'calculating', final_approved_amount = NULL, reviewed_by = NULL,
                         reviewed_at = NULL, review_notes = NULL, updated_at = datetime('now')
                     WHERE id = ?1 AND status IN ({})",
                    status_list(from)
                ),
                params![id],
            )
            .context("Failed to reset incentive")?;
        Ok(count > 0)
    }

    /// Write a calculated breakdown and move the record from `calculating`
    /// to `next`.
    pub fn store_breakdown(
        &self,
        id: i64,
        breakdown: &IncentiveBreakdown,
        next: IncentiveStatus,
    ) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "UPDATE monthly_incentives
                 SET sales_count = ?1, gross_commission = ?2, streak_days = ?3, streak_bonus = ?4,
                     review_count = ?5, review_bonus = ?6, penalty_amount = ?7, net_incentive = ?8,
                     capped_amount = ?9, status = ?10, updated_at = datetime('now')
                 WHERE id = ?11 AND status = 'calculating'",
                params![
                    breakdown.sales_count,
                    breakdown.gross_commission,
                    breakdown.streak_days,
                    breakdown.streak_bonus,
                    breakdown.review_count,
                    breakdown.review_bonus,
                    breakdown.penalty_amount,
                    breakdown.net_incentive,
                    breakdown.capped_amount,
                    next.as_str(),
                    id
                ],
            )
            .context("Failed to store incentive breakdown")?;
        Ok(count > 0)
    }

    pub fn record_approval(
        &self,
        id: i64,
        from: &[IncentiveStatus],
        reviewer_id: i64,
        amount: i64,
        notes: Option<&str>,
    ) -> Result<bool> {
        let count = self
            .conn
            .execute(
                &format!(
                    "UPDATE monthly_incentives
                     SET status = 'approved', final_approved_amount = ?1, reviewed_by = ?2,
                         reviewed_at = datetime('now'), review_notes = ?3, updated_at = datetime('now')
                     WHERE id = ?4 AND status IN ({})",
                    status_list(from)
                ),
                params![amount, reviewer_id, notes, id],
            )
            .context("Failed to approve incentive")?;
        Ok(count > 0)
    }

    pub fn record_rejection(
        &self,
        id: i64,
        from: &[IncentiveStatus],
        reviewer_id: i64,
        reason: &str,
    ) -> Result<bool> {
        let count = self
            .conn
            .execute(
                &format!(
                    "UPDATE monthly_incentives
                     SET status = 'rejected', final_approved_amount = NULL, reviewed_by = ?1,
                         reviewed_at = datetime('now'), review_notes = ?2, updated_at = datetime('now')
                     WHERE id = ?3 AND status IN ({})",
                    status_list(from)
                ),
                params![reviewer_id, reason, id],
            )
            .context("Failed to reject incentive")?;
        Ok(count > 0)
    }

    pub fn record_payment(
        &self,
        id: i64,
        from: &[IncentiveStatus],
        payment_reference: &str,
    ) -> Result<bool> {
        let count = self
            .conn
            .execute(
                &format!(
                    "UPDATE monthly_incentives
                     SET status = 'paid', paid_at = datetime('now'), payment_reference = ?1,
                         updated_at = datetime('now')
                     WHERE id = ?2 AND status IN ({})",
                    status_list(from)
                ),
                params![payment_reference, id],
            )
            .context("Failed to mark incentive paid")?;
        Ok(count > 0)
    }

    // ── Dashboard ─────────────────────────────────────────────────────

    /// Lead counts by status for leads created in `month`.
    pub fn lead_status_counts(
        &self,
        organization_id: i64,
        sales_rep_id: Option<i64>,
        month: Month,
    ) -> Result<Vec<StatusCount>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT status, COUNT(*) FROM leads
                 WHERE organization_id = ?1 AND (?2 IS NULL OR sales_rep_id = ?2)
                   AND substr(created_at, 1, 7) = ?3
                 GROUP BY status ORDER BY status",
            )
            .context("Failed to prepare lead_status_counts")?;
        let rows = stmt
            .query_map(
                params![organization_id, sales_rep_id, month.to_string()],
                |row| {
                    Ok(StatusCount {
                        status: row.get(0)?,
                        count: row.get(1)?,
                    })
                },
            )
            .context("Failed to query lead status counts")?;
        let mut counts = Vec::new();
        for row in rows {
            counts.push(row.context("Failed to read status count row")?);
        }
        Ok(counts)
    }

    /// `(count, revenue)` of sales still standing as won with a sale date in `month`.
    pub fn won_totals(
        &self,
        organization_id: i64,
        sales_rep_id: Option<i64>,
        month: Month,
    ) -> Result<(i64, i64)> {
        self.conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(deal_size), 0) FROM leads
                 WHERE organization_id = ?1 AND (?2 IS NULL OR sales_rep_id = ?2)
                   AND status = 'won' AND sale_date >= ?3 AND sale_date <= ?4",
                params![
                    organization_id,
                    sales_rep_id,
                    month.first_day().to_string(),
                    month.last_day().to_string()
                ],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("Failed to query won totals")
    }

    pub fn incentive_totals(
        &self,
        organization_id: i64,
        user_id: Option<i64>,
        month: Month,
    ) -> Result<Vec<IncentiveTotal>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT status, COUNT(*), COALESCE(SUM(capped_amount), 0),
                        COALESCE(SUM(final_approved_amount), 0)
                 FROM monthly_incentives
                 WHERE organization_id = ?1 AND (?2 IS NULL OR user_id = ?2) AND month = ?3
                 GROUP BY status ORDER BY status",
            )
            .context("Failed to prepare incentive_totals")?;
        let rows = stmt
            .query_map(
                params![organization_id, user_id, month.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .context("Failed to query incentive totals")?;
        let mut totals = Vec::new();
        for row in rows {
            let (status, count, capped_amount, final_approved_amount) =
                row.context("Failed to read incentive total row")?;
            totals.push(IncentiveTotal {
                status: IncentiveStatus::from_str(&status)
                    .context("Failed to parse incentive status")?,
                count,
                capped_amount,
                final_approved_amount,
            });
        }
        Ok(totals)
    }

    // ── Settings ──────────────────────────────────────────────────────

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read setting")
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value],
            )
            .context("Failed to write setting")?;
        Ok(())
    }
}

// ── Row mapping ───────────────────────────────────────────────────────

/// Intermediate row struct for organizations.
struct OrganizationRow {
    id: i64,
    name: String,
    incentive_rules: Option<String>,
    is_active: bool,
    created_at: String,
}

fn organization_row(row: &Row<'_>) -> rusqlite::Result<OrganizationRow> {
    Ok(OrganizationRow {
        id: row.get(0)?,
        name: row.get(1)?,
        incentive_rules: row.get(2)?,
        is_active: row.get(3)?,
        created_at: row.get(4)?,
    })
}

impl OrganizationRow {
    fn into_organization(self) -> Result<Organization> {
        let incentive_rules = self
            .incentive_rules
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Failed to parse organization incentive rules JSON")?;
        Ok(Organization {
            id: self.id,
            name: self.name,
            incentive_rules,
            is_active: self.is_active,
            created_at: self.created_at,
        })
    }
}

struct UserRow {
    id: i64,
    organization_id: i64,
    name: String,
    phone: String,
    email: Option<String>,
    role: String,
    is_active: bool,
    created_at: String,
}

fn user_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        name: row.get(2)?,
        phone: row.get(3)?,
        email: row.get(4)?,
        role: row.get(5)?,
        is_active: row.get(6)?,
        created_at: row.get(7)?,
    })
}

impl UserRow {
    fn into_user(self) -> Result<User> {
        let role = Role::from_str(&self.role).context("Failed to parse user role")?;
        Ok(User {
            id: self.id,
            organization_id: self.organization_id,
            name: self.name,
            phone: self.phone,
            email: self.email,
            role,
            is_active: self.is_active,
            created_at: self.created_at,
        })
    }
}

fn category_row(row: &Row<'_>) -> rusqlite::Result<Category> {
    Ok(Category {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        name: row.get(2)?,
        commission_bps: row.get(3)?,
        is_active: row.get(4)?,
        created_at: row.get(5)?,
    })
}

struct LeadRow {
    id: i64,
    organization_id: i64,
    sales_rep_id: i64,
    category_id: Option<i64>,
    customer_name: String,
    customer_phone: String,
    status: String,
    deal_size: i64,
    review_status: String,
    sale_date: Option<String>,
    notes: String,
    created_at: String,
    updated_at: String,
}

fn lead_row(row: &Row<'_>) -> rusqlite::Result<LeadRow> {
    Ok(LeadRow {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        sales_rep_id: row.get(2)?,
        category_id: row.get(3)?,
        customer_name: row.get(4)?,
        customer_phone: row.get(5)?,
        status: row.get(6)?,
        deal_size: row.get(7)?,
        review_status: row.get(8)?,
        sale_date: row.get(9)?,
        notes: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

impl LeadRow {
    fn into_lead(self) -> Result<Lead> {
        let status = LeadStatus::from_str(&self.status).context("Failed to parse lead status")?;
        let review_status = ReviewStatus::from_str(&self.review_status)
            .context("Failed to parse lead review status")?;
        Ok(Lead {
            id: self.id,
            organization_id: self.organization_id,
            sales_rep_id: self.sales_rep_id,
            category_id: self.category_id,
            customer_name: self.customer_name,
            customer_phone: self.customer_phone,
            status,
            deal_size: self.deal_size,
            review_status,
            sale_date: self.sale_date,
            notes: self.notes,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Intermediate row struct for monthly_incentives.
struct IncentiveRow {
    id: i64,
    user_id: i64,
    organization_id: i64,
    month: String,
    breakdown: IncentiveBreakdown,
    status: String,
    final_approved_amount: Option<i64>,
    reviewed_by: Option<i64>,
    reviewed_at: Option<String>,
    review_notes: Option<String>,
    paid_at: Option<String>,
    payment_reference: Option<String>,
    created_at: String,
    updated_at: String,
}

fn incentive_row(row: &Row<'_>) -> rusqlite::Result<IncentiveRow> {
    Ok(IncentiveRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        organization_id: row.get(2)?,
        month: row.get(3)?,
        breakdown: IncentiveBreakdown {
            sales_count: row.get(4)?,
            gross_commission: row.get(5)?,
            streak_days: row.get(6)?,
            streak_bonus: row.get(7)?,
            review_count: row.get(8)?,
            review_bonus: row.get(9)?,
            penalty_amount: row.get(10)?,
            net_incentive: row.get(11)?,
            capped_amount: row.get(12)?,
        },
        status: row.get(13)?,
        final_approved_amount: row.get(14)?,
        reviewed_by: row.get(15)?,
        reviewed_at: row.get(16)?,
        review_notes: row.get(17)?,
        paid_at: row.get(18)?,
        payment_reference: row.get(19)?,
        created_at: row.get(20)?,
        updated_at: row.get(21)?,
    })
}

impl IncentiveRow {
    fn into_incentive(self) -> Result<MonthlyIncentive> {
        let month = Month::from_str(&self.month).context("Failed to parse incentive month")?;
        let status =
            IncentiveStatus::from_str(&self.status).context("Failed to parse incentive status")?;
        Ok(MonthlyIncentive {
            id: self.id,
            user_id: self.user_id,
            organization_id: self.organization_id,
            month,
            breakdown: self.breakdown,
            status,
            final_approved_amount: self.final_approved_amount,
            reviewed_by: self.reviewed_by,
            reviewed_at: self.reviewed_at,
            review_notes: self.review_notes,
            paid_at: self.paid_at,
            payment_reference: self.payment_reference,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
