//! SQLite persistence for the portal.
//!
//! `PortalDb` owns a single connection; `DbHandle` shares it across request
//! handlers. Multi-step procedures (assignment save, release, finalize, reopen)
//! each run inside one `unchecked_transaction`, which is sound because the
//! handle's mutex already serializes access.
//!
//! Operations are grouped by area:
//! - `people`: profiles, admin membership, sessions, magic links, job roles, employees
//! - `catalog`: cycles, rubrics, cycle→rubric mappings
//! - `reviews`: assignments, reviews, scores, calibration summaries

mod catalog;
mod people;
mod reviews;

pub use catalog::NewCycle;
pub use people::{EmployeeUpdate, JobRoleUpdate, NewJobRole, normalize_email, normalize_role_code};
pub use reviews::{FinalizeRequest, NarrativeUpdate};

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension, Params, Row, params};
use serde::de::DeserializeOwned;

use super::models::*;

/// Async-safe handle to the portal database.
///
/// Wraps `PortalDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<PortalDb>>,
}

impl DbHandle {
    pub fn new(db: PortalDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PortalDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup, CLI
    /// commands and tests; never from a request handler.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, PortalDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct PortalDb {
    conn: Connection,
}

impl PortalDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory {}", parent.display())
            })?;
        }
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
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS profiles (
                    id TEXT PRIMARY KEY,
                    email TEXT UNIQUE,
                    full_name TEXT,
                    user_role TEXT NOT NULL DEFAULT 'employee',
                    can_review INTEGER NOT NULL DEFAULT 0,
                    is_active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS admin_users (
                    user_id TEXT PRIMARY KEY REFERENCES profiles(id) ON DELETE CASCADE,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS sessions (
                    token_hash TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
                    created_at TEXT NOT NULL,
                    expires_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS magic_links (
                    token_hash TEXT PRIMARY KEY,
                    email TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    expires_at TEXT NOT NULL,
                    consumed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS app_settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS audit_log (
                    id TEXT PRIMARY KEY,
                    action TEXT NOT NULL,
                    entity_type TEXT NOT NULL,
                    entity_id TEXT NOT NULL,
                    actor_user_id TEXT NOT NULL,
                    before_state TEXT,
                    after_state TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS job_roles (
                    id TEXT PRIMARY KEY,
                    code TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    employee_code_prefix TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS employee_code_counters (
                    prefix TEXT PRIMARY KEY,
                    last_value INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS employees (
                    id TEXT PRIMARY KEY REFERENCES profiles(id) ON DELETE CASCADE,
                    job_role_id TEXT REFERENCES job_roles(id),
                    hire_date TEXT,
                    employee_code TEXT UNIQUE,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS review_cycles (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    start_date TEXT NOT NULL,
                    end_date TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'draft',
                    created_by TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS rubrics (
                    id TEXT PRIMARY KEY,
                    role_id TEXT NOT NULL REFERENCES job_roles(id),
                    version TEXT NOT NULL,
                    is_active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL,
                    UNIQUE(role_id, version)
                );

                CREATE TABLE IF NOT EXISTS rubric_categories (
                    id TEXT PRIMARY KEY,
                    rubric_id TEXT NOT NULL REFERENCES rubrics(id) ON DELETE CASCADE,
                    code TEXT NOT NULL,
                    name TEXT NOT NULL,
                    description TEXT,
                    weight REAL NOT NULL DEFAULT 1.0,
                    is_scored INTEGER NOT NULL DEFAULT 1,
                    sort_order INTEGER NOT NULL DEFAULT 0,
                    UNIQUE(rubric_id, code)
                );

                CREATE TABLE IF NOT EXISTS cycle_rubrics (
                    cycle_id TEXT NOT NULL REFERENCES review_cycles(id),
                    job_role_id TEXT NOT NULL REFERENCES job_roles(id),
                    rubric_id TEXT NOT NULL REFERENCES rubrics(id),
                    PRIMARY KEY (cycle_id, job_role_id)
                );

                CREATE TABLE IF NOT EXISTS review_assignments (
                    id TEXT PRIMARY KEY,
                    cycle_id TEXT NOT NULL REFERENCES review_cycles(id),
                    employee_id TEXT NOT NULL REFERENCES employees(id),
                    reviewer_id TEXT NOT NULL REFERENCES profiles(id),
                    reviewer_type TEXT NOT NULL,
                    is_active INTEGER NOT NULL DEFAULT 1,
                    is_required INTEGER NOT NULL DEFAULT 0,
                    created_by TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE(cycle_id, employee_id, reviewer_id, reviewer_type)
                );

                CREATE TABLE IF NOT EXISTS reviews (
                    id TEXT PRIMARY KEY,
                    assignment_id TEXT NOT NULL UNIQUE REFERENCES review_assignments(id),
                    cycle_id TEXT NOT NULL,
                    employee_id TEXT NOT NULL,
                    reviewer_id TEXT NOT NULL,
                    reviewer_type TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'draft',
                    summary_reviewer_private TEXT,
                    summary_employee_visible TEXT,
                    narrative_share_with_employee INTEGER NOT NULL DEFAULT 0,
                    submitted_at TEXT,
                    finalized_at TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS review_scores (
                    review_id TEXT PRIMARY KEY REFERENCES reviews(id) ON DELETE CASCADE,
                    category_scores TEXT NOT NULL DEFAULT '{}',
                    base_score REAL,
                    calibration_adjustment REAL,
                    final_score REAL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS cycle_employee_summary (
                    id TEXT PRIMARY KEY,
                    cycle_id TEXT NOT NULL REFERENCES review_cycles(id),
                    employee_id TEXT NOT NULL REFERENCES employees(id),
                    primary_review_id TEXT NOT NULL REFERENCES reviews(id),
                    primary_final_score REAL,
                    performance_rating TEXT,
                    performance_rating_value INTEGER,
                    calibration_adjustment REAL NOT NULL DEFAULT 0,
                    calibration_reason TEXT,
                    final_narrative_employee_visible TEXT,
                    computed_by TEXT NOT NULL,
                    computed_at TEXT NOT NULL,
                    finalized_at TEXT,
                    released_at TEXT,
                    released_by TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE(cycle_id, employee_id)
                );

                CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
                CREATE INDEX IF NOT EXISTS idx_assignments_reviewer ON review_assignments(reviewer_id, cycle_id);
                CREATE INDEX IF NOT EXISTS idx_assignments_employee ON review_assignments(cycle_id, employee_id);
                CREATE INDEX IF NOT EXISTS idx_reviews_employee ON reviews(employee_id, cycle_id);
                CREATE INDEX IF NOT EXISTS idx_summary_employee ON cycle_employee_summary(employee_id);
                CREATE INDEX IF NOT EXISTS idx_audit_entity ON audit_log(entity_type, entity_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Query helpers ─────────────────────────────────────────────────

    fn query_vec<T, P, F>(&self, sql: &str, params: P, map: F, what: &str) -> Result<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut stmt = self
            .conn
            .prepare(sql)
            .with_context(|| format!("Failed to prepare {}", what))?;
        let rows = stmt
            .query_map(params, map)
            .with_context(|| format!("Failed to query {}", what))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.with_context(|| format!("Failed to read {} row", what))?);
        }
        Ok(out)
    }

    fn query_opt<T, P, F>(&self, sql: &str, params: P, map: F, what: &str) -> Result<Option<T>>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.conn
            .query_row(sql, params, map)
            .optional()
            .with_context(|| format!("Failed to query {}", what))
    }

    // ── Settings ──────────────────────────────────────────────────────

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.query_opt(
            "SELECT value FROM app_settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
            "setting",
        )
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO app_settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, now()],
            )
            .context("Failed to upsert setting")?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM app_settings WHERE key = ?1", params![key])
            .context("Failed to delete setting")?;
        Ok(())
    }

    // ── Audit log ─────────────────────────────────────────────────────

    pub fn record_audit(
        &self,
        action: &str,
        entity_type: &str,
        entity_id: &str,
        actor_user_id: &str,
        before: Option<&serde_json::Value>,
        after: Option<&serde_json::Value>,
    ) -> Result<AuditEntry> {
        let id = new_id();
        let created_at = now();
        self.conn
            .execute(
                "INSERT INTO audit_log (id, action, entity_type, entity_id, actor_user_id, before_state, after_state, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id,
                    action,
                    entity_type,
                    entity_id,
                    actor_user_id,
                    before.map(|v| v.to_string()),
                    after.map(|v| v.to_string()),
                    created_at,
                ],
            )
            .context("Failed to insert audit entry")?;
        Ok(AuditEntry {
            id,
            action: action.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            actor_user_id: actor_user_id.to_string(),
            before_state: before.cloned(),
            after_state: after.cloned(),
            created_at,
        })
    }

    pub fn list_audit(&self, entity_type: &str, entity_id: &str) -> Result<Vec<AuditEntry>> {
        self.query_vec(
            "SELECT id, action, entity_type, entity_id, actor_user_id, before_state, after_state, created_at
             FROM audit_log WHERE entity_type = ?1 AND entity_id = ?2 ORDER BY created_at, rowid",
            params![entity_type, entity_id],
            audit_from_row,
            "audit entries",
        )
    }
}

/// Current UTC time as a sortable RFC 3339 string.
pub fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ── Enum columns ──────────────────────────────────────────────────────

macro_rules! text_column {
    ($($ty:ty),* $(,)?) => {$(
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    )*};
}

text_column!(UserRole, ReviewerType, ReviewStatus, CycleStatus, PerformanceRating);

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn opt_json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        serde_json::from_str(&s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
    })
    .transpose()
}

// ── Row mappers ───────────────────────────────────────────────────────

const PROFILE_COLUMNS: &str =
    "id, email, full_name, user_role, can_review, is_active, created_at, updated_at";

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<Profile> {
    Ok(Profile {
        id: row.get(0)?,
        email: row.get(1)?,
        full_name: row.get(2)?,
        user_role: row.get(3)?,
        can_review: row.get(4)?,
        is_active: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

const JOB_ROLE_COLUMNS: &str = "id, code, name, employee_code_prefix";

fn job_role_from_row(row: &Row<'_>) -> rusqlite::Result<JobRole> {
    Ok(JobRole {
        id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        employee_code_prefix: row.get(3)?,
    })
}

const CYCLE_COLUMNS: &str =
    "id, name, start_date, end_date, status, created_by, created_at, updated_at";

fn cycle_from_row(row: &Row<'_>) -> rusqlite::Result<ReviewCycle> {
    Ok(ReviewCycle {
        id: row.get(0)?,
        name: row.get(1)?,
        start_date: row.get(2)?,
        end_date: row.get(3)?,
        status: row.get(4)?,
        created_by: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

const RUBRIC_COLUMNS: &str = "id, role_id, version, is_active, created_at";

fn rubric_from_row(row: &Row<'_>) -> rusqlite::Result<Rubric> {
    Ok(Rubric {
        id: row.get(0)?,
        role_id: row.get(1)?,
        version: row.get(2)?,
        is_active: row.get(3)?,
        created_at: row.get(4)?,
    })
}

const CATEGORY_COLUMNS: &str =
    "rc.id, rc.rubric_id, rc.code, rc.name, rc.description, rc.weight, rc.is_scored, rc.sort_order";

fn category_from_row(row: &Row<'_>) -> rusqlite::Result<RubricCategory> {
    Ok(RubricCategory {
        id: row.get(0)?,
        rubric_id: row.get(1)?,
        code: row.get(2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        weight: row.get(5)?,
        is_scored: row.get(6)?,
        sort_order: row.get(7)?,
    })
}

const ASSIGNMENT_COLUMNS: &str = "id, cycle_id, employee_id, reviewer_id, reviewer_type, is_active, is_required, created_by, created_at, updated_at";

fn assignment_from_row(row: &Row<'_>) -> rusqlite::Result<ReviewAssignment> {
    Ok(ReviewAssignment {
        id: row.get(0)?,
        cycle_id: row.get(1)?,
        employee_id: row.get(2)?,
        reviewer_id: row.get(3)?,
        reviewer_type: row.get(4)?,
        is_active: row.get(5)?,
        is_required: row.get(6)?,
        created_by: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

const REVIEW_COLUMNS: &str = "id, assignment_id, cycle_id, employee_id, reviewer_id, reviewer_type, status, summary_reviewer_private, summary_employee_visible, narrative_share_with_employee, submitted_at, finalized_at, created_at, updated_at";

fn review_from_row(row: &Row<'_>) -> rusqlite::Result<Review> {
    Ok(Review {
        id: row.get(0)?,
        assignment_id: row.get(1)?,
        cycle_id: row.get(2)?,
        employee_id: row.get(3)?,
        reviewer_id: row.get(4)?,
        reviewer_type: row.get(5)?,
        status: row.get(6)?,
        summary_reviewer_private: row.get(7)?,
        summary_employee_visible: row.get(8)?,
        narrative_share_with_employee: row.get(9)?,
        submitted_at: row.get(10)?,
        finalized_at: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

const SCORE_COLUMNS: &str =
    "review_id, category_scores, base_score, calibration_adjustment, final_score, updated_at";

fn score_from_row(row: &Row<'_>) -> rusqlite::Result<ReviewScore> {
    Ok(ReviewScore {
        review_id: row.get(0)?,
        category_scores: json_column(row, 1)?,
        base_score: row.get(2)?,
        calibration_adjustment: row.get(3)?,
        final_score: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

const SUMMARY_COLUMNS: &str = "id, cycle_id, employee_id, primary_review_id, primary_final_score, performance_rating, performance_rating_value, calibration_adjustment, calibration_reason, final_narrative_employee_visible, computed_by, computed_at, finalized_at, released_at, released_by, created_at, updated_at";

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<CycleEmployeeSummary> {
    Ok(CycleEmployeeSummary {
        id: row.get(0)?,
        cycle_id: row.get(1)?,
        employee_id: row.get(2)?,
        primary_review_id: row.get(3)?,
        primary_final_score: row.get(4)?,
        performance_rating: row.get(5)?,
        performance_rating_value: row.get(6)?,
        calibration_adjustment: row.get(7)?,
        calibration_reason: row.get(8)?,
        final_narrative_employee_visible: row.get(9)?,
        computed_by: row.get(10)?,
        computed_at: row.get(11)?,
        finalized_at: row.get(12)?,
        released_at: row.get(13)?,
        released_by: row.get(14)?,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
    })
}

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    Ok(AuditEntry {
        id: row.get(0)?,
        action: row.get(1)?,
        entity_type: row.get(2)?,
        entity_id: row.get(3)?,
        actor_user_id: row.get(4)?,
        before_state: opt_json_column(row, 5)?,
        after_state: opt_json_column(row, 6)?,
        created_at: row.get(7)?,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────
