use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use rusqlite::{Row, params};
use serde::{Deserialize, Deserializer};

use super::*;
use crate::errors::{PortalError, portal_err};

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));
static NON_CODE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Z0-9_]").expect("valid regex"));

/// Job role codes are upper-case `A-Z0-9_`; whitespace becomes `_`.
pub fn normalize_role_code(raw: &str) -> String {
    let upper = raw.trim().to_uppercase();
    let underscored = WHITESPACE.replace_all(&upper, "_");
    NON_CODE_CHARS.replace_all(&underscored, "").into_owned()
}

pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Distinguishes an absent field (`None`) from an explicit `null` (`Some(None)`).
pub(crate) fn double_option<'de, D, T>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Deserialize::deserialize(de).map(Some)
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewJobRole {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub employee_code_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobRoleUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub employee_code_prefix: Option<Option<String>>,
}

/// Partial employee edit. Absent fields are untouched; `null` clears the
/// nullable ones.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmployeeUpdate {
    #[serde(default, deserialize_with = "double_option")]
    pub job_role_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub hire_date: Option<Option<String>>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub can_review: Option<bool>,
}

impl EmployeeUpdate {
    pub fn is_empty(&self) -> bool {
        self.job_role_id.is_none()
            && self.hire_date.is_none()
            && self.full_name.is_none()
            && self.email.is_none()
            && self.can_review.is_none()
    }
}

const EMPLOYEE_DETAIL_SELECT: &str = "SELECT e.id, e.job_role_id, e.hire_date, e.employee_code, e.created_at, e.updated_at,
            p.full_name, p.email, j.id, j.code, j.name, j.employee_code_prefix
     FROM employees e
     JOIN profiles p ON p.id = e.id
     LEFT JOIN job_roles j ON j.id = e.job_role_id";

fn employee_detail_from_row(row: &Row<'_>) -> rusqlite::Result<EmployeeDetail> {
    let role_id: Option<String> = row.get(8)?;
    let job_role = match role_id {
        Some(id) => Some(JobRole {
            id,
            code: row.get(9)?,
            name: row.get(10)?,
            employee_code_prefix: row.get(11)?,
        }),
        None => None,
    };
    Ok(EmployeeDetail {
        employee: Employee {
            id: row.get(0)?,
            job_role_id: row.get(1)?,
            hire_date: row.get(2)?,
            employee_code: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        },
        full_name: row.get(6)?,
        email: row.get(7)?,
        job_role,
    })
}

impl PortalDb {
    // ── Profiles ──────────────────────────────────────────────────────

    /// Create a profile for `email`, or return the existing one. An existing
    /// profile only picks up a new full name; its role is never changed here.
    pub fn upsert_profile(
        &self,
        email: &str,
        full_name: Option<&str>,
        role: UserRole,
    ) -> Result<Profile> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(portal_err(PortalError::BadRequest("Email is required".to_string())));
        }
        let full_name = full_name.map(str::trim).filter(|n| !n.is_empty());

        if let Some(existing) = self.get_profile_by_email(&email)? {
            if let Some(name) = full_name {
                self.conn
                    .execute(
                        "UPDATE profiles SET full_name = ?1, updated_at = ?2 WHERE id = ?3",
                        params![name, now(), existing.id],
                    )
                    .context("Failed to update profile name")?;
            }
            return self
                .get_profile(&existing.id)?
                .context("Profile not found after update");
        }

        let id = new_id();
        let ts = now();
        self.conn
            .execute(
                "INSERT INTO profiles (id, email, full_name, user_role, can_review, is_active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)",
                params![id, email, full_name, role, role != UserRole::Employee, ts],
            )
            .context("Failed to insert profile")?;
        self.get_profile(&id)?.context("Profile not found after insert")
    }

    pub fn get_profile(&self, id: &str) -> Result<Option<Profile>> {
        self.query_opt(
            &format!("SELECT {} FROM profiles WHERE id = ?1", PROFILE_COLUMNS),
            params![id],
            profile_from_row,
            "profile",
        )
    }

    pub fn get_profile_by_email(&self, email: &str) -> Result<Option<Profile>> {
        self.query_opt(
            &format!("SELECT {} FROM profiles WHERE email = ?1", PROFILE_COLUMNS),
            params![normalize_email(email)],
            profile_from_row,
            "profile by email",
        )
    }

    pub fn list_profiles(&self) -> Result<Vec<Profile>> {
        self.query_vec(
            &format!(
                "SELECT {} FROM profiles ORDER BY COALESCE(full_name, email), id",
                PROFILE_COLUMNS
            ),
            [],
            profile_from_row,
            "profiles",
        )
    }

    /// Active profiles that may be picked as reviewers.
    pub fn list_reviewer_candidates(&self) -> Result<Vec<Profile>> {
        Ok(self
            .list_profiles()?
            .into_iter()
            .filter(|p| p.is_active && (p.can_review || p.user_role != UserRole::Employee))
            .collect())
    }

    pub fn is_admin(&self, user_id: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT (SELECT COUNT(*) FROM admin_users WHERE user_id = ?1)
                      + (SELECT COUNT(*) FROM profiles WHERE id = ?1 AND user_role = 'admin')",
                params![user_id],
                |row| row.get(0),
            )
            .context("Failed to check admin membership")?;
        Ok(count > 0)
    }

    /// Effective role: admin membership wins over the profile's own role.
    pub fn effective_role(&self, profile: &Profile) -> Result<UserRole> {
        if self.is_admin(&profile.id)? {
            Ok(UserRole::Admin)
        } else {
            Ok(profile.user_role)
        }
    }

    pub fn grant_admin(&self, user_id: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO admin_users (user_id, created_at) VALUES (?1, ?2)
                 ON CONFLICT(user_id) DO NOTHING",
                params![user_id, now()],
            )
            .context("Failed to grant admin")?;
        Ok(())
    }

    // ── Sessions & magic links ────────────────────────────────────────

    pub fn create_magic_link(&self, token_hash: &str, email: &str, expires_at: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO magic_links (token_hash, email, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
                params![token_hash, normalize_email(email), now(), expires_at],
            )
            .context("Failed to insert magic link")?;
        Ok(())
    }

    /// Mark a sign-in link used and return its email. Expired, unknown and
    /// already-used links yield `None`.
    pub fn consume_magic_link(&self, token_hash: &str) -> Result<Option<String>> {
        let ts = now();
        let changed = self
            .conn
            .execute(
                "UPDATE magic_links SET consumed_at = ?1
                 WHERE token_hash = ?2 AND consumed_at IS NULL AND expires_at > ?1",
                params![ts, token_hash],
            )
            .context("Failed to consume magic link")?;
        if changed == 0 {
            return Ok(None);
        }
        self.query_opt(
            "SELECT email FROM magic_links WHERE token_hash = ?1",
            params![token_hash],
            |row| row.get(0),
            "magic link",
        )
    }

    pub fn create_session(&self, token_hash: &str, user_id: &str, expires_at: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sessions (token_hash, user_id, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
                params![token_hash, user_id, now(), expires_at],
            )
            .context("Failed to insert session")?;
        Ok(())
    }

    /// User id behind a live session token hash.
    pub fn session_user(&self, token_hash: &str) -> Result<Option<String>> {
        self.query_opt(
            "SELECT s.user_id FROM sessions s JOIN profiles p ON p.id = s.user_id
             WHERE s.token_hash = ?1 AND s.expires_at > ?2 AND p.is_active = 1",
            params![token_hash, now()],
            |row| row.get(0),
            "session",
        )
    }

    pub fn delete_session(&self, token_hash: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM sessions WHERE token_hash = ?1", params![token_hash])
            .context("Failed to delete session")?;
        Ok(changed > 0)
    }

    pub fn purge_expired_sessions(&self) -> Result<usize> {
        let ts = now();
        let sessions = self
            .conn
            .execute("DELETE FROM sessions WHERE expires_at <= ?1", params![ts])
            .context("Failed to purge sessions")?;
        self.conn
            .execute("DELETE FROM magic_links WHERE expires_at <= ?1", params![ts])
            .context("Failed to purge magic links")?;
        Ok(sessions)
    }

    // ── Job roles ─────────────────────────────────────────────────────

    pub fn list_job_roles(&self) -> Result<Vec<JobRole>> {
        self.query_vec(
            &format!("SELECT {} FROM job_roles ORDER BY code", JOB_ROLE_COLUMNS),
            [],
            job_role_from_row,
            "job roles",
        )
    }

    pub fn get_job_role(&self, id: &str) -> Result<Option<JobRole>> {
        self.query_opt(
            &format!("SELECT {} FROM job_roles WHERE id = ?1", JOB_ROLE_COLUMNS),
            params![id],
            job_role_from_row,
            "job role",
        )
    }

    pub fn get_job_role_by_code(&self, code: &str) -> Result<Option<JobRole>> {
        self.query_opt(
            &format!("SELECT {} FROM job_roles WHERE code = ?1", JOB_ROLE_COLUMNS),
            params![normalize_role_code(code)],
            job_role_from_row,
            "job role by code",
        )
    }

    pub fn create_job_role(&self, input: &NewJobRole) -> Result<JobRole> {
        let code = normalize_role_code(&input.code);
        if code.is_empty() {
            return Err(portal_err(PortalError::BadRequest(
                "Job role code is required".to_string(),
            )));
        }
        let name = input.name.trim();
        if name.is_empty() {
            return Err(portal_err(PortalError::BadRequest(
                "Job role name is required".to_string(),
            )));
        }
        if self.get_job_role_by_code(&code)?.is_some() {
            return Err(portal_err(PortalError::Conflict(format!(
                "Job role {} already exists",
                code
            ))));
        }
        let prefix = input
            .employee_code_prefix
            .as_deref()
            .map(normalize_role_code)
            .filter(|p| !p.is_empty());

        let id = new_id();
        self.conn
            .execute(
                "INSERT INTO job_roles (id, code, name, employee_code_prefix, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, code, name, prefix, now()],
            )
            .context("Failed to insert job role")?;
        self.get_job_role(&id)?.context("Job role not found after insert")
    }

    pub fn update_job_role(&self, code: &str, update: &JobRoleUpdate) -> Result<JobRole> {
        let role = self.get_job_role_by_code(code)?.ok_or_else(|| {
            portal_err(PortalError::NotFound(format!("Job role {} not found", code)))
        })?;

        if let Some(name) = &update.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(portal_err(PortalError::BadRequest(
                    "Job role name cannot be empty".to_string(),
                )));
            }
            self.conn
                .execute(
                    "UPDATE job_roles SET name = ?1 WHERE id = ?2",
                    params![name, role.id],
                )
                .context("Failed to update job role name")?;
        }
        if let Some(prefix) = &update.employee_code_prefix {
            let prefix = prefix
                .as_deref()
                .map(normalize_role_code)
                .filter(|p| !p.is_empty());
            self.conn
                .execute(
                    "UPDATE job_roles SET employee_code_prefix = ?1 WHERE id = ?2",
                    params![prefix, role.id],
                )
                .context("Failed to update job role prefix")?;
        }
        self.get_job_role(&role.id)?
            .context("Job role not found after update")
    }

    /// Delete an unused job role. Roles referenced by employees or rubrics are refused.
    pub fn delete_job_role(&self, code: &str) -> Result<()> {
        let role = self.get_job_role_by_code(code)?.ok_or_else(|| {
            portal_err(PortalError::NotFound(format!("Job role {} not found", code)))
        })?;
        let in_use: i64 = self
            .conn
            .query_row(
                "SELECT (SELECT COUNT(*) FROM employees WHERE job_role_id = ?1)
                      + (SELECT COUNT(*) FROM rubrics WHERE role_id = ?1)
                      + (SELECT COUNT(*) FROM cycle_rubrics WHERE job_role_id = ?1)",
                params![role.id],
                |row| row.get(0),
            )
            .context("Failed to check job role usage")?;
        if in_use > 0 {
            return Err(portal_err(PortalError::Conflict(format!(
                "Job role {} is in use",
                role.code
            ))));
        }
        self.conn
            .execute("DELETE FROM job_roles WHERE id = ?1", params![role.id])
            .context("Failed to delete job role")?;
        Ok(())
    }

    // ── Employees ─────────────────────────────────────────────────────

    /// Next employee code for a job role: `<prefix or code>-0001`, `-0002`, …
    pub fn generate_employee_code(&self, job_role_id: &str) -> Result<String> {
        let role = self.get_job_role(job_role_id)?.ok_or_else(|| {
            portal_err(PortalError::BadRequest("Unknown job role".to_string()))
        })?;
        let prefix = role.employee_code_prefix.unwrap_or(role.code);

        loop {
            let value: i64 = self
                .conn
                .query_row(
                    "INSERT INTO employee_code_counters (prefix, last_value) VALUES (?1, 1)
                     ON CONFLICT(prefix) DO UPDATE SET last_value = last_value + 1
                     RETURNING last_value",
                    params![prefix],
                    |row| row.get(0),
                )
                .context("Failed to advance employee code counter")?;
            let code = format!("{}-{:04}", prefix, value);
            let taken: i64 = self
                .conn
                .query_row(
                    "SELECT COUNT(*) FROM employees WHERE employee_code = ?1",
                    params![code],
                    |row| row.get(0),
                )
                .context("Failed to check employee code")?;
            if taken == 0 {
                return Ok(code);
            }
        }
    }

    pub fn get_employee(&self, id: &str) -> Result<Option<EmployeeDetail>> {
        self.query_opt(
            &format!("{} WHERE e.id = ?1", EMPLOYEE_DETAIL_SELECT),
            params![id],
            employee_detail_from_row,
            "employee",
        )
    }

    pub fn list_employees(&self) -> Result<Vec<EmployeeDetail>> {
        self.query_vec(
            &format!(
                "{} ORDER BY COALESCE(p.full_name, p.email), e.id",
                EMPLOYEE_DETAIL_SELECT
            ),
            [],
            employee_detail_from_row,
            "employees",
        )
    }

    /// Make sure `user_id` has an employee row. Given fields are applied; a
    /// code is generated whenever a job role is set and no code exists yet.
    pub fn ensure_employee(
        &self,
        user_id: &str,
        job_role_id: Option<&str>,
        hire_date: Option<&str>,
    ) -> Result<EmployeeDetail> {
        if self.get_profile(user_id)?.is_none() {
            return Err(portal_err(PortalError::NotFound("Profile not found".to_string())));
        }
        if let Some(role_id) = job_role_id
            && self.get_job_role(role_id)?.is_none()
        {
            return Err(portal_err(PortalError::BadRequest("Unknown job role".to_string())));
        }

        let ts = now();
        self.conn
            .execute(
                "INSERT INTO employees (id, created_at, updated_at) VALUES (?1, ?2, ?2)
                 ON CONFLICT(id) DO NOTHING",
                params![user_id, ts],
            )
            .context("Failed to insert employee")?;
        if let Some(date) = hire_date {
            self.conn
                .execute(
                    "UPDATE employees SET hire_date = ?1, updated_at = ?2 WHERE id = ?3",
                    params![date, ts, user_id],
                )
                .context("Failed to set hire date")?;
        }

        let current = self
            .get_employee(user_id)?
            .context("Employee not found after insert")?;
        if let Some(role_id) = job_role_id {
            let role_changed = current.employee.job_role_id.as_deref() != Some(role_id);
            if role_changed || current.employee.employee_code.is_none() {
                let code = self.generate_employee_code(role_id)?;
                self.conn
                    .execute(
                        "UPDATE employees SET job_role_id = ?1, employee_code = ?2, updated_at = ?3 WHERE id = ?4",
                        params![role_id, code, ts, user_id],
                    )
                    .context("Failed to set employee job role")?;
            }
        }
        self.get_employee(user_id)?
            .context("Employee not found after update")
    }

    /// Create or update an invited user's profile and employee row together.
    /// An unknown job role is rejected before anything is written.
    pub fn invite_employee(
        &self,
        email: &str,
        full_name: Option<&str>,
        job_role_id: Option<&str>,
        hire_date: Option<&str>,
    ) -> Result<EmployeeDetail> {
        if let Some(role_id) = job_role_id
            && self.get_job_role(role_id)?.is_none()
        {
            return Err(portal_err(PortalError::BadRequest("Unknown job role".to_string())));
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let profile = self.upsert_profile(email, full_name, UserRole::Employee)?;
        let employee = self.ensure_employee(&profile.id, job_role_id, hire_date)?;
        tx.commit().context("Failed to commit invitation")?;
        Ok(employee)
    }

    /// Apply an admin edit to an employee and its profile in one transaction.
    pub fn update_employee(&self, id: &str, update: &EmployeeUpdate) -> Result<EmployeeDetail> {
        let current = self
            .get_employee(id)?
            .ok_or_else(|| portal_err(PortalError::NotFound("Employee not found".to_string())))?;

        let full_name = match &update.full_name {
            Some(name) if name.trim().is_empty() => {
                return Err(portal_err(PortalError::BadRequest(
                    "full_name cannot be empty".to_string(),
                )));
            }
            Some(name) => Some(name.trim().to_string()),
            None => None,
        };
        let email = match &update.email {
            Some(email) if email.trim().is_empty() => {
                return Err(portal_err(PortalError::BadRequest(
                    "email cannot be empty".to_string(),
                )));
            }
            Some(email) => Some(normalize_email(email)),
            None => None,
        };
        if let Some(email) = &email
            && let Some(other) = self.get_profile_by_email(email)?
            && other.id != id
        {
            return Err(portal_err(PortalError::Conflict(format!(
                "Email {} is already in use",
                email
            ))));
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let ts = now();

        if let Some(name) = &full_name {
            tx.execute(
                "UPDATE profiles SET full_name = ?1, updated_at = ?2 WHERE id = ?3",
                params![name, ts, id],
            )
            .context("Failed to update full name")?;
        }
        if let Some(email) = &email {
            tx.execute(
                "UPDATE profiles SET email = ?1, updated_at = ?2 WHERE id = ?3",
                params![email, ts, id],
            )
            .context("Failed to update email")?;
        }
        if let Some(can_review) = update.can_review {
            tx.execute(
                "UPDATE profiles SET can_review = ?1, updated_at = ?2 WHERE id = ?3",
                params![can_review, ts, id],
            )
            .context("Failed to update can_review")?;
        }
        if let Some(hire_date) = &update.hire_date {
            let hire_date = hire_date.as_deref().map(str::trim).filter(|d| !d.is_empty());
            tx.execute(
                "UPDATE employees SET hire_date = ?1, updated_at = ?2 WHERE id = ?3",
                params![hire_date, ts, id],
            )
            .context("Failed to update hire date")?;
        }
        match &update.job_role_id {
            Some(Some(role_id)) if current.employee.job_role_id.as_deref() != Some(role_id) => {
                let code = self.generate_employee_code(role_id)?;
                tx.execute(
                    "UPDATE employees SET job_role_id = ?1, employee_code = ?2, updated_at = ?3 WHERE id = ?4",
                    params![role_id, code, ts, id],
                )
                .context("Failed to update job role")?;
            }
            Some(None) => {
                tx.execute(
                    "UPDATE employees SET job_role_id = NULL, employee_code = NULL, updated_at = ?1 WHERE id = ?2",
                    params![ts, id],
                )
                .context("Failed to clear job role")?;
            }
            _ => {}
        }

        tx.commit().context("Failed to commit employee update")?;
        self.get_employee(id)?
            .context("Employee not found after update")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engineering(db: &PortalDb) -> Result<JobRole> {
        db.create_job_role(&NewJobRole {
            code: " platform eng ".to_string(),
            name: "Platform Engineering".to_string(),
            employee_code_prefix: None,
        })
    }

    #[test]
    fn test_normalize_role_code() {
        assert_eq!(normalize_role_code("  software engineer "), "SOFTWARE_ENGINEER");
        assert_eq!(normalize_role_code("qa/test-lead 2"), "QATESTLEAD_2");
        assert_eq!(normalize_role_code("ops\t\tteam"), "OPS_TEAM");
        assert_eq!(normalize_role_code("***"), "");
    }

    #[test]
    fn test_invite_with_unknown_role_writes_nothing() -> Result<()> {
        let db = PortalDb::new_in_memory()?;
        let err = db
            .invite_employee("ghost@example.com", Some("Ghost"), Some(&new_id()), None)
            .unwrap_err();
        assert_eq!(err.to_string(), "Unknown job role");
        assert!(db.get_profile_by_email("ghost@example.com")?.is_none());
        assert!(db.list_employees()?.is_empty());

        let role = engineering(&db)?;
        let invited = db.invite_employee(
            "Ghost@Example.com",
            Some("Ghost"),
            Some(&role.id),
            Some("2026-03-01"),
        )?;
        assert_eq!(invited.email.as_deref(), Some("ghost@example.com"));
        assert_eq!(invited.employee.employee_code.as_deref(), Some("PLATFORM_ENG-0001"));
        Ok(())
    }

    #[test]
    fn test_upsert_profile_is_keyed_by_lowercase_email() -> Result<()> {
        let db = PortalDb::new_in_memory()?;
        let first = db.upsert_profile("  Erin@Example.com ", None, UserRole::Employee)?;
        assert_eq!(first.email.as_deref(), Some("erin@example.com"));
        assert!(!first.can_review);

        let second = db.upsert_profile("erin@example.com", Some("Erin"), UserRole::Reviewer)?;
        assert_eq!(second.id, first.id);
        assert_eq!(second.full_name.as_deref(), Some("Erin"));
        assert_eq!(second.user_role, UserRole::Employee);
        Ok(())
    }

    #[test]
    fn test_admin_membership_overrides_profile_role() -> Result<()> {
        let db = PortalDb::new_in_memory()?;
        let profile = db.upsert_profile("lead@example.com", None, UserRole::Reviewer)?;
        assert_eq!(db.effective_role(&profile)?, UserRole::Reviewer);
        db.grant_admin(&profile.id)?;
        db.grant_admin(&profile.id)?;
        assert!(db.is_admin(&profile.id)?);
        assert_eq!(db.effective_role(&profile)?, UserRole::Admin);
        Ok(())
    }

    #[test]
    fn test_magic_link_is_single_use() -> Result<()> {
        let db = PortalDb::new_in_memory()?;
        db.create_magic_link("hash-1", "Erin@example.com", "2999-01-01T00:00:00.000Z")?;
        assert_eq!(
            db.consume_magic_link("hash-1")?.as_deref(),
            Some("erin@example.com")
        );
        assert!(db.consume_magic_link("hash-1")?.is_none());
        assert!(db.consume_magic_link("missing")?.is_none());
        Ok(())
    }

    #[test]
    fn test_expired_magic_link_is_rejected() -> Result<()> {
        let db = PortalDb::new_in_memory()?;
        db.create_magic_link("old", "erin@example.com", "2000-01-01T00:00:00.000Z")?;
        assert!(db.consume_magic_link("old")?.is_none());
        Ok(())
    }

    #[test]
    fn test_sessions_expire_and_delete() -> Result<()> {
        let db = PortalDb::new_in_memory()?;
        let profile = db.upsert_profile("erin@example.com", None, UserRole::Employee)?;
        db.create_session("live", &profile.id, "2999-01-01T00:00:00.000Z")?;
        db.create_session("stale", &profile.id, "2000-01-01T00:00:00.000Z")?;

        assert_eq!(db.session_user("live")?.as_deref(), Some(profile.id.as_str()));
        assert!(db.session_user("stale")?.is_none());
        assert_eq!(db.purge_expired_sessions()?, 1);

        assert!(db.delete_session("live")?);
        assert!(db.session_user("live")?.is_none());
        Ok(())
    }

    #[test]
    fn test_job_role_crud() -> Result<()> {
        let db = PortalDb::new_in_memory()?;
        let role = engineering(&db)?;
        assert_eq!(role.code, "PLATFORM_ENG");
        assert!(db.get_job_role_by_code("platform eng")?.is_some());

        let dup = engineering(&db).unwrap_err();
        assert!(matches!(
            dup.downcast_ref::<PortalError>(),
            Some(PortalError::Conflict(_))
        ));

        let updated = db.update_job_role(
            "PLATFORM_ENG",
            &JobRoleUpdate {
                name: Some("Platform".to_string()),
                employee_code_prefix: Some(Some("plat".to_string())),
            },
        )?;
        assert_eq!(updated.name, "Platform");
        assert_eq!(updated.employee_code_prefix.as_deref(), Some("PLAT"));

        let cleared = db.update_job_role(
            "PLATFORM_ENG",
            &JobRoleUpdate {
                name: None,
                employee_code_prefix: Some(None),
            },
        )?;
        assert!(cleared.employee_code_prefix.is_none());

        db.delete_job_role("PLATFORM_ENG")?;
        assert!(db.list_job_roles()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_job_role_in_use_cannot_be_deleted() -> Result<()> {
        let db = PortalDb::new_in_memory()?;
        let role = engineering(&db)?;
        let profile = db.upsert_profile("erin@example.com", None, UserRole::Employee)?;
        db.ensure_employee(&profile.id, Some(&role.id), None)?;

        let err = db.delete_job_role(&role.code).unwrap_err();
        assert!(err.to_string().contains("in use"));
        Ok(())
    }

    #[test]
    fn test_employee_codes_are_sequential_per_prefix() -> Result<()> {
        let db = PortalDb::new_in_memory()?;
        let role = engineering(&db)?;
        assert_eq!(db.generate_employee_code(&role.id)?, "PLATFORM_ENG-0001");
        assert_eq!(db.generate_employee_code(&role.id)?, "PLATFORM_ENG-0002");
        Ok(())
    }

    #[test]
    fn test_ensure_employee_assigns_code_once() -> Result<()> {
        let db = PortalDb::new_in_memory()?;
        let role = engineering(&db)?;
        let profile = db.upsert_profile("erin@example.com", Some("Erin"), UserRole::Employee)?;

        let bare = db.ensure_employee(&profile.id, None, None)?;
        assert!(bare.employee.employee_code.is_none());

        let with_role = db.ensure_employee(&profile.id, Some(&role.id), Some("2024-03-04"))?;
        assert_eq!(with_role.employee.employee_code.as_deref(), Some("PLATFORM_ENG-0001"));
        assert_eq!(with_role.employee.hire_date.as_deref(), Some("2024-03-04"));
        assert_eq!(with_role.display_name(), "Erin");

        let again = db.ensure_employee(&profile.id, Some(&role.id), None)?;
        assert_eq!(again.employee.employee_code, with_role.employee.employee_code);
        Ok(())
    }

    #[test]
    fn test_update_employee_tri_state_fields() -> Result<()> {
        let db = PortalDb::new_in_memory()?;
        let role = engineering(&db)?;
        let other = db.create_job_role(&NewJobRole {
            code: "design".to_string(),
            name: "Design".to_string(),
            employee_code_prefix: Some("DSN".to_string()),
        })?;
        let profile = db.upsert_profile("erin@example.com", Some("Erin"), UserRole::Employee)?;
        db.ensure_employee(&profile.id, Some(&role.id), Some("2024-03-04"))?;

        let patch: EmployeeUpdate = serde_json::from_value(serde_json::json!({
            "job_role_id": other.id,
            "email": " ERIN.B@example.com ",
            "can_review": true
        }))?;
        let updated = db.update_employee(&profile.id, &patch)?;
        assert_eq!(updated.employee.employee_code.as_deref(), Some("DSN-0001"));
        assert_eq!(updated.email.as_deref(), Some("erin.b@example.com"));
        assert_eq!(updated.employee.hire_date.as_deref(), Some("2024-03-04"));
        assert!(db.get_profile(&profile.id)?.map(|p| p.can_review).unwrap_or(false));

        let clear: EmployeeUpdate =
            serde_json::from_value(serde_json::json!({"job_role_id": null, "hire_date": null}))?;
        let cleared = db.update_employee(&profile.id, &clear)?;
        assert!(cleared.employee.job_role_id.is_none());
        assert!(cleared.employee.employee_code.is_none());
        assert!(cleared.employee.hire_date.is_none());
        assert_eq!(cleared.full_name.as_deref(), Some("Erin"));
        Ok(())
    }

    #[test]
    fn test_update_employee_validation() -> Result<()> {
        let db = PortalDb::new_in_memory()?;
        let erin = db.upsert_profile("erin@example.com", Some("Erin"), UserRole::Employee)?;
        db.upsert_profile("sam@example.com", Some("Sam"), UserRole::Employee)?;
        db.ensure_employee(&erin.id, None, None)?;

        let blank = EmployeeUpdate {
            full_name: Some("   ".to_string()),
            ..Default::default()
        };
        assert!(db.update_employee(&erin.id, &blank).is_err());

        let taken = EmployeeUpdate {
            email: Some("sam@example.com".to_string()),
            ..Default::default()
        };
        let err = db.update_employee(&erin.id, &taken).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PortalError>(),
            Some(PortalError::Conflict(_))
        ));

        let missing = db.update_employee("nope", &EmployeeUpdate::default()).unwrap_err();
        assert!(matches!(
            missing.downcast_ref::<PortalError>(),
            Some(PortalError::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_employee_update_absent_vs_null() -> Result<()> {
        let absent: EmployeeUpdate = serde_json::from_str("{}")?;
        assert!(absent.is_empty());
        let null: EmployeeUpdate = serde_json::from_str(r#"{"hire_date": null}"#)?;
        assert_eq!(null.hire_date, Some(None));
        Ok(())
    }
}
