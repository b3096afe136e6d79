use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::params;
use serde::Deserialize;

use super::*;
use crate::errors::{PortalError, portal_err};

#[derive(Debug, Clone, Deserialize)]
pub struct NewCycle {
    pub name: String,
    pub start_date: String,
    pub end_date: String,
}

fn parse_date(raw: &str, field: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
        portal_err(PortalError::BadRequest(format!(
            "Invalid {} (expected YYYY-MM-DD)",
            field
        )))
    })
}

impl PortalDb {
    // ── Cycles ────────────────────────────────────────────────────────

    pub fn list_cycles(&self) -> Result<Vec<ReviewCycle>> {
        self.query_vec(
            &format!(
                "SELECT {} FROM review_cycles ORDER BY start_date DESC, created_at DESC",
                CYCLE_COLUMNS
            ),
            [],
            cycle_from_row,
            "cycles",
        )
    }

    pub fn get_cycle(&self, id: &str) -> Result<Option<ReviewCycle>> {
        self.query_opt(
            &format!("SELECT {} FROM review_cycles WHERE id = ?1", CYCLE_COLUMNS),
            params![id],
            cycle_from_row,
            "cycle",
        )
    }

    /// Create a draft cycle. The rubric mapping of the closest earlier cycle
    /// (by start date) is copied over.
    pub fn create_cycle(&self, input: &NewCycle, created_by: &str) -> Result<ReviewCycle> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(portal_err(PortalError::BadRequest(
                "Cycle name is required".to_string(),
            )));
        }
        let start = parse_date(&input.start_date, "start_date")?;
        let end = parse_date(&input.end_date, "end_date")?;
        if end < start {
            return Err(portal_err(PortalError::BadRequest(
                "end_date must not be before start_date".to_string(),
            )));
        }
        let start = start.format("%Y-%m-%d").to_string();
        let end = end.format("%Y-%m-%d").to_string();

        let previous: Option<String> = self.query_opt(
            "SELECT id FROM review_cycles WHERE start_date <= ?1
             ORDER BY start_date DESC, created_at DESC LIMIT 1",
            params![start],
            |row| row.get(0),
            "previous cycle",
        )?;

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let id = new_id();
        let ts = now();
        tx.execute(
            "INSERT INTO review_cycles (id, name, start_date, end_date, status, created_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![id, name, start, end, CycleStatus::Draft, created_by, ts],
        )
        .context("Failed to insert cycle")?;
        if let Some(prev) = &previous {
            tx.execute(
                "INSERT INTO cycle_rubrics (cycle_id, job_role_id, rubric_id)
                 SELECT ?1, job_role_id, rubric_id FROM cycle_rubrics WHERE cycle_id = ?2",
                params![id, prev],
            )
            .context("Failed to inherit rubric mapping")?;
        }
        tx.commit().context("Failed to commit cycle")?;

        self.get_cycle(&id)?.context("Cycle not found after insert")
    }

    /// Advance a cycle's status. Moving backwards is refused; the same status is a no-op.
    pub fn update_cycle_status(&self, id: &str, status: CycleStatus) -> Result<ReviewCycle> {
        let cycle = self
            .get_cycle(id)?
            .ok_or_else(|| portal_err(PortalError::NotFound("Cycle not found".to_string())))?;
        if status < cycle.status {
            return Err(portal_err(PortalError::Conflict(format!(
                "Cycle status cannot move from {} back to {}",
                cycle.status.as_str(),
                status.as_str()
            ))));
        }
        if status != cycle.status {
            self.conn
                .execute(
                    "UPDATE review_cycles SET status = ?1, updated_at = ?2 WHERE id = ?3",
                    params![status, now(), id],
                )
                .context("Failed to update cycle status")?;
        }
        self.get_cycle(id)?.context("Cycle not found after update")
    }

    // ── Rubrics ───────────────────────────────────────────────────────

    /// Create a rubric version for a job role. Earlier versions of the same
    /// role are marked inactive.
    pub fn create_rubric(
        &self,
        role_id: &str,
        version: &str,
        categories: &[NewRubricCategory],
    ) -> Result<RubricWithCategories> {
        if self.get_job_role(role_id)?.is_none() {
            return Err(portal_err(PortalError::BadRequest("Unknown job role".to_string())));
        }
        let version = version.trim();
        if version.is_empty() {
            return Err(portal_err(PortalError::BadRequest(
                "Rubric version is required".to_string(),
            )));
        }
        if categories.is_empty() {
            return Err(portal_err(PortalError::BadRequest(
                "A rubric needs at least one category".to_string(),
            )));
        }
        for category in categories {
            if category.code.trim().is_empty() || category.name.trim().is_empty() {
                return Err(portal_err(PortalError::BadRequest(
                    "Rubric categories need a code and a name".to_string(),
                )));
            }
            if !category.weight.is_finite() || category.weight < 0.0 {
                return Err(portal_err(PortalError::BadRequest(format!(
                    "Invalid weight for category {}",
                    category.code.trim()
                ))));
            }
        }
        let duplicate: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM rubrics WHERE role_id = ?1 AND version = ?2",
                params![role_id, version],
                |row| row.get(0),
            )
            .context("Failed to check rubric version")?;
        if duplicate > 0 {
            return Err(portal_err(PortalError::Conflict(format!(
                "Rubric version {} already exists for this job role",
                version
            ))));
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let id = new_id();
        tx.execute(
            "UPDATE rubrics SET is_active = 0 WHERE role_id = ?1",
            params![role_id],
        )
        .context("Failed to retire previous rubrics")?;
        tx.execute(
            "INSERT INTO rubrics (id, role_id, version, is_active, created_at) VALUES (?1, ?2, ?3, 1, ?4)",
            params![id, role_id, version, now()],
        )
        .context("Failed to insert rubric")?;
        for (idx, category) in categories.iter().enumerate() {
            tx.execute(
                "INSERT INTO rubric_categories (id, rubric_id, code, name, description, weight, is_scored, sort_order)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    new_id(),
                    id,
                    category.code.trim(),
                    category.name.trim(),
                    category.description,
                    category.weight,
                    category.is_scored,
                    idx as i64,
                ],
            )
            .with_context(|| format!("Failed to insert rubric category {}", category.code))?;
        }
        tx.commit().context("Failed to commit rubric")?;

        self.get_rubric(&id)?.context("Rubric not found after insert")
    }

    pub fn get_rubric(&self, id: &str) -> Result<Option<RubricWithCategories>> {
        let rubric = self.query_opt(
            &format!("SELECT {} FROM rubrics WHERE id = ?1", RUBRIC_COLUMNS),
            params![id],
            rubric_from_row,
            "rubric",
        )?;
        match rubric {
            Some(rubric) => {
                let categories = self.rubric_categories(&rubric.id)?;
                Ok(Some(RubricWithCategories { rubric, categories }))
            }
            None => Ok(None),
        }
    }

    pub fn list_rubrics(&self, role_id: Option<&str>) -> Result<Vec<RubricWithCategories>> {
        let rubrics = self.query_vec(
            &format!(
                "SELECT {} FROM rubrics WHERE ?1 IS NULL OR role_id = ?1
                 ORDER BY role_id, created_at DESC",
                RUBRIC_COLUMNS
            ),
            params![role_id],
            rubric_from_row,
            "rubrics",
        )?;
        rubrics
            .into_iter()
            .map(|rubric| {
                let categories = self.rubric_categories(&rubric.id)?;
                Ok(RubricWithCategories { rubric, categories })
            })
            .collect()
    }

    pub fn rubric_categories(&self, rubric_id: &str) -> Result<Vec<RubricCategory>> {
        self.query_vec(
            &format!(
                "SELECT {} FROM rubric_categories rc WHERE rc.rubric_id = ?1 ORDER BY rc.sort_order, rc.code",
                CATEGORY_COLUMNS
            ),
            params![rubric_id],
            category_from_row,
            "rubric categories",
        )
    }

    // ── Cycle → rubric mapping ────────────────────────────────────────

    pub fn list_cycle_rubrics(&self, cycle_id: &str) -> Result<Vec<CycleRubric>> {
        self.query_vec(
            "SELECT cycle_id, job_role_id, rubric_id FROM cycle_rubrics WHERE cycle_id = ?1 ORDER BY job_role_id",
            params![cycle_id],
            |row| {
                Ok(CycleRubric {
                    cycle_id: row.get(0)?,
                    job_role_id: row.get(1)?,
                    rubric_id: row.get(2)?,
                })
            },
            "cycle rubrics",
        )
    }

    /// Map (or with `None`, unmap) the rubric used for a job role in a cycle.
    pub fn set_cycle_rubric(
        &self,
        cycle_id: &str,
        job_role_id: &str,
        rubric_id: Option<&str>,
    ) -> Result<()> {
        if self.get_cycle(cycle_id)?.is_none() {
            return Err(portal_err(PortalError::NotFound("Cycle not found".to_string())));
        }
        if self.get_job_role(job_role_id)?.is_none() {
            return Err(portal_err(PortalError::BadRequest("Unknown job role".to_string())));
        }
        match rubric_id {
            Some(rubric_id) => {
                let rubric = self.get_rubric(rubric_id)?.ok_or_else(|| {
                    portal_err(PortalError::BadRequest("Unknown rubric".to_string()))
                })?;
                if rubric.rubric.role_id != job_role_id {
                    return Err(portal_err(PortalError::BadRequest(
                        "Rubric belongs to a different job role".to_string(),
                    )));
                }
                self.conn
                    .execute(
                        "INSERT INTO cycle_rubrics (cycle_id, job_role_id, rubric_id) VALUES (?1, ?2, ?3)
                         ON CONFLICT(cycle_id, job_role_id) DO UPDATE SET rubric_id = excluded.rubric_id",
                        params![cycle_id, job_role_id, rubric_id],
                    )
                    .context("Failed to map cycle rubric")?;
            }
            None => {
                self.conn
                    .execute(
                        "DELETE FROM cycle_rubrics WHERE cycle_id = ?1 AND job_role_id = ?2",
                        params![cycle_id, job_role_id],
                    )
                    .context("Failed to unmap cycle rubric")?;
            }
        }
        Ok(())
    }

    /// Categories of the rubric mapped to the employee's job role in the cycle.
    /// Empty when the employee has no role or the role has no mapping.
    pub fn categories_for_employee(
        &self,
        cycle_id: &str,
        employee_id: &str,
    ) -> Result<Vec<RubricCategory>> {
        self.query_vec(
            &format!(
                "SELECT {} FROM rubric_categories rc
                 JOIN cycle_rubrics cr ON cr.rubric_id = rc.rubric_id
                 JOIN employees e ON e.job_role_id = cr.job_role_id
                 WHERE cr.cycle_id = ?1 AND e.id = ?2
                 ORDER BY rc.sort_order, rc.code",
                CATEGORY_COLUMNS
            ),
            params![cycle_id, employee_id],
            category_from_row,
            "employee rubric categories",
        )
    }
}
