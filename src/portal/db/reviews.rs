use anyhow::{Context, Result};
use rusqlite::{params, params_from_iter};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::*;
use crate::errors::{PortalError, portal_err};
use crate::portal::assignments::{self, ReviewerSelection};
use crate::portal::lifecycle;

/// Narrative save request. Absent text fields keep their stored value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NarrativeUpdate {
    /// Employee-visible narrative.
    #[serde(default, alias = "summary_employee_visible")]
    pub narrative: Option<String>,
    #[serde(default)]
    pub summary_reviewer_private: Option<String>,
    #[serde(default)]
    pub submit: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub cycle_id: String,
    pub employee_id: String,
    #[serde(default)]
    pub calibration_adjustment: Option<f64>,
    #[serde(default)]
    pub calibration_reason: Option<String>,
    #[serde(default)]
    pub final_narrative: Option<String>,
}

fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

impl PortalDb {
    // ── Assignments ───────────────────────────────────────────────────

    pub fn get_assignment(&self, id: &str) -> Result<Option<ReviewAssignment>> {
        self.query_opt(
            &format!("SELECT {} FROM review_assignments WHERE id = ?1", ASSIGNMENT_COLUMNS),
            params![id],
            assignment_from_row,
            "assignment",
        )
    }

    fn active_assignment(&self, id: &str) -> Result<ReviewAssignment> {
        let assignment = self
            .get_assignment(id)?
            .ok_or_else(|| portal_err(PortalError::NotFound("Assignment not found".to_string())))?;
        if !assignment.is_active {
            return Err(portal_err(PortalError::Conflict(
                "Assignment is no longer active".to_string(),
            )));
        }
        Ok(assignment)
    }

    pub fn list_assignments_for_cycle(&self, cycle_id: &str) -> Result<Vec<ReviewAssignment>> {
        self.query_vec(
            &format!(
                "SELECT {} FROM review_assignments WHERE cycle_id = ?1
                 ORDER BY employee_id, reviewer_type, reviewer_id",
                ASSIGNMENT_COLUMNS
            ),
            params![cycle_id],
            assignment_from_row,
            "cycle assignments",
        )
    }

    /// Every assignment (active or not) for one employee in one cycle.
    pub fn list_assignments_for_employee(
        &self,
        cycle_id: &str,
        employee_id: &str,
    ) -> Result<Vec<ReviewAssignment>> {
        self.query_vec(
            &format!(
                "SELECT {} FROM review_assignments WHERE cycle_id = ?1 AND employee_id = ?2
                 ORDER BY reviewer_type, reviewer_id",
                ASSIGNMENT_COLUMNS
            ),
            params![cycle_id, employee_id],
            assignment_from_row,
            "employee assignments",
        )
    }

    /// Active assignments where `reviewer_id` is the reviewer, within the given cycles.
    pub fn list_reviewer_assignments(
        &self,
        reviewer_id: &str,
        cycle_ids: &[String],
    ) -> Result<Vec<ReviewAssignment>> {
        if cycle_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM review_assignments
             WHERE reviewer_id = ?1 AND is_active = 1 AND cycle_id IN ({})
             ORDER BY cycle_id, reviewer_type, employee_id",
            ASSIGNMENT_COLUMNS,
            placeholders(2, cycle_ids.len())
        );
        let values: Vec<&str> = std::iter::once(reviewer_id)
            .chain(cycle_ids.iter().map(String::as_str))
            .collect();
        self.query_vec(&sql, params_from_iter(values), assignment_from_row, "reviewer assignments")
    }

    /// Replace the reviewer set of one employee in one cycle.
    ///
    /// Runs in a single transaction: dropped (type, reviewer) pairs are
    /// deactivated, kept ones are upserted and re-activated, and a draft review
    /// is created for any assignment that has none. Returns the active set.
    pub fn save_assignments(
        &self,
        selection: &ReviewerSelection,
        actor: &str,
    ) -> Result<Vec<ReviewAssignment>> {
        let cycle = self
            .get_cycle(&selection.cycle_id)?
            .ok_or_else(|| portal_err(PortalError::NotFound("Cycle not found".to_string())))?;
        if !cycle.status.is_open() {
            return Err(portal_err(PortalError::Conflict(
                "Cannot change assignments of a finalized cycle".to_string(),
            )));
        }
        if self.get_employee(&selection.employee_id)?.is_none() {
            return Err(portal_err(PortalError::NotFound("Employee not found".to_string())));
        }

        let desired = assignments::desired_set(selection).map_err(portal_err)?;
        for d in desired.iter().filter(|d| d.reviewer_type != ReviewerType::SelfReview) {
            if d.reviewer_id == selection.employee_id {
                return Err(portal_err(PortalError::BadRequest(format!(
                    "An employee cannot be their own {} reviewer",
                    d.reviewer_type
                ))));
            }
            match self.get_profile(&d.reviewer_id)? {
                Some(p) if p.is_active => {}
                _ => {
                    return Err(portal_err(PortalError::BadRequest(format!(
                        "Unknown or inactive {} reviewer",
                        d.reviewer_type
                    ))));
                }
            }
        }

        let existing =
            self.list_assignments_for_employee(&selection.cycle_id, &selection.employee_id)?;
        let plan = assignments::plan(desired, &existing);

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let ts = now();

        for id in &plan.deactivate {
            tx.execute(
                "UPDATE review_assignments SET is_active = 0, updated_at = ?1 WHERE id = ?2",
                params![ts, id],
            )
            .context("Failed to deactivate assignment")?;
        }

        for d in &plan.upsert {
            let assignment_id: String = tx
                .query_row(
                    "INSERT INTO review_assignments
                        (id, cycle_id, employee_id, reviewer_id, reviewer_type, is_active, is_required, created_by, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7, ?8, ?8)
                     ON CONFLICT(cycle_id, employee_id, reviewer_id, reviewer_type)
                     DO UPDATE SET is_active = 1, is_required = excluded.is_required, updated_at = excluded.updated_at
                     RETURNING id",
                    params![
                        new_id(),
                        selection.cycle_id,
                        selection.employee_id,
                        d.reviewer_id,
                        d.reviewer_type,
                        d.is_required,
                        actor,
                        ts,
                    ],
                    |row| row.get(0),
                )
                .with_context(|| format!("Failed to upsert {} assignment", d.reviewer_type))?;

            tx.execute(
                "INSERT INTO reviews
                    (id, assignment_id, cycle_id, employee_id, reviewer_id, reviewer_type, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                 ON CONFLICT(assignment_id) DO NOTHING",
                params![
                    new_id(),
                    assignment_id,
                    selection.cycle_id,
                    selection.employee_id,
                    d.reviewer_id,
                    d.reviewer_type,
                    ReviewStatus::Draft,
                    ts,
                ],
            )
            .context("Failed to create draft review")?;
        }

        tx.commit().context("Failed to commit assignments")?;
        info!(
            cycle_id = %selection.cycle_id,
            employee_id = %selection.employee_id,
            active = plan.upsert.len(),
            deactivated = plan.deactivate.len(),
            "Saved reviewer assignments"
        );

        Ok(self
            .list_assignments_for_employee(&selection.cycle_id, &selection.employee_id)?
            .into_iter()
            .filter(|a| a.is_active)
            .collect())
    }

    // ── Reviews ───────────────────────────────────────────────────────

    pub fn get_review(&self, id: &str) -> Result<Option<Review>> {
        self.query_opt(
            &format!("SELECT {} FROM reviews WHERE id = ?1", REVIEW_COLUMNS),
            params![id],
            review_from_row,
            "review",
        )
    }

    pub fn get_review_by_assignment(&self, assignment_id: &str) -> Result<Option<Review>> {
        self.query_opt(
            &format!("SELECT {} FROM reviews WHERE assignment_id = ?1", REVIEW_COLUMNS),
            params![assignment_id],
            review_from_row,
            "review by assignment",
        )
    }

    pub fn list_reviews_for_reviewer(
        &self,
        reviewer_id: &str,
        cycle_ids: &[String],
    ) -> Result<Vec<Review>> {
        if cycle_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM reviews WHERE reviewer_id = ?1 AND cycle_id IN ({})",
            REVIEW_COLUMNS,
            placeholders(2, cycle_ids.len())
        );
        let values: Vec<&str> = std::iter::once(reviewer_id)
            .chain(cycle_ids.iter().map(String::as_str))
            .collect();
        self.query_vec(&sql, params_from_iter(values), review_from_row, "reviewer reviews")
    }

    /// All reviews written about an employee, across cycles.
    pub fn list_reviews_for_employee(&self, employee_id: &str) -> Result<Vec<Review>> {
        self.query_vec(
            &format!(
                "SELECT {} FROM reviews WHERE employee_id = ?1 ORDER BY cycle_id, reviewer_type",
                REVIEW_COLUMNS
            ),
            params![employee_id],
            review_from_row,
            "employee reviews",
        )
    }

    pub fn get_score(&self, review_id: &str) -> Result<Option<ReviewScore>> {
        self.query_opt(
            &format!("SELECT {} FROM review_scores WHERE review_id = ?1", SCORE_COLUMNS),
            params![review_id],
            score_from_row,
            "review score",
        )
    }

    /// Review row for an assignment, created as a draft if missing.
    fn ensure_review(&self, assignment: &ReviewAssignment) -> Result<Review> {
        let ts = now();
        self.conn
            .execute(
                "INSERT INTO reviews
                    (id, assignment_id, cycle_id, employee_id, reviewer_id, reviewer_type, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                 ON CONFLICT(assignment_id) DO NOTHING",
                params![
                    new_id(),
                    assignment.id,
                    assignment.cycle_id,
                    assignment.employee_id,
                    assignment.reviewer_id,
                    assignment.reviewer_type,
                    ReviewStatus::Draft,
                    ts,
                ],
            )
            .context("Failed to create review")?;
        self.get_review_by_assignment(&assignment.id)?
            .context("Review not found after insert")
    }

    /// Save (and optionally submit) the narrative of an assignment's review.
    pub fn save_narrative(&self, assignment_id: &str, update: &NarrativeUpdate) -> Result<Review> {
        let assignment = self.active_assignment(assignment_id)?;
        let existing = self.get_review_by_assignment(assignment_id)?;
        let status = lifecycle::next_status(existing.as_ref().map(|r| r.status), update.submit)
            .map_err(portal_err)?;

        let visible = update
            .narrative
            .clone()
            .or_else(|| existing.as_ref().and_then(|r| r.summary_employee_visible.clone()));
        let private = update
            .summary_reviewer_private
            .clone()
            .or_else(|| existing.as_ref().and_then(|r| r.summary_reviewer_private.clone()));

        if update.submit {
            let categories =
                self.categories_for_employee(&assignment.cycle_id, &assignment.employee_id)?;
            let score = match &existing {
                Some(review) => self.get_score(&review.id)?,
                None => None,
            };
            lifecycle::ensure_submittable(
                visible.as_deref().unwrap_or(""),
                assignment.reviewer_type,
                &categories,
                score.as_ref().map(|s| &s.category_scores),
            )
            .map_err(portal_err)?;
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let review = self.ensure_review(&assignment)?;
        let ts = now();
        let submitted_at = update.submit.then(|| ts.clone());
        tx.execute(
            "UPDATE reviews SET summary_employee_visible = ?1, summary_reviewer_private = ?2,
                    status = ?3, submitted_at = COALESCE(?4, submitted_at), updated_at = ?5
             WHERE id = ?6",
            params![visible, private, status, submitted_at, ts, review.id],
        )
        .context("Failed to save narrative")?;
        tx.commit().context("Failed to commit narrative")?;

        if update.submit {
            info!(review_id = %review.id, assignment_id, "Review submitted");
        }
        self.get_review(&review.id)?
            .context("Review not found after update")
    }

    /// Save draft category scores. Only the primary reviewer scores.
    pub fn save_scores(
        &self,
        assignment_id: &str,
        raw: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<ReviewScore> {
        let assignment = self.active_assignment(assignment_id)?;
        lifecycle::ensure_can_score(assignment.reviewer_type).map_err(portal_err)?;
        let existing = self.get_review_by_assignment(assignment_id)?;
        lifecycle::ensure_writable(existing.as_ref().map(|r| r.status)).map_err(portal_err)?;

        let categories =
            self.categories_for_employee(&assignment.cycle_id, &assignment.employee_id)?;
        let scores = lifecycle::normalize_scores(raw, &categories).map_err(portal_err)?;
        let encoded = serde_json::to_string(&scores).context("Failed to encode scores")?;

        let review = self.ensure_review(&assignment)?;
        self.conn
            .execute(
                "INSERT INTO review_scores (review_id, category_scores, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(review_id) DO UPDATE SET category_scores = excluded.category_scores, updated_at = excluded.updated_at",
                params![review.id, encoded, now()],
            )
            .context("Failed to save scores")?;
        self.get_score(&review.id)?
            .context("Score not found after save")
    }

    /// Toggle whether the employee may read this review's narrative once released.
    pub fn set_narrative_share(&self, assignment_id: &str, share: bool) -> Result<Review> {
        let review = self
            .get_review_by_assignment(assignment_id)?
            .ok_or_else(|| portal_err(PortalError::NotFound("Review not found".to_string())))?;
        let summary = self.get_summary(&review.cycle_id, &review.employee_id)?;
        lifecycle::ensure_share_allowed(
            review.status,
            summary.as_ref().and_then(|s| s.released_at.as_deref()),
        )
        .map_err(portal_err)?;

        self.conn
            .execute(
                "UPDATE reviews SET narrative_share_with_employee = ?1, updated_at = ?2 WHERE id = ?3",
                params![share, now(), review.id],
            )
            .context("Failed to update narrative sharing")?;
        info!(review_id = %review.id, share, "Narrative sharing changed");
        self.get_review(&review.id)?
            .context("Review not found after update")
    }

    /// Send a submitted review back to draft. Refused once the employee's
    /// cycle summary is released.
    pub fn reopen_review(&self, review_id: &str, actor: &str) -> Result<Review> {
        let review = self
            .get_review(review_id)?
            .ok_or_else(|| portal_err(PortalError::NotFound("Review not found".to_string())))?;
        let summary = self.get_summary(&review.cycle_id, &review.employee_id)?;
        lifecycle::ensure_reopenable(
            review.status,
            summary.as_ref().and_then(|s| s.released_at.as_deref()),
        )
        .map_err(portal_err)?;

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "UPDATE reviews SET status = ?1, submitted_at = NULL, finalized_at = NULL, updated_at = ?2
             WHERE id = ?3",
            params![ReviewStatus::Draft, now(), review.id],
        )
        .context("Failed to reopen review")?;
        if review.reviewer_type == ReviewerType::Primary {
            // The finalized summary was computed from the review being reopened.
            tx.execute(
                "UPDATE cycle_employee_summary SET finalized_at = NULL, updated_at = ?1
                 WHERE cycle_id = ?2 AND employee_id = ?3 AND released_at IS NULL",
                params![now(), review.cycle_id, review.employee_id],
            )
            .context("Failed to unfinalize cycle summary")?;
        }
        self.record_audit(
            "review_reopened",
            "review",
            &review.id,
            actor,
            Some(&json!({"status": review.status.as_str()})),
            Some(&json!({"status": ReviewStatus::Draft.as_str()})),
        )?;
        tx.commit().context("Failed to commit reopen")?;

        info!(review_id = %review.id, actor, "Review reopened");
        self.get_review(&review.id)?
            .context("Review not found after reopen")
    }

    // ── Calibration & release ─────────────────────────────────────────

    pub fn get_summary(
        &self,
        cycle_id: &str,
        employee_id: &str,
    ) -> Result<Option<CycleEmployeeSummary>> {
        self.query_opt(
            &format!(
                "SELECT {} FROM cycle_employee_summary WHERE cycle_id = ?1 AND employee_id = ?2",
                SUMMARY_COLUMNS
            ),
            params![cycle_id, employee_id],
            summary_from_row,
            "cycle summary",
        )
    }

    pub fn list_summaries_for_cycle(&self, cycle_id: &str) -> Result<Vec<CycleEmployeeSummary>> {
        self.query_vec(
            &format!(
                "SELECT {} FROM cycle_employee_summary WHERE cycle_id = ?1 ORDER BY employee_id",
                SUMMARY_COLUMNS
            ),
            params![cycle_id],
            summary_from_row,
            "cycle summaries",
        )
    }

    pub fn list_summaries_for_employee(
        &self,
        employee_id: &str,
    ) -> Result<Vec<CycleEmployeeSummary>> {
        self.query_vec(
            &format!(
                "SELECT {} FROM cycle_employee_summary WHERE employee_id = ?1
                 ORDER BY COALESCE(released_at, computed_at) DESC",
                SUMMARY_COLUMNS
            ),
            params![employee_id],
            summary_from_row,
            "employee summaries",
        )
    }

    /// The submitted review of the employee's active primary reviewer.
    fn submitted_primary_review(&self, cycle_id: &str, employee_id: &str) -> Result<Review> {
        let review = self.query_opt(
            &format!(
                "SELECT {} FROM reviews WHERE assignment_id = (
                    SELECT a.id FROM review_assignments a
                    WHERE a.cycle_id = ?1 AND a.employee_id = ?2
                      AND a.reviewer_type = 'primary' AND a.is_active = 1
                    ORDER BY a.updated_at DESC LIMIT 1)",
                REVIEW_COLUMNS
            ),
            params![cycle_id, employee_id],
            review_from_row,
            "primary review",
        )?;
        match review {
            Some(r) if r.status.is_locked() => Ok(r),
            Some(_) => Err(portal_err(PortalError::Conflict(
                "Primary review must be submitted first".to_string(),
            ))),
            None => Err(portal_err(PortalError::BadRequest(
                "No active primary review for this employee and cycle".to_string(),
            ))),
        }
    }

    /// Compute and store the employee's cycle summary. Caller owns the transaction.
    fn write_summary(
        &self,
        request: &FinalizeRequest,
        actor: &str,
    ) -> Result<CycleEmployeeSummary> {
        let adjustment = request.calibration_adjustment.unwrap_or(0.0);
        if !adjustment.is_finite() {
            return Err(portal_err(PortalError::BadRequest(
                "Invalid calibration adjustment".to_string(),
            )));
        }
        let primary = self.submitted_primary_review(&request.cycle_id, &request.employee_id)?;
        let categories = self.categories_for_employee(&request.cycle_id, &request.employee_id)?;
        let scores = self
            .get_score(&primary.id)?
            .map(|s| s.category_scores)
            .unwrap_or_default();

        let base = lifecycle::weighted_score(&categories, &scores);
        let final_score = base.map(|b| lifecycle::final_score(b, adjustment));
        let rating = final_score.map(PerformanceRating::from_score);
        let narrative = request
            .final_narrative
            .clone()
            .filter(|n| !n.trim().is_empty())
            .or_else(|| primary.summary_employee_visible.clone());
        let reason = request
            .calibration_reason
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty());
        let ts = now();

        self.conn
            .execute(
                "INSERT INTO cycle_employee_summary
                    (id, cycle_id, employee_id, primary_review_id, primary_final_score, performance_rating,
                     performance_rating_value, calibration_adjustment, calibration_reason,
                     final_narrative_employee_visible, computed_by, computed_at, finalized_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12, ?12, ?12)
                 ON CONFLICT(cycle_id, employee_id) DO UPDATE SET
                    primary_review_id = excluded.primary_review_id,
                    primary_final_score = excluded.primary_final_score,
                    performance_rating = excluded.performance_rating,
                    performance_rating_value = excluded.performance_rating_value,
                    calibration_adjustment = excluded.calibration_adjustment,
                    calibration_reason = excluded.calibration_reason,
                    final_narrative_employee_visible = excluded.final_narrative_employee_visible,
                    computed_by = excluded.computed_by,
                    computed_at = excluded.computed_at,
                    finalized_at = excluded.finalized_at,
                    updated_at = excluded.updated_at",
                params![
                    new_id(),
                    request.cycle_id,
                    request.employee_id,
                    primary.id,
                    final_score,
                    rating,
                    rating.map(|r| r.value()),
                    adjustment,
                    reason,
                    narrative,
                    actor,
                    ts,
                ],
            )
            .context("Failed to write cycle summary")?;

        self.conn
            .execute(
                "INSERT INTO review_scores (review_id, category_scores, base_score, calibration_adjustment, final_score, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(review_id) DO UPDATE SET base_score = excluded.base_score,
                    calibration_adjustment = excluded.calibration_adjustment,
                    final_score = excluded.final_score, updated_at = excluded.updated_at",
                params![
                    primary.id,
                    serde_json::to_string(&scores).context("Failed to encode scores")?,
                    base,
                    adjustment,
                    final_score,
                    ts,
                ],
            )
            .context("Failed to store derived scores")?;

        let summary = self
            .get_summary(&request.cycle_id, &request.employee_id)?
            .context("Summary not found after write")?;
        self.record_audit(
            "summary_finalized",
            "cycle_employee_summary",
            &summary.id,
            actor,
            None,
            Some(&json!({
                "primary_final_score": summary.primary_final_score,
                "performance_rating": summary.performance_rating,
                "calibration_adjustment": summary.calibration_adjustment,
            })),
        )?;
        Ok(summary)
    }

    /// Calibrate and finalize an employee's cycle summary.
    pub fn finalize_employee_cycle_summary(
        &self,
        request: &FinalizeRequest,
        actor: &str,
    ) -> Result<CycleEmployeeSummary> {
        if self.get_cycle(&request.cycle_id)?.is_none() {
            return Err(portal_err(PortalError::NotFound("Cycle not found".to_string())));
        }
        if let Some(existing) = self.get_summary(&request.cycle_id, &request.employee_id)?
            && existing.is_released()
        {
            return Err(portal_err(PortalError::Conflict(
                "Summary is already released".to_string(),
            )));
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let summary = self.write_summary(request, actor)?;
        tx.commit().context("Failed to commit summary")?;

        info!(
            cycle_id = %request.cycle_id,
            employee_id = %request.employee_id,
            final_score = ?summary.primary_final_score,
            "Cycle summary finalized"
        );
        Ok(summary)
    }

    /// Release an employee's cycle results. Finalizes a default summary when
    /// none exists. Releasing twice is a no-op reported as `already_released`.
    pub fn release_employee_cycle(
        &self,
        cycle_id: &str,
        employee_id: &str,
        actor: &str,
    ) -> Result<ReleaseOutcome> {
        if self.get_cycle(cycle_id)?.is_none() {
            return Err(portal_err(PortalError::NotFound("Cycle not found".to_string())));
        }
        let existing = self.get_summary(cycle_id, employee_id)?;
        if let Some(summary) = existing.as_ref().filter(|s| s.is_released()) {
            return Ok(ReleaseOutcome {
                summary: summary.clone(),
                already_released: true,
            });
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        self.submitted_primary_review(cycle_id, employee_id)?;
        if existing.as_ref().and_then(|s| s.finalized_at.as_ref()).is_none() {
            self.write_summary(
                &FinalizeRequest {
                    cycle_id: cycle_id.to_string(),
                    employee_id: employee_id.to_string(),
                    ..Default::default()
                },
                actor,
            )?;
        }
        let ts = now();
        self.conn
            .execute(
                "UPDATE cycle_employee_summary SET released_at = ?1, released_by = ?2, updated_at = ?1
                 WHERE cycle_id = ?3 AND employee_id = ?4 AND released_at IS NULL",
                params![ts, actor, cycle_id, employee_id],
            )
            .context("Failed to release summary")?;
        let summary = self
            .get_summary(cycle_id, employee_id)?
            .context("Summary not found after release")?;
        self.record_audit(
            "employee_cycle_released",
            "cycle_employee_summary",
            &summary.id,
            actor,
            None,
            Some(&json!({"released_at": summary.released_at})),
        )?;
        tx.commit().context("Failed to commit release")?;

        info!(cycle_id, employee_id, actor, "Employee cycle released");
        Ok(ReleaseOutcome {
            summary,
            already_released: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{Seed, seed};
    use super::*;

    fn select(s: &Seed, primary: &str, secondary: Option<&str>, peers: &[&str]) -> ReviewerSelection {
        ReviewerSelection {
            cycle_id: s.cycle.id.clone(),
            employee_id: s.employee.id.clone(),
            primary_reviewer_id: Some(primary.to_string()),
            secondary_reviewer_id: secondary.map(String::from),
            peer_reviewer_ids: peers.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn extra_reviewer(db: &PortalDb, email: &str) -> Result<Profile> {
        db.upsert_profile(email, None, UserRole::Reviewer)
    }

    fn primary_assignment(db: &PortalDb, s: &Seed) -> Result<ReviewAssignment> {
        let active = db.save_assignments(&select(s, &s.reviewer_a.id, None, &[]), &s.admin.id)?;
        active
            .into_iter()
            .find(|a| a.reviewer_type == ReviewerType::Primary)
            .context("primary assignment missing")
    }

    fn score_map(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn submit_primary(db: &PortalDb, s: &Seed, delivery: f64, craft: f64) -> Result<Review> {
        let assignment = primary_assignment(db, s)?;
        db.save_scores(
            &assignment.id,
            &score_map(json!({"delivery": delivery, "craft": craft})),
        )?;
        db.save_narrative(
            &assignment.id,
            &NarrativeUpdate {
                narrative: Some("Strong half".to_string()),
                summary_reviewer_private: None,
                submit: true,
            },
        )
    }

    fn portal_error(err: &anyhow::Error) -> Option<&PortalError> {
        err.downcast_ref::<PortalError>()
    }

    #[test]
    fn test_assignment_save_replaces_reviewer_set() -> Result<()> {
        let db = PortalDb::new_in_memory()?;
        let s = seed(&db)?;
        let c = extra_reviewer(&db, "carol@example.com")?;
        let d = extra_reviewer(&db, "dan@example.com")?;

        let first = db.save_assignments(
            &select(&s, &s.reviewer_a.id, Some(&s.reviewer_b.id), &[&c.id, &d.id]),
            &s.admin.id,
        )?;
        assert_eq!(first.len(), 5);

        let second =
            db.save_assignments(&select(&s, &s.reviewer_a.id, None, &[&c.id]), &s.admin.id)?;
        let mut active: Vec<(ReviewerType, String)> = second
            .iter()
            .map(|a| (a.reviewer_type, a.reviewer_id.clone()))
            .collect();
        active.sort();
        let mut expected = vec![
            (ReviewerType::SelfReview, s.employee.id.clone()),
            (ReviewerType::Primary, s.reviewer_a.id.clone()),
            (ReviewerType::Peer, c.id.clone()),
        ];
        expected.sort();
        assert_eq!(active, expected);

        let all = db.list_assignments_for_employee(&s.cycle.id, &s.employee.id)?;
        assert_eq!(all.len(), 5);
        let inactive: Vec<&str> = all
            .iter()
            .filter(|a| !a.is_active)
            .map(|a| a.reviewer_id.as_str())
            .collect();
        assert_eq!(inactive.len(), 2);
        assert!(inactive.contains(&s.reviewer_b.id.as_str()));
        assert!(inactive.contains(&d.id.as_str()));
        Ok(())
    }

    #[test]
    fn test_assignment_save_is_idempotent_and_keeps_review_status() -> Result<()> {
        let db = PortalDb::new_in_memory()?;
        let s = seed(&db)?;
        let review = submit_primary(&db, &s, 80.0, 60.0)?;
        assert_eq!(review.status, ReviewStatus::Submitted);

        let again = db.save_assignments(&select(&s, &s.reviewer_a.id, None, &[]), &s.admin.id)?;
        assert_eq!(again.len(), 2);
        let reloaded = db.get_review(&review.id)?.context("review missing")?;
        assert_eq!(reloaded.status, ReviewStatus::Submitted);

        let self_assignment = again
            .iter()
            .find(|a| a.reviewer_type == ReviewerType::SelfReview)
            .context("self assignment missing")?;
        assert!(self_assignment.is_required);
        assert!(db.get_review_by_assignment(&self_assignment.id)?.is_some());
        Ok(())
    }

    #[test]
    fn test_reactivated_assignment_keeps_its_row() -> Result<()> {
        let db = PortalDb::new_in_memory()?;
        let s = seed(&db)?;
        let first = db.save_assignments(
            &select(&s, &s.reviewer_a.id, Some(&s.reviewer_b.id), &[]),
            &s.admin.id,
        )?;
        let secondary_id = first
            .iter()
            .find(|a| a.reviewer_type == ReviewerType::Secondary)
            .map(|a| a.id.clone())
            .context("secondary missing")?;

        db.save_assignments(&select(&s, &s.reviewer_a.id, None, &[]), &s.admin.id)?;
        let back = db.save_assignments(
            &select(&s, &s.reviewer_a.id, Some(&s.reviewer_b.id), &[]),
            &s.admin.id,
        )?;
        assert!(back.iter().any(|a| a.id == secondary_id && a.is_active));
        Ok(())
    }

    #[test]
    fn test_assignment_save_validation() -> Result<()> {
        let db = PortalDb::new_in_memory()?;
        let s = seed(&db)?;

        let mut no_primary = select(&s, "", None, &[]);
        no_primary.primary_reviewer_id = None;
        let err = db.save_assignments(&no_primary, &s.admin.id).unwrap_err();
        assert!(matches!(portal_error(&err), Some(PortalError::BadRequest(_))));

        let err = db
            .save_assignments(&select(&s, &s.employee.id, None, &[]), &s.admin.id)
            .unwrap_err();
        assert!(err.to_string().contains("own primary"));

        let err = db
            .save_assignments(&select(&s, "ghost", None, &[]), &s.admin.id)
            .unwrap_err();
        assert!(err.to_string().contains("primary reviewer"));

        // Nothing was written by the failed attempts.
        assert!(db.list_assignments_for_cycle(&s.cycle.id)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_narrative_update_accepts_column_name() -> Result<()> {
        let update: NarrativeUpdate = serde_json::from_value(json!({
            "summary_employee_visible": "Shipped the billing rewrite",
            "submit": true,
        }))?;
        assert_eq!(update.narrative.as_deref(), Some("Shipped the billing rewrite"));
        assert!(update.submit);

        let db = PortalDb::new_in_memory()?;
        let s = seed(&db)?;
        let assignment = primary_assignment(&db, &s)?;
        db.save_scores(
            &assignment.id,
            &score_map(json!({"delivery": 70, "craft": 70})),
        )?;
        let review = db.save_narrative(&assignment.id, &update)?;
        assert_eq!(review.status, ReviewStatus::Submitted);
        Ok(())
    }

    #[test]
    fn test_submitted_review_is_locked_until_reopened() -> Result<()> {
        let db = PortalDb::new_in_memory()?;
        let s = seed(&db)?;
        let review = submit_primary(&db, &s, 90.0, 70.0)?;
        assert!(review.submitted_at.is_some());

        let err = db
            .save_narrative(
                &review.assignment_id,
                &NarrativeUpdate {
                    narrative: Some("edit".to_string()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "Review is submitted and locked");
        let err = db
            .save_scores(&review.assignment_id, &score_map(json!({"delivery": 10})))
            .unwrap_err();
        assert!(matches!(portal_error(&err), Some(PortalError::Conflict(_))));

        let reopened = db.reopen_review(&review.id, &s.admin.id)?;
        assert_eq!(reopened.status, ReviewStatus::Draft);
        assert!(reopened.submitted_at.is_none());
        let audit = db.list_audit("review", &review.id)?;
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].before_state, Some(json!({"status": "submitted"})));
        assert_eq!(audit[0].after_state, Some(json!({"status": "draft"})));

        let edited = db.save_narrative(
            &review.assignment_id,
            &NarrativeUpdate {
                summary_reviewer_private: Some("private".to_string()),
                ..Default::default()
            },
        )?;
        assert_eq!(edited.summary_employee_visible.as_deref(), Some("Strong half"));
        assert_eq!(edited.summary_reviewer_private.as_deref(), Some("private"));
        Ok(())
    }

    #[test]
    fn test_draft_review_cannot_be_reopened() -> Result<()> {
        let db = PortalDb::new_in_memory()?;
        let s = seed(&db)?;
        let assignment = primary_assignment(&db, &s)?;
        let review = db
            .get_review_by_assignment(&assignment.id)?
            .context("draft review missing")?;
        assert!(db.reopen_review(&review.id, &s.admin.id).is_err());
        Ok(())
    }

    #[test]
    fn test_submission_lists_missing_scores() -> Result<()> {
        let db = PortalDb::new_in_memory()?;
        let s = seed(&db)?;
        let assignment = primary_assignment(&db, &s)?;
        db.save_scores(&assignment.id, &score_map(json!({"delivery": 75})))?;

        let err = db
            .save_narrative(
                &assignment.id,
                &NarrativeUpdate {
                    narrative: Some("  ".to_string()),
                    submit: true,
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "Cannot submit yet. Missing: Narrative, Score: Craft");
        let review = db
            .get_review_by_assignment(&assignment.id)?
            .context("review missing")?;
        assert_eq!(review.status, ReviewStatus::Draft);
        Ok(())
    }

    #[test]
    fn test_scores_are_clamped_and_validated() -> Result<()> {
        let db = PortalDb::new_in_memory()?;
        let s = seed(&db)?;
        let assignment = primary_assignment(&db, &s)?;

        let saved = db.save_scores(
            &assignment.id,
            &score_map(json!({"delivery": 250, "craft": "not a number"})),
        )?;
        assert_eq!(saved.category_scores["delivery"], 100.0);
        assert_eq!(saved.category_scores["craft"], 0.0);

        let err = db
            .save_scores(&assignment.id, &score_map(json!({"charisma": 50})))
            .unwrap_err();
        assert!(err.to_string().contains("charisma"));
        Ok(())
    }

    #[test]
    fn test_only_primary_can_score() -> Result<()> {
        let db = PortalDb::new_in_memory()?;
        let s = seed(&db)?;
        let active = db.save_assignments(
            &select(&s, &s.reviewer_a.id, Some(&s.reviewer_b.id), &[]),
            &s.admin.id,
        )?;
        let secondary = active
            .iter()
            .find(|a| a.reviewer_type == ReviewerType::Secondary)
            .context("secondary missing")?;
        let err = db
            .save_scores(&secondary.id, &score_map(json!({"delivery": 50})))
            .unwrap_err();
        assert_eq!(err.to_string(), "Only primary can score");

        // Secondary reviewers submit narrative only.
        let review = db.save_narrative(
            &secondary.id,
            &NarrativeUpdate {
                narrative: Some("Helpful partner".to_string()),
                submit: true,
                ..Default::default()
            },
        )?;
        assert_eq!(review.status, ReviewStatus::Submitted);
        Ok(())
    }

    #[test]
    fn test_inactive_assignment_refuses_writes() -> Result<()> {
        let db = PortalDb::new_in_memory()?;
        let s = seed(&db)?;
        let active = db.save_assignments(
            &select(&s, &s.reviewer_a.id, Some(&s.reviewer_b.id), &[]),
            &s.admin.id,
        )?;
        let secondary_id = active
            .iter()
            .find(|a| a.reviewer_type == ReviewerType::Secondary)
            .map(|a| a.id.clone())
            .context("secondary missing")?;
        db.save_assignments(&select(&s, &s.reviewer_a.id, None, &[]), &s.admin.id)?;

        let err = db
            .save_narrative(&secondary_id, &NarrativeUpdate::default())
            .unwrap_err();
        assert!(matches!(portal_error(&err), Some(PortalError::Conflict(_))));
        Ok(())
    }

    #[test]
    fn test_share_toggle_window() -> Result<()> {
        let db = PortalDb::new_in_memory()?;
        let s = seed(&db)?;
        let assignment = primary_assignment(&db, &s)?;
        let err = db.set_narrative_share(&assignment.id, true).unwrap_err();
        assert!(err.to_string().contains("until review is submitted"));

        let review = submit_primary(&db, &s, 80.0, 80.0)?;
        let shared = db.set_narrative_share(&review.assignment_id, true)?;
        assert!(shared.narrative_share_with_employee);

        db.release_employee_cycle(&s.cycle.id, &s.employee.id, &s.admin.id)?;
        let err = db.set_narrative_share(&review.assignment_id, false).unwrap_err();
        assert!(err.to_string().contains("after cycle is released"));
        Ok(())
    }

    #[test]
    fn test_finalize_computes_weighted_rating() -> Result<()> {
        let db = PortalDb::new_in_memory()?;
        let s = seed(&db)?;
        // delivery weight 3, craft weight 1: (90*3 + 50) / 4 = 80
        submit_primary(&db, &s, 90.0, 50.0)?;

        let summary = db.finalize_employee_cycle_summary(
            &FinalizeRequest {
                cycle_id: s.cycle.id.clone(),
                employee_id: s.employee.id.clone(),
                calibration_adjustment: Some(6.0),
                calibration_reason: Some("Led the migration".to_string()),
                final_narrative: None,
            },
            &s.admin.id,
        )?;
        assert_eq!(summary.primary_final_score, Some(86.0));
        assert_eq!(summary.performance_rating, Some(PerformanceRating::Exceeds));
        assert_eq!(summary.performance_rating_value, Some(3));
        assert_eq!(summary.calibration_adjustment, 6.0);
        assert_eq!(summary.final_narrative_employee_visible.as_deref(), Some("Strong half"));
        assert!(summary.finalized_at.is_some());
        assert!(summary.released_at.is_none());

        let score = db
            .get_score(&summary.primary_review_id)?
            .context("score missing")?;
        assert_eq!(score.base_score, Some(80.0));
        assert_eq!(score.final_score, Some(86.0));
        Ok(())
    }

    #[test]
    fn test_finalize_requires_submitted_primary() -> Result<()> {
        let db = PortalDb::new_in_memory()?;
        let s = seed(&db)?;
        let request = FinalizeRequest {
            cycle_id: s.cycle.id.clone(),
            employee_id: s.employee.id.clone(),
            ..Default::default()
        };
        let err = db
            .finalize_employee_cycle_summary(&request, &s.admin.id)
            .unwrap_err();
        assert!(matches!(portal_error(&err), Some(PortalError::BadRequest(_))));

        primary_assignment(&db, &s)?;
        let err = db
            .finalize_employee_cycle_summary(&request, &s.admin.id)
            .unwrap_err();
        assert!(err.to_string().contains("must be submitted"));
        Ok(())
    }

    #[test]
    fn test_release_is_idempotent_and_terminal() -> Result<()> {
        let db = PortalDb::new_in_memory()?;
        let s = seed(&db)?;
        let review = submit_primary(&db, &s, 60.0, 60.0)?;

        let first = db.release_employee_cycle(&s.cycle.id, &s.employee.id, &s.admin.id)?;
        assert!(!first.already_released);
        let released_at = first.summary.released_at.clone();
        assert!(released_at.is_some());
        assert_eq!(first.summary.released_by.as_deref(), Some(s.admin.id.as_str()));
        assert_eq!(first.summary.performance_rating, Some(PerformanceRating::Meets));

        let second = db.release_employee_cycle(&s.cycle.id, &s.employee.id, &s.admin.id)?;
        assert!(second.already_released);
        assert_eq!(second.summary.released_at, released_at);

        assert!(db.reopen_review(&review.id, &s.admin.id).is_err());
        let finalize = db.finalize_employee_cycle_summary(
            &FinalizeRequest {
                cycle_id: s.cycle.id.clone(),
                employee_id: s.employee.id.clone(),
                ..Default::default()
            },
            &s.admin.id,
        );
        assert!(finalize.is_err());
        Ok(())
    }

    #[test]
    fn test_release_keeps_existing_calibration() -> Result<()> {
        let db = PortalDb::new_in_memory()?;
        let s = seed(&db)?;
        submit_primary(&db, &s, 50.0, 50.0)?;
        db.finalize_employee_cycle_summary(
            &FinalizeRequest {
                cycle_id: s.cycle.id.clone(),
                employee_id: s.employee.id.clone(),
                calibration_adjustment: Some(-10.0),
                final_narrative: Some("Calibrated narrative".to_string()),
                ..Default::default()
            },
            &s.admin.id,
        )?;
        let outcome = db.release_employee_cycle(&s.cycle.id, &s.employee.id, &s.admin.id)?;
        assert_eq!(outcome.summary.primary_final_score, Some(40.0));
        assert_eq!(
            outcome.summary.final_narrative_employee_visible.as_deref(),
            Some("Calibrated narrative")
        );
        Ok(())
    }

    #[test]
    fn test_release_after_reopen_uses_resubmitted_scores() -> Result<()> {
        let db = PortalDb::new_in_memory()?;
        let s = seed(&db)?;
        let review = submit_primary(&db, &s, 90.0, 90.0)?;
        let request = FinalizeRequest {
            cycle_id: s.cycle.id.clone(),
            employee_id: s.employee.id.clone(),
            ..Default::default()
        };
        let finalized = db.finalize_employee_cycle_summary(&request, &s.admin.id)?;
        assert_eq!(finalized.primary_final_score, Some(90.0));

        db.reopen_review(&review.id, &s.admin.id)?;
        let summary = db
            .get_summary(&s.cycle.id, &s.employee.id)?
            .context("summary missing")?;
        assert!(summary.finalized_at.is_none());

        db.save_scores(
            &review.assignment_id,
            &score_map(json!({"delivery": 10, "craft": 10})),
        )?;
        db.save_narrative(
            &review.assignment_id,
            &NarrativeUpdate {
                narrative: Some("Rough half".to_string()),
                summary_reviewer_private: None,
                submit: true,
            },
        )?;

        let outcome = db.release_employee_cycle(&s.cycle.id, &s.employee.id, &s.admin.id)?;
        assert!(!outcome.already_released);
        assert_eq!(outcome.summary.primary_final_score, Some(10.0));
        assert_eq!(
            outcome.summary.performance_rating,
            Some(PerformanceRating::NeedsDevelopment)
        );
        assert_eq!(
            outcome.summary.final_narrative_employee_visible.as_deref(),
            Some("Rough half")
        );
        assert!(outcome.summary.finalized_at.is_some());
        Ok(())
    }

    #[test]
    fn test_release_requires_submitted_primary() -> Result<()> {
        let db = PortalDb::new_in_memory()?;
        let s = seed(&db)?;
        primary_assignment(&db, &s)?;
        let err = db
            .release_employee_cycle(&s.cycle.id, &s.employee.id, &s.admin.id)
            .unwrap_err();
        assert!(matches!(portal_error(&err), Some(PortalError::Conflict(_))));
        assert!(db.get_summary(&s.cycle.id, &s.employee.id)?.is_none());
        Ok(())
    }

    #[test]
    fn test_reviewer_listings_follow_cycle_ids() -> Result<()> {
        let db = PortalDb::new_in_memory()?;
        let s = seed(&db)?;
        primary_assignment(&db, &s)?;
        let cycles = vec![s.cycle.id.clone()];
        assert_eq!(db.list_reviewer_assignments(&s.reviewer_a.id, &cycles)?.len(), 1);
        assert_eq!(db.list_reviews_for_reviewer(&s.reviewer_a.id, &cycles)?.len(), 1);
        assert!(db.list_reviewer_assignments(&s.reviewer_a.id, &[])?.is_empty());
        assert_eq!(db.list_reviews_for_employee(&s.employee.id)?.len(), 2);
        Ok(())
    }
}
