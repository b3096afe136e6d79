//! JSON view models for the portal pages.
//!
//! Each builder reads everything a page needs in one pass over the database
//! and computes the display state (badges, counts, labels, empty states)
//! server-side. Builders are synchronous and run inside `DbHandle::call`.

use std::collections::HashMap;

use anyhow::Result;
use serde::Serialize;

use super::cycles::{self, ACTIVE_CYCLE_SETTING, CycleResolution};
use super::db::PortalDb;
use super::lifecycle;
use super::models::*;
use crate::errors::{PortalError, portal_err};

pub const NO_ACTIVE_CYCLE: &str = "No active cycle is available";

/// Resolve the cycle(s) for a request from the stored cycles and setting.
pub fn resolve_for(
    db: &PortalDb,
    is_admin: bool,
    query_cycle_id: Option<&str>,
) -> Result<CycleResolution> {
    let all = db.list_cycles()?;
    let global = db.get_setting(ACTIVE_CYCLE_SETTING)?;
    Ok(cycles::resolve(&all, is_admin, query_cycle_id, global.as_deref()))
}

fn cycle_names(db: &PortalDb) -> Result<HashMap<String, String>> {
    Ok(db
        .list_cycles()?
        .into_iter()
        .map(|c| (c.id, c.name))
        .collect())
}

fn profile_names(db: &PortalDb) -> Result<HashMap<String, String>> {
    Ok(db
        .list_profiles()?
        .into_iter()
        .map(|p| {
            let name = p
                .full_name
                .clone()
                .or_else(|| p.email.clone())
                .unwrap_or_else(|| "Unknown".to_string());
            (p.id, name)
        })
        .collect())
}

// ── Reviewer inbox ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct InboxItem {
    pub assignment_id: String,
    pub cycle_id: String,
    pub cycle_name: String,
    pub employee_id: String,
    pub employee_name: String,
    pub reviewer_type: ReviewerType,
    pub review_id: Option<String>,
    pub status: ReviewStatus,
    pub submitted_at: Option<String>,
    pub is_released: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewerInbox {
    pub cycle: CycleResolution,
    pub items: Vec<InboxItem>,
    pub draft_count: usize,
    pub submitted_count: usize,
    pub empty_message: Option<String>,
}

pub fn reviewer_inbox(
    db: &PortalDb,
    reviewer_id: &str,
    cycle: CycleResolution,
) -> Result<ReviewerInbox> {
    if cycle.is_empty() {
        return Ok(ReviewerInbox {
            cycle,
            items: Vec::new(),
            draft_count: 0,
            submitted_count: 0,
            empty_message: Some(NO_ACTIVE_CYCLE.to_string()),
        });
    }

    let assignments = db.list_reviewer_assignments(reviewer_id, &cycle.cycle_ids_to_use)?;
    let reviews: HashMap<String, Review> = db
        .list_reviews_for_reviewer(reviewer_id, &cycle.cycle_ids_to_use)?
        .into_iter()
        .map(|r| (r.assignment_id.clone(), r))
        .collect();
    let cycle_names = cycle_names(db)?;
    let people = profile_names(db)?;

    let mut items = Vec::with_capacity(assignments.len());
    for a in assignments {
        let review = reviews.get(&a.id);
        let released = db
            .get_summary(&a.cycle_id, &a.employee_id)?
            .is_some_and(|s| s.is_released());
        items.push(InboxItem {
            cycle_name: cycle_names.get(&a.cycle_id).cloned().unwrap_or_default(),
            employee_name: people
                .get(&a.employee_id)
                .cloned()
                .unwrap_or_else(|| "Unknown".to_string()),
            review_id: review.map(|r| r.id.clone()),
            status: review.map(|r| r.status).unwrap_or(ReviewStatus::Draft),
            submitted_at: review.and_then(|r| r.submitted_at.clone()),
            is_released: released,
            assignment_id: a.id,
            cycle_id: a.cycle_id,
            employee_id: a.employee_id,
            reviewer_type: a.reviewer_type,
        });
    }
    items.sort_by(|a, b| {
        a.reviewer_type
            .cmp(&b.reviewer_type)
            .then_with(|| a.employee_name.cmp(&b.employee_name))
    });

    let submitted_count = items.iter().filter(|i| i.status.is_locked()).count();
    Ok(ReviewerInbox {
        cycle,
        draft_count: items.len() - submitted_count,
        submitted_count,
        empty_message: if items.is_empty() {
            Some("No reviews are assigned to you in this cycle".to_string())
        } else {
            None
        },
        items,
    })
}

// ── Review detail ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ReviewDetail {
    pub assignment: ReviewAssignment,
    pub cycle: Option<ReviewCycle>,
    pub employee_name: String,
    pub review: Option<Review>,
    pub score: Option<ReviewScore>,
    pub categories: Vec<RubricCategory>,
    pub is_released: bool,
    pub can_edit: bool,
    pub can_score: bool,
    pub can_toggle_share: bool,
    /// Items still missing before submission; empty once submittable.
    pub missing: Vec<String>,
}

/// Review form state. Visible to the assignment's reviewer and to admins.
pub fn review_detail(
    db: &PortalDb,
    viewer_id: &str,
    viewer_is_admin: bool,
    assignment_id: &str,
) -> Result<ReviewDetail> {
    let assignment = db
        .get_assignment(assignment_id)?
        .ok_or_else(|| portal_err(PortalError::NotFound("Assignment not found".to_string())))?;
    let is_own = assignment.reviewer_id == viewer_id;
    if !is_own && !viewer_is_admin {
        return Err(portal_err(PortalError::forbidden()));
    }

    let review = db.get_review_by_assignment(&assignment.id)?;
    let score = match &review {
        Some(r) => db.get_score(&r.id)?,
        None => None,
    };
    let categories = db.categories_for_employee(&assignment.cycle_id, &assignment.employee_id)?;
    let cycle = db.get_cycle(&assignment.cycle_id)?;
    let employee_name = db
        .get_employee(&assignment.employee_id)?
        .map(|e| e.display_name())
        .unwrap_or_else(|| "Unknown employee".to_string());
    let is_released = db
        .get_summary(&assignment.cycle_id, &assignment.employee_id)?
        .is_some_and(|s| s.is_released());

    let status = review.as_ref().map(|r| r.status);
    let locked = status.is_some_and(|s| s.is_locked());
    let can_edit = is_own && assignment.is_active && !locked && !is_released;
    let can_score = can_edit && assignment.reviewer_type.is_scored();
    let can_toggle_share =
        viewer_is_admin && status == Some(ReviewStatus::Submitted) && !is_released;

    let narrative = review
        .as_ref()
        .and_then(|r| r.summary_employee_visible.as_deref())
        .unwrap_or_default();
    let missing = lifecycle::submission_problems(
        narrative,
        assignment.reviewer_type,
        &categories,
        score.as_ref().map(|s| &s.category_scores),
    );

    Ok(ReviewDetail {
        assignment,
        cycle,
        employee_name,
        review,
        score,
        categories,
        is_released,
        can_edit,
        can_score,
        can_toggle_share,
        missing,
    })
}

// ── Employee home ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CurrentStatus {
    #[serde(rename = "No active cycle")]
    NoActiveCycle,
    #[serde(rename = "In progress")]
    InProgress,
    #[serde(rename = "Finalized, not released")]
    FinalizedNotReleased,
    #[serde(rename = "Released")]
    Released,
}

#[derive(Debug, Clone, Serialize)]
pub struct SharedNarrative {
    pub reviewer_type: ReviewerType,
    pub narrative: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReleasedResult {
    pub cycle_id: String,
    pub cycle_name: String,
    pub performance_rating: Option<PerformanceRating>,
    pub performance_rating_value: Option<i64>,
    pub final_score: Option<f64>,
    pub final_narrative: Option<String>,
    pub released_at: Option<String>,
    pub shared_narratives: Vec<SharedNarrative>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmployeeHome {
    pub cycle: CycleResolution,
    pub current_cycle_name: Option<String>,
    pub current_status: CurrentStatus,
    pub message: Option<String>,
    pub released: Vec<ReleasedResult>,
    /// Reviews this user still has to write in the active cycle(s).
    pub inbox_count: usize,
}

/// Narratives the employee may read for a released cycle: submitted reviews
/// the admin chose to share.
fn shared_narratives(reviews: &[Review], cycle_id: &str) -> Vec<SharedNarrative> {
    reviews
        .iter()
        .filter(|r| r.cycle_id == cycle_id)
        .filter(|r| r.status.is_locked() && r.narrative_share_with_employee)
        .filter_map(|r| {
            r.summary_employee_visible
                .as_ref()
                .filter(|n| !n.trim().is_empty())
                .map(|n| SharedNarrative {
                    reviewer_type: r.reviewer_type,
                    narrative: n.clone(),
                })
        })
        .collect()
}

pub fn employee_home(db: &PortalDb, user_id: &str, cycle: CycleResolution) -> Result<EmployeeHome> {
    let cycle_names = cycle_names(db)?;
    let summaries = db.list_summaries_for_employee(user_id)?;
    let reviews = db.list_reviews_for_employee(user_id)?;

    let released: Vec<ReleasedResult> = summaries
        .iter()
        .filter(|s| s.is_released())
        .map(|s| ReleasedResult {
            cycle_id: s.cycle_id.clone(),
            cycle_name: cycle_names.get(&s.cycle_id).cloned().unwrap_or_default(),
            performance_rating: s.performance_rating,
            performance_rating_value: s.performance_rating_value,
            final_score: s.primary_final_score,
            final_narrative: s.final_narrative_employee_visible.clone(),
            released_at: s.released_at.clone(),
            shared_narratives: shared_narratives(&reviews, &s.cycle_id),
        })
        .collect();

    let Some(current_id) = cycle.selected_cycle_id.clone() else {
        return Ok(EmployeeHome {
            cycle,
            current_cycle_name: None,
            current_status: CurrentStatus::NoActiveCycle,
            message: Some(NO_ACTIVE_CYCLE.to_string()),
            released,
            inbox_count: 0,
        });
    };

    let current_status = match summaries.iter().find(|s| s.cycle_id == current_id) {
        Some(s) if s.is_released() => CurrentStatus::Released,
        Some(s) if s.finalized_at.is_some() => CurrentStatus::FinalizedNotReleased,
        _ => CurrentStatus::InProgress,
    };

    let pending: HashMap<String, ReviewStatus> = db
        .list_reviews_for_reviewer(user_id, &cycle.cycle_ids_to_use)?
        .into_iter()
        .map(|r| (r.assignment_id, r.status))
        .collect();
    let inbox_count = db
        .list_reviewer_assignments(user_id, &cycle.cycle_ids_to_use)?
        .iter()
        .filter(|a| !pending.get(&a.id).is_some_and(|s| s.is_locked()))
        .count();

    Ok(EmployeeHome {
        current_cycle_name: cycle_names.get(&current_id).cloned(),
        cycle,
        current_status,
        message: None,
        released,
        inbox_count,
    })
}

// ── Admin assignment board ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RubricStatus {
    Assigned,
    Missing,
    Inactive,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewerSlot {
    pub assignment_id: String,
    pub reviewer_id: String,
    pub reviewer_name: String,
    pub review_id: Option<String>,
    pub status: ReviewStatus,
    pub narrative_shared: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BoardRow {
    pub employee: EmployeeDetail,
    pub self_review: Option<ReviewerSlot>,
    pub primary: Option<ReviewerSlot>,
    pub secondary: Option<ReviewerSlot>,
    pub peers: Vec<ReviewerSlot>,
    pub rubric_status: RubricStatus,
    pub summary: Option<CycleEmployeeSummary>,
    pub can_release: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminBoard {
    pub cycle: CycleResolution,
    pub current_cycle: Option<ReviewCycle>,
    pub rows: Vec<BoardRow>,
    pub reviewer_candidates: Vec<Profile>,
    pub empty_message: Option<String>,
}

/// Template status of the rubric mapped to a job role in a cycle.
fn rubric_status(
    job_role_id: Option<&str>,
    mappings: &[CycleRubric],
    rubrics: &HashMap<String, Rubric>,
) -> RubricStatus {
    let Some(role_id) = job_role_id else {
        return RubricStatus::Missing;
    };
    match mappings.iter().find(|m| m.job_role_id == role_id) {
        None => RubricStatus::Missing,
        Some(m) => match rubrics.get(&m.rubric_id) {
            Some(r) if r.is_active => RubricStatus::Assigned,
            Some(_) => RubricStatus::Inactive,
            None => RubricStatus::Missing,
        },
    }
}

pub fn admin_board(db: &PortalDb, cycle: CycleResolution) -> Result<AdminBoard> {
    let Some(cycle_id) = cycle.selected_cycle_id.clone() else {
        return Ok(AdminBoard {
            cycle,
            current_cycle: None,
            rows: Vec::new(),
            reviewer_candidates: Vec::new(),
            empty_message: Some(NO_ACTIVE_CYCLE.to_string()),
        });
    };

    let current_cycle = db.get_cycle(&cycle_id)?;
    let people = profile_names(db)?;
    let assignments: Vec<ReviewAssignment> = db
        .list_assignments_for_cycle(&cycle_id)?
        .into_iter()
        .filter(|a| a.is_active)
        .collect();
    let mappings = db.list_cycle_rubrics(&cycle_id)?;
    let rubrics: HashMap<String, Rubric> = db
        .list_rubrics(None)?
        .into_iter()
        .map(|r| (r.rubric.id.clone(), r.rubric))
        .collect();
    let summaries: HashMap<String, CycleEmployeeSummary> = db
        .list_summaries_for_cycle(&cycle_id)?
        .into_iter()
        .map(|s| (s.employee_id.clone(), s))
        .collect();

    let mut rows = Vec::new();
    for employee in db.list_employees()? {
        let mut row = BoardRow {
            rubric_status: rubric_status(employee.employee.job_role_id.as_deref(), &mappings, &rubrics),
            summary: summaries.get(&employee.employee.id).cloned(),
            self_review: None,
            primary: None,
            secondary: None,
            peers: Vec::new(),
            can_release: false,
            employee,
        };

        for a in assignments.iter().filter(|a| a.employee_id == row.employee.employee.id) {
            let review = db.get_review_by_assignment(&a.id)?;
            let slot = ReviewerSlot {
                assignment_id: a.id.clone(),
                reviewer_id: a.reviewer_id.clone(),
                reviewer_name: people
                    .get(&a.reviewer_id)
                    .cloned()
                    .unwrap_or_else(|| "Unknown".to_string()),
                review_id: review.as_ref().map(|r| r.id.clone()),
                status: review.as_ref().map(|r| r.status).unwrap_or(ReviewStatus::Draft),
                narrative_shared: review.as_ref().is_some_and(|r| r.narrative_share_with_employee),
            };
            match a.reviewer_type {
                ReviewerType::SelfReview => row.self_review = Some(slot),
                ReviewerType::Primary => row.primary = Some(slot),
                ReviewerType::Secondary => row.secondary = Some(slot),
                ReviewerType::Peer => row.peers.push(slot),
            }
        }

        let primary_submitted = row.primary.as_ref().is_some_and(|p| p.status.is_locked());
        let released = row.summary.as_ref().is_some_and(|s| s.is_released());
        row.can_release = primary_submitted && !released;
        rows.push(row);
    }

    Ok(AdminBoard {
        cycle,
        current_cycle,
        reviewer_candidates: db.list_reviewer_candidates()?,
        empty_message: None,
        rows,
    })
}

// ── Cycle rubric mapping ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CycleRubricRow {
    pub job_role: JobRole,
    pub rubric_id: Option<String>,
    pub rubric_version: Option<String>,
    pub status: RubricStatus,
}

/// One row per job role with the rubric it uses in `cycle_id`.
pub fn cycle_rubrics(db: &PortalDb, cycle_id: &str) -> Result<Vec<CycleRubricRow>> {
    if db.get_cycle(cycle_id)?.is_none() {
        return Err(portal_err(PortalError::NotFound("Cycle not found".to_string())));
    }
    let mappings = db.list_cycle_rubrics(cycle_id)?;
    let rubrics: HashMap<String, Rubric> = db
        .list_rubrics(None)?
        .into_iter()
        .map(|r| (r.rubric.id.clone(), r.rubric))
        .collect();

    Ok(db
        .list_job_roles()?
        .into_iter()
        .map(|role| {
            let mapped = mappings
                .iter()
                .find(|m| m.job_role_id == role.id)
                .and_then(|m| rubrics.get(&m.rubric_id));
            CycleRubricRow {
                status: rubric_status(Some(&role.id), &mappings, &rubrics),
                rubric_id: mapped.map(|r| r.id.clone()),
                rubric_version: mapped.map(|r| r.version.clone()),
                job_role: role,
            }
        })
        .collect())
}
