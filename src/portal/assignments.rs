//! Reviewer selection → desired assignment set.
//!
//! Saving a selection for (cycle, employee) is a full replacement: every active
//! non-self assignment whose (reviewer_type, reviewer) pair is not in the new set
//! is deactivated, everything in the set is upserted. The diff is computed here;
//! the database applies it in one transaction.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::models::{ReviewAssignment, ReviewerType};
use crate::errors::PortalError;

/// Admin's reviewer choice for one employee.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewerSelection {
    pub cycle_id: String,
    pub employee_id: String,
    #[serde(default)]
    pub primary_reviewer_id: Option<String>,
    #[serde(default)]
    pub secondary_reviewer_id: Option<String>,
    #[serde(default)]
    pub peer_reviewer_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DesiredAssignment {
    pub reviewer_type: ReviewerType,
    pub reviewer_id: String,
    pub is_required: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssignmentPlan {
    pub upsert: Vec<DesiredAssignment>,
    /// Ids of currently active assignments to switch off.
    pub deactivate: Vec<String>,
}

fn non_blank(id: &Option<String>) -> Option<&str> {
    id.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Build the desired set. The primary reviewer is mandatory; blanks are ignored
/// and duplicate peers collapse. Self is always included.
pub fn desired_set(selection: &ReviewerSelection) -> Result<Vec<DesiredAssignment>, PortalError> {
    let primary = non_blank(&selection.primary_reviewer_id)
        .ok_or_else(|| PortalError::BadRequest("Primary reviewer is required".to_string()))?;

    let mut set = BTreeSet::new();
    set.insert(DesiredAssignment {
        reviewer_type: ReviewerType::SelfReview,
        reviewer_id: selection.employee_id.clone(),
        is_required: true,
    });
    set.insert(DesiredAssignment {
        reviewer_type: ReviewerType::Primary,
        reviewer_id: primary.to_string(),
        is_required: true,
    });
    if let Some(secondary) = non_blank(&selection.secondary_reviewer_id) {
        set.insert(DesiredAssignment {
            reviewer_type: ReviewerType::Secondary,
            reviewer_id: secondary.to_string(),
            is_required: false,
        });
    }
    for peer in selection.peer_reviewer_ids.iter().map(|p| p.trim()) {
        if peer.is_empty() {
            continue;
        }
        set.insert(DesiredAssignment {
            reviewer_type: ReviewerType::Peer,
            reviewer_id: peer.to_string(),
            is_required: false,
        });
    }

    Ok(set.into_iter().collect())
}

/// Diff the desired set against the employee's existing assignments in the cycle.
pub fn plan(desired: Vec<DesiredAssignment>, existing: &[ReviewAssignment]) -> AssignmentPlan {
    let deactivate = existing
        .iter()
        .filter(|a| a.is_active && a.reviewer_type != ReviewerType::SelfReview)
        .filter(|a| {
            !desired
                .iter()
                .any(|d| d.reviewer_type == a.reviewer_type && d.reviewer_id == a.reviewer_id)
        })
        .map(|a| a.id.clone())
        .collect();

    AssignmentPlan {
        upsert: desired,
        deactivate,
    }
}
