//! Review lifecycle rules.
//!
//! ```text
//!   draft ──submit──> submitted ──admin reopen──> draft
//!                         │
//!                         └─(release of the cycle/employee summary is terminal)
//! ```
//!
//! Everything here is pure: handlers and database procedures load the current
//! state, ask these functions whether a transition is allowed, and only then
//! write. `finalized` locks exactly like `submitted`.

use serde_json::Value;

use super::models::{CategoryScores, ReviewStatus, ReviewerType, RubricCategory};
use crate::errors::PortalError;

pub const SCORE_MIN: f64 = 0.0;
pub const SCORE_MAX: f64 = 100.0;

/// Reject narrative/score writes once the review is submitted.
/// A missing review row is writable (it is created on first save).
pub fn ensure_writable(status: Option<ReviewStatus>) -> Result<(), PortalError> {
    match status {
        Some(s) if s.is_locked() => Err(PortalError::locked()),
        _ => Ok(()),
    }
}

/// Status a narrative save moves the review into.
pub fn next_status(current: Option<ReviewStatus>, submit: bool) -> Result<ReviewStatus, PortalError> {
    ensure_writable(current)?;
    Ok(if submit {
        ReviewStatus::Submitted
    } else {
        ReviewStatus::Draft
    })
}

pub fn ensure_can_score(reviewer_type: ReviewerType) -> Result<(), PortalError> {
    if reviewer_type.is_scored() {
        Ok(())
    } else {
        Err(PortalError::Forbidden("Only primary can score".to_string()))
    }
}

/// The narrative visibility flag may only change between submission and release.
pub fn ensure_share_allowed(
    status: ReviewStatus,
    released_at: Option<&str>,
) -> Result<(), PortalError> {
    if status != ReviewStatus::Submitted {
        return Err(PortalError::Conflict(
            "Cannot toggle until review is submitted".to_string(),
        ));
    }
    if released_at.is_some() {
        return Err(PortalError::Conflict(
            "Cannot toggle after cycle is released".to_string(),
        ));
    }
    Ok(())
}

pub fn ensure_reopenable(status: ReviewStatus, released_at: Option<&str>) -> Result<(), PortalError> {
    if !status.is_locked() {
        return Err(PortalError::Conflict(
            "Only submitted reviews can be reopened".to_string(),
        ));
    }
    if released_at.is_some() {
        return Err(PortalError::Conflict(
            "Cannot reopen a review after the employee cycle is released".to_string(),
        ));
    }
    Ok(())
}

/// Clamp a finite score into [0, 100]; anything else becomes 0.
pub fn clamp_score(raw: f64) -> f64 {
    if raw.is_finite() {
        raw.clamp(SCORE_MIN, SCORE_MAX)
    } else {
        SCORE_MIN
    }
}

fn coerce_score(value: &Value) -> f64 {
    let raw = match value {
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => s.trim().parse::<f64>().unwrap_or(f64::NAN),
        _ => f64::NAN,
    };
    clamp_score(raw)
}

/// Normalize a draft `category_scores` payload.
///
/// Values are clamped (non-numeric → 0). When the assignment has a rubric,
/// unknown category codes are rejected.
pub fn normalize_scores(
    raw: &serde_json::Map<String, Value>,
    categories: &[RubricCategory],
) -> Result<CategoryScores, PortalError> {
    if !categories.is_empty() {
        let unknown: Vec<&str> = raw
            .keys()
            .filter(|code| !categories.iter().any(|c| &c.code == *code))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(PortalError::BadRequest(format!(
                "Unknown rubric categories: {}",
                unknown.join(", ")
            )));
        }
    }

    Ok(raw
        .iter()
        .map(|(code, value)| (code.clone(), coerce_score(value)))
        .collect())
}

/// Everything still missing before a review can be submitted.
pub fn submission_problems(
    narrative: &str,
    reviewer_type: ReviewerType,
    categories: &[RubricCategory],
    scores: Option<&CategoryScores>,
) -> Vec<String> {
    let mut missing = Vec::new();
    if narrative.trim().is_empty() {
        missing.push("Narrative".to_string());
    }

    if reviewer_type.is_scored() {
        for category in categories.iter().filter(|c| c.is_scored) {
            match scores.and_then(|s| s.get(&category.code)) {
                None => missing.push(format!("Score: {}", category.name)),
                Some(v) if !v.is_finite() => missing.push(format!("Score: {}", category.name)),
                Some(v) if *v < SCORE_MIN || *v > SCORE_MAX => missing.push(format!(
                    "Score range: {} ({}-{})",
                    category.name, SCORE_MIN, SCORE_MAX
                )),
                Some(_) => {}
            }
        }
    }

    missing
}

pub fn ensure_submittable(
    narrative: &str,
    reviewer_type: ReviewerType,
    categories: &[RubricCategory],
    scores: Option<&CategoryScores>,
) -> Result<(), PortalError> {
    let missing = submission_problems(narrative, reviewer_type, categories, scores);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(PortalError::BadRequest(format!(
            "Cannot submit yet. Missing: {}",
            missing.join(", ")
        )))
    }
}

/// Weighted base score of a primary review.
///
/// Uses the weights of scored categories; falls back to a plain mean when the
/// weights sum to zero or no rubric is mapped. `None` when nothing is scored.
pub fn weighted_score(categories: &[RubricCategory], scores: &CategoryScores) -> Option<f64> {
    let scored: Vec<&RubricCategory> = categories.iter().filter(|c| c.is_scored).collect();

    if scored.is_empty() {
        if scores.is_empty() {
            return None;
        }
        let total: f64 = scores.values().map(|v| clamp_score(*v)).sum();
        return Some(total / scores.len() as f64);
    }

    let value_of = |c: &RubricCategory| clamp_score(scores.get(&c.code).copied().unwrap_or(SCORE_MIN));
    let weight_total: f64 = scored.iter().map(|c| c.weight.max(0.0)).sum();
    if weight_total > 0.0 {
        let weighted: f64 = scored.iter().map(|c| value_of(*c) * c.weight.max(0.0)).sum();
        Some(weighted / weight_total)
    } else {
        let total: f64 = scored.iter().map(|c| value_of(*c)).sum();
        Some(total / scored.len() as f64)
    }
}

pub fn final_score(base: f64, adjustment: f64) -> f64 {
    clamp_score(base + adjustment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn category(code: &str, weight: f64, is_scored: bool) -> RubricCategory {
        RubricCategory {
            id: format!("cat-{}", code),
            rubric_id: "rubric".to_string(),
            code: code.to_string(),
            name: code.to_uppercase(),
            description: None,
            weight,
            is_scored,
            sort_order: 0,
        }
    }

    #[test]
    fn test_submitted_review_is_locked() {
        assert!(ensure_writable(None).is_ok());
        assert!(ensure_writable(Some(ReviewStatus::Draft)).is_ok());
        let err = ensure_writable(Some(ReviewStatus::Submitted)).unwrap_err();
        assert_eq!(err.to_string(), "Review is submitted and locked");
        assert!(ensure_writable(Some(ReviewStatus::Finalized)).is_err());
    }

    #[test]
    fn test_next_status_transitions() {
        assert_eq!(next_status(None, false).unwrap(), ReviewStatus::Draft);
        assert_eq!(next_status(None, true).unwrap(), ReviewStatus::Submitted);
        assert_eq!(
            next_status(Some(ReviewStatus::Draft), true).unwrap(),
            ReviewStatus::Submitted
        );
        assert!(next_status(Some(ReviewStatus::Submitted), false).is_err());
    }

    #[test]
    fn test_only_primary_can_score() {
        assert!(ensure_can_score(ReviewerType::Primary).is_ok());
        let err = ensure_can_score(ReviewerType::Peer).unwrap_err();
        assert!(matches!(err, PortalError::Forbidden(_)));
    }

    #[test]
    fn test_share_requires_submitted_and_unreleased() {
        assert!(ensure_share_allowed(ReviewStatus::Submitted, None).is_ok());
        assert!(ensure_share_allowed(ReviewStatus::Draft, None).is_err());
        assert!(ensure_share_allowed(ReviewStatus::Finalized, None).is_err());
        let err = ensure_share_allowed(ReviewStatus::Submitted, Some("2026-01-01T00:00:00Z"))
            .unwrap_err();
        assert!(err.to_string().contains("released"));
    }

    #[test]
    fn test_reopen_rules() {
        assert!(ensure_reopenable(ReviewStatus::Submitted, None).is_ok());
        assert!(ensure_reopenable(ReviewStatus::Finalized, None).is_ok());
        assert!(ensure_reopenable(ReviewStatus::Draft, None).is_err());
        assert!(ensure_reopenable(ReviewStatus::Submitted, Some("2026-01-01T00:00:00Z")).is_err());
    }

    #[test]
    fn test_clamp_score() {
        assert_eq!(clamp_score(55.5), 55.5);
        assert_eq!(clamp_score(-3.0), 0.0);
        assert_eq!(clamp_score(140.0), 100.0);
        assert_eq!(clamp_score(f64::NAN), 0.0);
        assert_eq!(clamp_score(f64::INFINITY), 0.0);
    }

    #[test]
    fn test_normalize_scores_clamps_and_coerces() {
        let raw = json!({"delivery": 120, "craft": "42.5", "teamwork": "lots", "impact": null});
        let scores = normalize_scores(raw.as_object().unwrap(), &[]).unwrap();
        assert_eq!(scores["delivery"], 100.0);
        assert_eq!(scores["craft"], 42.5);
        assert_eq!(scores["teamwork"], 0.0);
        assert_eq!(scores["impact"], 0.0);
    }

    #[test]
    fn test_normalize_scores_rejects_unknown_codes() {
        let categories = vec![category("delivery", 1.0, true)];
        let raw = json!({"delivery": 80, "vibes": 10});
        let err = normalize_scores(raw.as_object().unwrap(), &categories).unwrap_err();
        assert!(err.to_string().contains("vibes"));
    }

    #[test]
    fn test_submission_requires_narrative() {
        let missing = submission_problems("   ", ReviewerType::Peer, &[], None);
        assert_eq!(missing, vec!["Narrative".to_string()]);
        assert!(ensure_submittable("Great quarter", ReviewerType::Peer, &[], None).is_ok());
    }

    #[test]
    fn test_primary_submission_requires_every_scored_category() {
        let categories = vec![
            category("delivery", 2.0, true),
            category("craft", 1.0, true),
            category("notes", 0.0, false),
        ];
        let mut scores = CategoryScores::new();
        scores.insert("delivery".to_string(), 70.0);

        let missing =
            submission_problems("Solid", ReviewerType::Primary, &categories, Some(&scores));
        assert_eq!(missing, vec!["Score: CRAFT".to_string()]);

        scores.insert("craft".to_string(), 101.0);
        let missing =
            submission_problems("Solid", ReviewerType::Primary, &categories, Some(&scores));
        assert_eq!(missing, vec!["Score range: CRAFT (0-100)".to_string()]);

        scores.insert("craft".to_string(), 90.0);
        assert!(
            ensure_submittable("Solid", ReviewerType::Primary, &categories, Some(&scores)).is_ok()
        );
    }

    #[test]
    fn test_secondary_submission_ignores_scores() {
        let categories = vec![category("delivery", 1.0, true)];
        assert!(ensure_submittable("Helpful", ReviewerType::Secondary, &categories, None).is_ok());
    }

    #[test]
    fn test_weighted_score() {
        let categories = vec![
            category("delivery", 3.0, true),
            category("craft", 1.0, true),
            category("notes", 5.0, false),
        ];
        let scores: CategoryScores =
            [("delivery".to_string(), 80.0), ("craft".to_string(), 40.0)].into();
        assert_eq!(weighted_score(&categories, &scores), Some(70.0));
    }

    #[test]
    fn test_weighted_score_fallbacks() {
        let zero_weights = vec![category("a", 0.0, true), category("b", 0.0, true)];
        let scores: CategoryScores = [("a".to_string(), 50.0), ("b".to_string(), 100.0)].into();
        assert_eq!(weighted_score(&zero_weights, &scores), Some(75.0));
        assert_eq!(weighted_score(&[], &scores), Some(75.0));
        assert_eq!(weighted_score(&[], &CategoryScores::new()), None);
    }

    #[test]
    fn test_final_score_is_clamped() {
        assert_eq!(final_score(95.0, 10.0), 100.0);
        assert_eq!(final_score(5.0, -10.0), 0.0);
        assert_eq!(final_score(70.0, 2.5), 72.5);
    }
}
