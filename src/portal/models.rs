use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Enumerations ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    Reviewer,
    Employee,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Reviewer => "reviewer",
            Self::Employee => "employee",
        }
    }
}

impl FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "reviewer" => Ok(Self::Reviewer),
            "employee" => Ok(Self::Employee),
            _ => Err(format!("Invalid user role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ReviewerType {
    #[serde(rename = "self")]
    SelfReview,
    Primary,
    Secondary,
    Peer,
}

impl ReviewerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SelfReview => "self",
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::Peer => "peer",
        }
    }

    /// Only the primary reviewer carries scoring responsibility.
    pub fn is_scored(&self) -> bool {
        matches!(self, Self::Primary)
    }
}

impl std::fmt::Display for ReviewerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "self" => Ok(Self::SelfReview),
            "primary" => Ok(Self::Primary),
            "secondary" => Ok(Self::Secondary),
            "peer" => Ok(Self::Peer),
            _ => Err(format!("Invalid reviewer type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Draft,
    Submitted,
    Finalized,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Submitted => "submitted",
            Self::Finalized => "finalized",
        }
    }

    /// Submitted and finalized reviews refuse narrative and score writes.
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Submitted | Self::Finalized)
    }
}

impl FromStr for ReviewStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "submitted" => Ok(Self::Submitted),
            "finalized" => Ok(Self::Finalized),
            _ => Err(format!("Invalid review status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Draft,
    Calibrating,
    Finalized,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Calibrating => "calibrating",
            Self::Finalized => "finalized",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Draft | Self::Calibrating)
    }
}

impl FromStr for CycleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "calibrating" => Ok(Self::Calibrating),
            "finalized" => Ok(Self::Finalized),
            _ => Err(format!("Invalid cycle status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PerformanceRating {
    Exceeds,
    Meets,
    NeedsDevelopment,
}

impl PerformanceRating {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exceeds => "EXCEEDS",
            Self::Meets => "MEETS",
            Self::NeedsDevelopment => "NEEDS_DEVELOPMENT",
        }
    }

    pub fn from_score(score: f64) -> Self {
        if score >= 85.0 {
            Self::Exceeds
        } else if score >= 60.0 {
            Self::Meets
        } else {
            Self::NeedsDevelopment
        }
    }

    pub fn value(&self) -> i64 {
        match self {
            Self::Exceeds => 3,
            Self::Meets => 2,
            Self::NeedsDevelopment => 1,
        }
    }
}

impl FromStr for PerformanceRating {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EXCEEDS" => Ok(Self::Exceeds),
            "MEETS" => Ok(Self::Meets),
            "NEEDS_DEVELOPMENT" => Ok(Self::NeedsDevelopment),
            _ => Err(format!("Invalid performance rating: {}", s)),
        }
    }
}

// ── Identity ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub email: Option<String>,
    pub full_name: Option<String>,
    pub user_role: UserRole,
    pub can_review: bool,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRole {
    pub id: String,
    pub code: String,
    pub name: String,
    pub employee_code_prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Employee {
    pub id: String,
    pub job_role_id: Option<String>,
    pub hire_date: Option<String>,
    pub employee_code: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Employee joined with its profile and job role, as listed on admin screens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmployeeDetail {
    #[serde(flatten)]
    pub employee: Employee,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub job_role: Option<JobRole>,
}

impl EmployeeDetail {
    pub fn display_name(&self) -> String {
        self.full_name
            .clone()
            .or_else(|| self.employee.employee_code.clone())
            .unwrap_or_else(|| "Unknown employee".to_string())
    }
}

// ── Cycles & rubrics ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewCycle {
    pub id: String,
    pub name: String,
    pub start_date: String,
    pub end_date: String,
    pub status: CycleStatus,
    pub created_by: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rubric {
    pub id: String,
    pub role_id: String,
    pub version: String,
    pub is_active: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RubricCategory {
    pub id: String,
    pub rubric_id: String,
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub weight: f64,
    pub is_scored: bool,
    pub sort_order: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RubricWithCategories {
    #[serde(flatten)]
    pub rubric: Rubric,
    pub categories: Vec<RubricCategory>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRubricCategory {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_true")]
    pub is_scored: bool,
}

fn default_weight() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRubric {
    pub cycle_id: String,
    pub job_role_id: String,
    pub rubric_id: String,
}

// ── Assignments & reviews ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewAssignment {
    pub id: String,
    pub cycle_id: String,
    pub employee_id: String,
    pub reviewer_id: String,
    pub reviewer_type: ReviewerType,
    pub is_active: bool,
    pub is_required: bool,
    pub created_by: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    pub id: String,
    pub assignment_id: String,
    pub cycle_id: String,
    pub employee_id: String,
    pub reviewer_id: String,
    pub reviewer_type: ReviewerType,
    pub status: ReviewStatus,
    pub summary_reviewer_private: Option<String>,
    pub summary_employee_visible: Option<String>,
    pub narrative_share_with_employee: bool,
    pub submitted_at: Option<String>,
    pub finalized_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Category code → score (0–100).
pub type CategoryScores = BTreeMap<String, f64>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewScore {
    pub review_id: String,
    pub category_scores: CategoryScores,
    pub base_score: Option<f64>,
    pub calibration_adjustment: Option<f64>,
    pub final_score: Option<f64>,
    pub updated_at: String,
}

// ── Calibration & release ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleEmployeeSummary {
    pub id: String,
    pub cycle_id: String,
    pub employee_id: String,
    pub primary_review_id: String,
    pub primary_final_score: Option<f64>,
    pub performance_rating: Option<PerformanceRating>,
    pub performance_rating_value: Option<i64>,
    pub calibration_adjustment: f64,
    pub calibration_reason: Option<String>,
    pub final_narrative_employee_visible: Option<String>,
    pub computed_by: String,
    pub computed_at: String,
    pub finalized_at: Option<String>,
    pub released_at: Option<String>,
    pub released_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl CycleEmployeeSummary {
    pub fn is_released(&self) -> bool {
        self.released_at.is_some()
    }
}

/// Outcome of a release request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseOutcome {
    pub summary: CycleEmployeeSummary,
    pub already_released: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub actor_user_id: String,
    pub before_state: Option<serde_json::Value>,
    pub after_state: Option<serde_json::Value>,
    pub created_at: String,
}
