//! Administrator endpoints. Every handler takes `AdminUser`, so non-admins get 403.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, patch, post},
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::api::{ApiError, CycleQuery, SharedState, parse_id};
use super::assignments::ReviewerSelection;
use super::cycles::ACTIVE_CYCLE_SETTING;
use super::db::{EmployeeUpdate, FinalizeRequest, JobRoleUpdate, NewCycle, NewJobRole};
use super::identity::{self, AdminUser};
use super::mailer;
use super::models::*;
use super::views::{self, AdminBoard, CycleRubricRow};
use crate::errors::{PortalError, portal_err};

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmployeeCycleRequest {
    pub cycle_id: String,
    pub employee_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReopenRequest {
    pub review_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveCycleRequest {
    #[serde(default)]
    pub cycle_id: Option<String>,
}

#[derive(Deserialize)]
pub struct InviteRequest {
    pub email: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub job_role_id: Option<String>,
    #[serde(default)]
    pub hire_date: Option<String>,
}

#[derive(Deserialize)]
pub struct CycleStatusRequest {
    pub status: String,
}

#[derive(Deserialize)]
pub struct CycleRubricRequest {
    pub job_role_id: String,
    #[serde(default)]
    pub rubric_id: Option<String>,
}

#[derive(Deserialize)]
pub struct RubricQuery {
    pub role_id: Option<String>,
}

#[derive(Deserialize)]
pub struct NewRubricRequest {
    pub role_id: String,
    pub version: String,
    pub categories: Vec<NewRubricCategory>,
}

// ── Router ────────────────────────────────────────────────────────────

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/api/admin/release-employee-cycle", post(release_employee_cycle))
        .route("/api/admin/finalize-employee-cycle", post(finalize_employee_cycle))
        .route("/api/admin/reopen-review", post(reopen_review))
        .route("/api/admin/reviews/{id}/reopen", post(reopen_review_by_path))
        .route("/api/admin/active-cycle", get(get_active_cycle).put(set_active_cycle))
        .route("/api/admin/invite-user", post(invite_user))
        .route("/api/admin/employees", get(list_employees))
        .route("/api/admin/employees/{id}", patch(update_employee))
        .route("/api/admin/cycles", get(list_cycles).post(create_cycle))
        .route("/api/admin/cycles/{id}", patch(update_cycle))
        .route(
            "/api/admin/cycles/{id}/rubrics",
            get(get_cycle_rubrics).put(set_cycle_rubric),
        )
        .route("/api/admin/rubrics", get(list_rubrics).post(create_rubric))
        .route("/api/admin/job-roles", get(list_job_roles).post(create_job_role))
        .route(
            "/api/admin/job-roles/{code}",
            patch(update_job_role).delete(delete_job_role),
        )
        .route("/api/admin/assignments", get(assignment_board).put(save_assignments))
        .route("/api/admin/audit/{entity_type}/{entity_id}", get(list_audit))
}

fn parse_opt_id(raw: Option<&str>, what: &str) -> Result<Option<String>, ApiError> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_id(s, what))
        .transpose()
}

fn parse_hire_date(raw: Option<&str>) -> Result<Option<String>, ApiError> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(|d| d.format("%Y-%m-%d").to_string())
                .map_err(|_| ApiError::BadRequest("Invalid hire_date (expected YYYY-MM-DD)".to_string()))
        })
        .transpose()
}

// ── Release, calibration, reopen ──────────────────────────────────────

async fn release_employee_cycle(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    Json(req): Json<EmployeeCycleRequest>,
) -> Result<Json<Value>, ApiError> {
    let cycle_id = parse_id(&req.cycle_id, "cycle id")?;
    let employee_id = parse_id(&req.employee_id, "employee id")?;
    let actor = admin.id().to_string();
    let outcome = state
        .db
        .call(move |db| db.release_employee_cycle(&cycle_id, &employee_id, &actor))
        .await?;
    info!(
        cycle_id = %outcome.summary.cycle_id,
        employee_id = %outcome.summary.employee_id,
        already_released = outcome.already_released,
        "Release requested"
    );
    Ok(Json(json!({
        "ok": true,
        "already_released": outcome.already_released,
        "summary": outcome.summary,
    })))
}

async fn finalize_employee_cycle(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    Json(mut req): Json<FinalizeRequest>,
) -> Result<Json<CycleEmployeeSummary>, ApiError> {
    req.cycle_id = parse_id(&req.cycle_id, "cycle id")?;
    req.employee_id = parse_id(&req.employee_id, "employee id")?;
    if req.calibration_adjustment.is_some_and(|a| !a.is_finite()) {
        return Err(ApiError::BadRequest("Invalid calibrationAdjustment".to_string()));
    }
    let actor = admin.id().to_string();
    let summary = state
        .db
        .call(move |db| db.finalize_employee_cycle_summary(&req, &actor))
        .await?;
    Ok(Json(summary))
}

async fn reopen(state: &SharedState, admin: &identity::CurrentUser, raw_id: &str) -> Result<Json<Review>, ApiError> {
    let review_id = parse_id(raw_id, "review id")?;
    let actor = admin.id().to_string();
    let review = state
        .db
        .call(move |db| db.reopen_review(&review_id, &actor))
        .await?;
    Ok(Json(review))
}

async fn reopen_review(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    Json(req): Json<ReopenRequest>,
) -> Result<Json<Review>, ApiError> {
    reopen(&state, &admin, &req.review_id).await
}

async fn reopen_review_by_path(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
) -> Result<Json<Review>, ApiError> {
    reopen(&state, &admin, &id).await
}

// ── Active cycle ──────────────────────────────────────────────────────

async fn get_active_cycle(
    State(state): State<SharedState>,
    AdminUser(_admin): AdminUser,
) -> Result<Json<Value>, ApiError> {
    let (setting, cycle) = state
        .db
        .call(|db| {
            let setting = db.get_setting(ACTIVE_CYCLE_SETTING)?;
            let cycle = match &setting {
                Some(id) => db.get_cycle(id)?,
                None => None,
            };
            Ok((setting, cycle))
        })
        .await?;
    Ok(Json(json!({"activeCycleId": setting, "cycle": cycle})))
}

/// `{cycleId: "<id>"}` pins an open cycle; `{cycleId: null}` clears the pin.
async fn set_active_cycle(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    Json(req): Json<ActiveCycleRequest>,
) -> Result<Json<Value>, ApiError> {
    let cycle_id = parse_opt_id(req.cycle_id.as_deref(), "cycle id")?;
    let pinned = cycle_id.clone();
    let cycle = state
        .db
        .call(move |db| match pinned {
            Some(id) => {
                let cycle = db
                    .get_cycle(&id)?
                    .ok_or_else(|| portal_err(PortalError::NotFound("Cycle not found".to_string())))?;
                if !cycle.status.is_open() {
                    return Err(portal_err(PortalError::BadRequest(
                        "Active cycle must be open".to_string(),
                    )));
                }
                db.set_setting(ACTIVE_CYCLE_SETTING, &id)?;
                Ok(Some(cycle))
            }
            None => {
                db.delete_setting(ACTIVE_CYCLE_SETTING)?;
                Ok(None)
            }
        })
        .await?;
    info!(cycle_id = ?cycle_id, actor = %admin.id(), "Active cycle changed");
    Ok(Json(json!({"activeCycleId": cycle_id, "cycle": cycle})))
}

// ── Users & employees ─────────────────────────────────────────────────

async fn invite_user(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    Json(req): Json<InviteRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let job_role_id = parse_opt_id(req.job_role_id.as_deref(), "job role id")?;
    let hire_date = parse_hire_date(req.hire_date.as_deref())?;
    let auth = state.auth.clone();
    let email = req.email.clone();
    let full_name = req.full_name.clone();

    let (employee, link) = state
        .db
        .call(move |db| {
            let employee = db.invite_employee(
                &email,
                full_name.as_deref(),
                job_role_id.as_deref(),
                hire_date.as_deref(),
            )?;
            let address = employee.email.clone().unwrap_or(email);
            let link = identity::create_sign_in_link(db, &auth, &address)?;
            Ok((employee, link))
        })
        .await?;

    let to = employee.email.clone().unwrap_or_default();
    let message = mailer::invite_message(&state.mail_from, &to, employee.full_name.as_deref(), &link);
    let email_sent = match state.mailer.send(&message).await {
        Ok(()) => true,
        Err(e) => {
            warn!(email = %to, error = %e, "Failed to send invitation");
            false
        }
    };
    info!(user_id = %employee.employee.id, actor = %admin.id(), email_sent, "User invited");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "ok": true,
            "userId": employee.employee.id,
            "employee": employee,
            "emailSent": email_sent,
        })),
    ))
}

async fn list_employees(
    State(state): State<SharedState>,
    AdminUser(_admin): AdminUser,
) -> Result<Json<Vec<EmployeeDetail>>, ApiError> {
    let employees = state.db.call(|db| db.list_employees()).await?;
    Ok(Json(employees))
}

async fn update_employee(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
    Json(mut update): Json<EmployeeUpdate>,
) -> Result<Json<EmployeeDetail>, ApiError> {
    let id = parse_id(&id, "employee id")?;
    if update.is_empty() {
        return Err(ApiError::BadRequest("No changes supplied".to_string()));
    }
    if let Some(Some(role_id)) = update.job_role_id.clone() {
        update.job_role_id = Some(parse_opt_id(Some(&role_id), "job role id")?);
    }
    if let Some(Some(date)) = update.hire_date.clone() {
        update.hire_date = Some(parse_hire_date(Some(&date))?);
    }
    let target = id.clone();
    let employee = state
        .db
        .call(move |db| db.update_employee(&target, &update))
        .await?;
    info!(employee_id = %id, actor = %admin.id(), "Employee updated");
    Ok(Json(employee))
}

// ── Cycles & rubrics ──────────────────────────────────────────────────

async fn list_cycles(
    State(state): State<SharedState>,
    AdminUser(_admin): AdminUser,
) -> Result<Json<Vec<ReviewCycle>>, ApiError> {
    let cycles = state.db.call(|db| db.list_cycles()).await?;
    Ok(Json(cycles))
}

async fn create_cycle(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    Json(req): Json<NewCycle>,
) -> Result<(StatusCode, Json<ReviewCycle>), ApiError> {
    let actor = admin.id().to_string();
    let cycle = state
        .db
        .call(move |db| db.create_cycle(&req, &actor))
        .await?;
    info!(cycle_id = %cycle.id, name = %cycle.name, "Cycle created");
    Ok((StatusCode::CREATED, Json(cycle)))
}

async fn update_cycle(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
    Json(req): Json<CycleStatusRequest>,
) -> Result<Json<ReviewCycle>, ApiError> {
    let id = parse_id(&id, "cycle id")?;
    let status: CycleStatus = req.status.trim().parse().map_err(ApiError::BadRequest)?;
    let cycle = state
        .db
        .call(move |db| db.update_cycle_status(&id, status))
        .await?;
    info!(cycle_id = %cycle.id, status = cycle.status.as_str(), actor = %admin.id(), "Cycle status updated");
    Ok(Json(cycle))
}

async fn get_cycle_rubrics(
    State(state): State<SharedState>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<String>,
) -> Result<Json<Vec<CycleRubricRow>>, ApiError> {
    let id = parse_id(&id, "cycle id")?;
    let rows = state.db.call(move |db| views::cycle_rubrics(db, &id)).await?;
    Ok(Json(rows))
}

async fn set_cycle_rubric(
    State(state): State<SharedState>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<String>,
    Json(req): Json<CycleRubricRequest>,
) -> Result<Json<Vec<CycleRubricRow>>, ApiError> {
    let id = parse_id(&id, "cycle id")?;
    let job_role_id = parse_id(&req.job_role_id, "job role id")?;
    let rubric_id = parse_opt_id(req.rubric_id.as_deref(), "rubric id")?;
    let rows = state
        .db
        .call(move |db| {
            db.set_cycle_rubric(&id, &job_role_id, rubric_id.as_deref())?;
            views::cycle_rubrics(db, &id)
        })
        .await?;
    Ok(Json(rows))
}

async fn list_rubrics(
    State(state): State<SharedState>,
    AdminUser(_admin): AdminUser,
    Query(query): Query<RubricQuery>,
) -> Result<Json<Vec<RubricWithCategories>>, ApiError> {
    let role_id = parse_opt_id(query.role_id.as_deref(), "job role id")?;
    let rubrics = state
        .db
        .call(move |db| db.list_rubrics(role_id.as_deref()))
        .await?;
    Ok(Json(rubrics))
}

async fn create_rubric(
    State(state): State<SharedState>,
    AdminUser(_admin): AdminUser,
    Json(req): Json<NewRubricRequest>,
) -> Result<(StatusCode, Json<RubricWithCategories>), ApiError> {
    let role_id = parse_id(&req.role_id, "job role id")?;
    let rubric = state
        .db
        .call(move |db| db.create_rubric(&role_id, &req.version, &req.categories))
        .await?;
    info!(rubric_id = %rubric.rubric.id, version = %rubric.rubric.version, "Rubric created");
    Ok((StatusCode::CREATED, Json(rubric)))
}

// ── Job roles ─────────────────────────────────────────────────────────

async fn list_job_roles(
    State(state): State<SharedState>,
    AdminUser(_admin): AdminUser,
) -> Result<Json<Vec<JobRole>>, ApiError> {
    let roles = state.db.call(|db| db.list_job_roles()).await?;
    Ok(Json(roles))
}

async fn create_job_role(
    State(state): State<SharedState>,
    AdminUser(_admin): AdminUser,
    Json(req): Json<NewJobRole>,
) -> Result<(StatusCode, Json<JobRole>), ApiError> {
    let role = state.db.call(move |db| db.create_job_role(&req)).await?;
    Ok((StatusCode::CREATED, Json(role)))
}

async fn update_job_role(
    State(state): State<SharedState>,
    AdminUser(_admin): AdminUser,
    Path(code): Path<String>,
    Json(update): Json<JobRoleUpdate>,
) -> Result<Json<JobRole>, ApiError> {
    let role = state
        .db
        .call(move |db| db.update_job_role(&code, &update))
        .await?;
    Ok(Json(role))
}

async fn delete_job_role(
    State(state): State<SharedState>,
    AdminUser(_admin): AdminUser,
    Path(code): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.db.call(move |db| db.delete_job_role(&code)).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Assignments ───────────────────────────────────────────────────────

async fn assignment_board(
    State(state): State<SharedState>,
    AdminUser(_admin): AdminUser,
    Query(query): Query<CycleQuery>,
) -> Result<Json<AdminBoard>, ApiError> {
    let board = state
        .db
        .call(move |db| {
            let cycle = views::resolve_for(db, true, query.cycle_id.as_deref())?;
            views::admin_board(db, cycle)
        })
        .await?;
    Ok(Json(board))
}

async fn save_assignments(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    Json(mut selection): Json<ReviewerSelection>,
) -> Result<Json<Vec<ReviewAssignment>>, ApiError> {
    selection.cycle_id = parse_id(&selection.cycle_id, "cycle id")?;
    selection.employee_id = parse_id(&selection.employee_id, "employee id")?;
    selection.primary_reviewer_id =
        parse_opt_id(selection.primary_reviewer_id.as_deref(), "reviewer id")?;
    selection.secondary_reviewer_id =
        parse_opt_id(selection.secondary_reviewer_id.as_deref(), "reviewer id")?;
    selection.peer_reviewer_ids = selection
        .peer_reviewer_ids
        .iter()
        .filter(|p| !p.trim().is_empty())
        .map(|p| parse_id(p, "reviewer id"))
        .collect::<Result<_, _>>()?;

    let actor = admin.id().to_string();
    let active = state
        .db
        .call(move |db| db.save_assignments(&selection, &actor))
        .await?;
    Ok(Json(active))
}

async fn list_audit(
    State(state): State<SharedState>,
    AdminUser(_admin): AdminUser,
    Path((entity_type, entity_id)): Path<(String, String)>,
) -> Result<Json<Vec<AuditEntry>>, ApiError> {
    let entity_id = parse_id(&entity_id, "entity id")?;
    let entries = state
        .db
        .call(move |db| db.list_audit(&entity_type, &entity_id))
        .await?;
    Ok(Json(entries))
}
