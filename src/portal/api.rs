use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
};
use serde::Deserialize;
use tracing::{error, warn};
use uuid::Uuid;

use super::db::{DbHandle, NarrativeUpdate, PortalDb};
use super::identity::{AdminUser, CurrentUser};
use super::mailer::Mailer;
use super::models::{Review, ReviewAssignment, ReviewScore};
use super::views::{self, EmployeeHome, ReviewDetail, ReviewerInbox};
use super::{admin_api, auth_api};
use crate::config::AuthSection;
use crate::errors::{PortalError, portal_err};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub mailer: Arc<dyn Mailer>,
    pub auth: AuthSection,
    /// Sender address for outgoing mail.
    pub mail_from: String,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleQuery {
    pub cycle_id: Option<String>,
}

#[derive(Deserialize)]
pub struct ShareRequest {
    pub share: bool,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Forbidden(String),
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %message, "Request failed");
        } else {
            warn!(status = status.as_u16(), error = %message, "Request rejected");
        }
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<PortalError> for ApiError {
    fn from(err: PortalError) -> Self {
        match err {
            PortalError::Unauthorized => ApiError::Unauthorized,
            PortalError::Forbidden(msg) => ApiError::Forbidden(msg),
            PortalError::BadRequest(msg) | PortalError::Conflict(msg) => ApiError::BadRequest(msg),
            PortalError::NotFound(msg) => ApiError::NotFound(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

/// Database operations raise `PortalError` inside `anyhow`; anything else is a 500.
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<PortalError>() {
            Ok(PortalError::Other(inner)) => ApiError::Internal(format!("{:#}", inner)),
            Ok(portal) => portal.into(),
            Err(other) => ApiError::Internal(format!("{:#}", other)),
        }
    }
}

/// Ids in paths and bodies are UUIDs; normalize them to the stored form.
pub fn parse_id(raw: &str, what: &str) -> Result<String, ApiError> {
    Uuid::parse_str(raw.trim())
        .map(|id| id.to_string())
        .map_err(|_| ApiError::BadRequest(format!("Invalid {}", what)))
}

/// The assignment, provided `user_id` is its reviewer.
fn own_assignment(db: &PortalDb, assignment_id: &str, user_id: &str) -> anyhow::Result<ReviewAssignment> {
    let assignment = db
        .get_assignment(assignment_id)?
        .ok_or_else(|| portal_err(PortalError::NotFound("Assignment not found".to_string())))?;
    if assignment.reviewer_id != user_id {
        return Err(portal_err(PortalError::forbidden()));
    }
    Ok(assignment)
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/reviews", get(list_reviews))
        .route("/api/reviews/{assignment_id}", get(get_review))
        .route("/api/reviews/{assignment_id}/narrative", put(save_narrative))
        .route("/api/reviews/{assignment_id}/scores", put(save_scores))
        .route("/api/reviews/{assignment_id}/share-narrative", put(share_narrative))
        .route("/api/employee", get(employee_home))
        .route("/health", get(health_check))
        .merge(auth_api::router())
        .merge(admin_api::router())
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_reviews(
    State(state): State<SharedState>,
    user: CurrentUser,
    Query(query): Query<CycleQuery>,
) -> Result<Json<ReviewerInbox>, ApiError> {
    let user_id = user.id().to_string();
    let is_admin = user.is_admin();
    let inbox = state
        .db
        .call(move |db| {
            let cycle = views::resolve_for(db, is_admin, query.cycle_id.as_deref())?;
            views::reviewer_inbox(db, &user_id, cycle)
        })
        .await?;
    Ok(Json(inbox))
}

async fn get_review(
    State(state): State<SharedState>,
    user: CurrentUser,
    Path(assignment_id): Path<String>,
) -> Result<Json<ReviewDetail>, ApiError> {
    let assignment_id = parse_id(&assignment_id, "assignment id")?;
    let user_id = user.id().to_string();
    let is_admin = user.is_admin();
    let detail = state
        .db
        .call(move |db| views::review_detail(db, &user_id, is_admin, &assignment_id))
        .await?;
    Ok(Json(detail))
}

async fn save_narrative(
    State(state): State<SharedState>,
    user: CurrentUser,
    Path(assignment_id): Path<String>,
    Json(update): Json<NarrativeUpdate>,
) -> Result<Json<Review>, ApiError> {
    let assignment_id = parse_id(&assignment_id, "assignment id")?;
    let user_id = user.id().to_string();
    let review = state
        .db
        .call(move |db| {
            own_assignment(db, &assignment_id, &user_id)?;
            db.save_narrative(&assignment_id, &update)
        })
        .await?;
    Ok(Json(review))
}

async fn save_scores(
    State(state): State<SharedState>,
    user: CurrentUser,
    Path(assignment_id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<ReviewScore>, ApiError> {
    let assignment_id = parse_id(&assignment_id, "assignment id")?;
    let scores = body
        .get("category_scores")
        .and_then(|v| v.as_object())
        .cloned()
        .ok_or_else(|| ApiError::BadRequest("category_scores must be an object".to_string()))?;
    let user_id = user.id().to_string();
    let score = state
        .db
        .call(move |db| {
            own_assignment(db, &assignment_id, &user_id)?;
            db.save_scores(&assignment_id, &scores)
        })
        .await?;
    Ok(Json(score))
}

async fn share_narrative(
    State(state): State<SharedState>,
    AdminUser(_admin): AdminUser,
    Path(assignment_id): Path<String>,
    Json(req): Json<ShareRequest>,
) -> Result<Json<Review>, ApiError> {
    let assignment_id = parse_id(&assignment_id, "assignment id")?;
    let review = state
        .db
        .call(move |db| db.set_narrative_share(&assignment_id, req.share))
        .await?;
    Ok(Json(review))
}

async fn employee_home(
    State(state): State<SharedState>,
    user: CurrentUser,
) -> Result<Json<EmployeeHome>, ApiError> {
    let user_id = user.id().to_string();
    let home = state
        .db
        .call(move |db| {
            // Employees always see the global cycle; overrides are admin-only.
            let cycle = views::resolve_for(db, false, None)?;
            views::employee_home(db, &user_id, cycle)
        })
        .await?;
    Ok(Json(home))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::portal::assignments::ReviewerSelection;
    use crate::portal::db::tests::{Seed, seed};
    use crate::portal::identity;
    use crate::portal::mailer::tests::RecordingMailer;
    use crate::portal::models::ReviewerType;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    pub(crate) struct TestApp {
        pub app: Router,
        pub state: SharedState,
        pub seed: Seed,
        pub mailer: Arc<RecordingMailer>,
    }

    impl TestApp {
        /// Signed-in session token for `user_id`.
        pub fn login(&self, user_id: &str) -> String {
            let db = self.state.db.lock_sync().unwrap();
            identity::start_session(&db, &self.state.auth, user_id).unwrap()
        }

        pub async fn send(
            &self,
            method: &str,
            uri: &str,
            token: Option<&str>,
            body: Option<Value>,
        ) -> Response {
            let mut builder = Request::builder().method(method).uri(uri);
            if let Some(token) = token {
                builder = builder.header("authorization", format!("Bearer {}", token));
            }
            let request = match body {
                Some(body) => builder
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };
            self.app.clone().oneshot(request).await.unwrap()
        }

        /// Assign primary = reviewer_a (plus optional peers) to the seeded employee.
        pub fn assign(&self, peers: &[&str]) -> Vec<ReviewAssignment> {
            let db = self.state.db.lock_sync().unwrap();
            db.save_assignments(
                &ReviewerSelection {
                    cycle_id: self.seed.cycle.id.clone(),
                    employee_id: self.seed.employee.id.clone(),
                    primary_reviewer_id: Some(self.seed.reviewer_a.id.clone()),
                    secondary_reviewer_id: None,
                    peer_reviewer_ids: peers.iter().map(|p| p.to_string()).collect(),
                },
                &self.seed.admin.id,
            )
            .unwrap()
        }

        pub fn assignment_of(&self, list: &[ReviewAssignment], t: ReviewerType) -> String {
            list.iter()
                .find(|a| a.reviewer_type == t)
                .map(|a| a.id.clone())
                .unwrap()
        }
    }

    pub(crate) fn test_app() -> TestApp {
        let db = PortalDb::new_in_memory().unwrap();
        let seed = seed(&db).unwrap();
        let mailer = Arc::new(RecordingMailer::default());
        let state = Arc::new(AppState {
            db: DbHandle::new(db),
            mailer: mailer.clone(),
            auth: AuthSection::default(),
            mail_from: "reviews@example.com".to_string(),
        });
        TestApp {
            app: api_router().with_state(state.clone()),
            state,
            seed,
            mailer,
        }
    }

    pub(crate) async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let t = test_app();
        let response = t.send("GET", "/health", None, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_requests_without_session_are_unauthorized() {
        let t = test_app();
        let response = t.send("GET", "/api/reviews", None, None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: Value = body_json(response).await;
        assert_eq!(body["error"], "Unauthorized");

        let response = t.send("GET", "/api/employee", Some("not-a-session"), None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_session_cookie_is_accepted() {
        let t = test_app();
        let token = t.login(&t.seed.employee.id);
        let request = Request::builder()
            .method("GET")
            .uri("/api/employee")
            .header("cookie", format!("fireside_session={}", token))
            .body(Body::empty())
            .unwrap();
        let response = t.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_inbox_lists_assignments() {
        let t = test_app();
        t.assign(&[]);
        let token = t.login(&t.seed.reviewer_a.id);
        let response = t.send("GET", "/api/reviews", Some(&token), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let inbox: Value = body_json(response).await;
        assert_eq!(inbox["items"].as_array().unwrap().len(), 1);
        assert_eq!(inbox["draft_count"], 1);
        assert_eq!(inbox["cycle"]["label"], "H1 2026");
    }

    #[tokio::test]
    async fn test_review_detail_rejects_other_reviewers() {
        let t = test_app();
        let list = t.assign(&[]);
        let primary = t.assignment_of(&list, ReviewerType::Primary);

        let token = t.login(&t.seed.reviewer_b.id);
        let response = t
            .send("GET", &format!("/api/reviews/{}", primary), Some(&token), None)
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = t.send("GET", "/api/reviews/not-a-uuid", Some(&token), None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = body_json(response).await;
        assert_eq!(body["error"], "Invalid assignment id");
    }

    #[tokio::test]
    async fn test_primary_flow_scores_submit_and_lock() {
        let t = test_app();
        let list = t.assign(&[]);
        let primary = t.assignment_of(&list, ReviewerType::Primary);
        let token = t.login(&t.seed.reviewer_a.id);

        let response = t
            .send(
                "PUT",
                &format!("/api/reviews/{}/scores", primary),
                Some(&token),
                Some(json!({"category_scores": {"delivery": 140, "craft": "75"}})),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let score: Value = body_json(response).await;
        assert_eq!(score["category_scores"]["delivery"], 100.0);
        assert_eq!(score["category_scores"]["craft"], 75.0);

        let response = t
            .send(
                "PUT",
                &format!("/api/reviews/{}/narrative", primary),
                Some(&token),
                Some(json!({"narrative": "Great half", "submit": true})),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let review: Value = body_json(response).await;
        assert_eq!(review["status"], "submitted");

        let response = t
            .send(
                "PUT",
                &format!("/api/reviews/{}/narrative", primary),
                Some(&token),
                Some(json!({"narrative": "Changed my mind"})),
            )
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = body_json(response).await;
        assert_eq!(body["error"], "Review is submitted and locked");
    }

    #[tokio::test]
    async fn test_scores_body_must_be_object() {
        let t = test_app();
        let list = t.assign(&[]);
        let primary = t.assignment_of(&list, ReviewerType::Primary);
        let token = t.login(&t.seed.reviewer_a.id);

        let response = t
            .send(
                "PUT",
                &format!("/api/reviews/{}/scores", primary),
                Some(&token),
                Some(json!({"category_scores": [1, 2]})),
            )
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = body_json(response).await;
        assert_eq!(body["error"], "category_scores must be an object");
    }

    #[tokio::test]
    async fn test_non_primary_cannot_score() {
        let t = test_app();
        let peer_id = t.seed.reviewer_b.id.clone();
        let list = t.assign(&[&peer_id]);
        let peer = t.assignment_of(&list, ReviewerType::Peer);
        let token = t.login(&peer_id);

        let response = t
            .send(
                "PUT",
                &format!("/api/reviews/{}/scores", peer),
                Some(&token),
                Some(json!({"category_scores": {"delivery": 50}})),
            )
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body: Value = body_json(response).await;
        assert_eq!(body["error"], "Only primary can score");
    }

    #[tokio::test]
    async fn test_reviewer_cannot_write_someone_elses_review() {
        let t = test_app();
        let list = t.assign(&[]);
        let primary = t.assignment_of(&list, ReviewerType::Primary);
        let token = t.login(&t.seed.reviewer_b.id);

        let response = t
            .send(
                "PUT",
                &format!("/api/reviews/{}/narrative", primary),
                Some(&token),
                Some(json!({"narrative": "Not mine"})),
            )
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_share_toggle_is_admin_only_and_needs_submission() {
        let t = test_app();
        let list = t.assign(&[]);
        let primary = t.assignment_of(&list, ReviewerType::Primary);
        let uri = format!("/api/reviews/{}/share-narrative", primary);

        let reviewer = t.login(&t.seed.reviewer_a.id);
        let response = t
            .send("PUT", &uri, Some(&reviewer), Some(json!({"share": true})))
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let admin = t.login(&t.seed.admin.id);
        let response = t
            .send("PUT", &uri, Some(&admin), Some(json!({"share": true})))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = body_json(response).await;
        assert_eq!(body["error"], "Cannot toggle until review is submitted");
    }

    #[tokio::test]
    async fn test_employee_home_reports_progress() {
        let t = test_app();
        t.assign(&[]);
        let token = t.login(&t.seed.employee.id);
        let response = t.send("GET", "/api/employee", Some(&token), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let home: Value = body_json(response).await;
        assert_eq!(home["current_status"], "In progress");
        assert_eq!(home["inbox_count"], 1);
    }

    #[test]
    fn test_error_mapping() {
        let err: ApiError = portal_err(PortalError::locked()).into();
        assert!(matches!(err, ApiError::BadRequest(ref m) if m == "Review is submitted and locked"));

        let err: ApiError = anyhow::anyhow!("disk on fire").into();
        assert!(matches!(err, ApiError::Internal(_)));

        let err: ApiError = portal_err(PortalError::NotFound("Cycle not found".into()))
            .context("loading cycle")
            .into();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[test]
    fn test_parse_id_normalizes_case() {
        let id = Uuid::new_v4().to_string();
        assert_eq!(parse_id(&id.to_uppercase(), "id").unwrap(), id);
        assert!(parse_id("12", "cycle id").is_err());
    }
}
