//! Magic-link sign-in, session cookies and `/api/me`.

use axum::{
    Json, Router,
    extract::{Query, State},
    http::header,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::api::{ApiError, SharedState};
use super::db::normalize_email;
use super::identity::{self, CurrentUser};
use super::mailer;

#[derive(Deserialize)]
pub struct MagicLinkRequest {
    pub email: String,
}

#[derive(Deserialize)]
pub struct CallbackQuery {
    pub token: Option<String>,
}

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/auth/magic-link", post(request_magic_link))
        .route("/auth/callback", get(auth_callback))
        .route("/auth/logout", post(logout))
        .route("/api/me", get(me))
}

/// Always answers `{ok: true}` so the endpoint does not reveal which
/// addresses have accounts.
async fn request_magic_link(
    State(state): State<SharedState>,
    Json(req): Json<MagicLinkRequest>,
) -> Result<Json<Value>, ApiError> {
    let email = normalize_email(&req.email);
    if email.is_empty() {
        return Err(ApiError::BadRequest("Email is required".to_string()));
    }

    let auth = state.auth.clone();
    let lookup = email.clone();
    let link = state
        .db
        .call(move |db| match db.get_profile_by_email(&lookup)? {
            Some(profile) if profile.is_active => {
                identity::create_sign_in_link(db, &auth, &lookup).map(Some)
            }
            _ => Ok(None),
        })
        .await?;

    match link {
        Some(link) => {
            let message = mailer::sign_in_message(&state.mail_from, &email, &link);
            if let Err(e) = state.mailer.send(&message).await {
                warn!(email = %email, error = %e, "Failed to send sign-in link");
            }
        }
        None => info!(email = %email, "Sign-in requested for unknown or inactive address"),
    }
    Ok(Json(json!({"ok": true})))
}

async fn auth_callback(
    State(state): State<SharedState>,
    Query(query): Query<CallbackQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let token = query
        .token
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing token".to_string()))?;

    let auth = state.auth.clone();
    let session = state
        .db
        .call(move |db| {
            let Some(email) = db.consume_magic_link(&identity::hash_token(&token))? else {
                return Ok(None);
            };
            let Some(profile) = db.get_profile_by_email(&email)?.filter(|p| p.is_active) else {
                return Ok(None);
            };
            let role = db.effective_role(&profile)?;
            let session_token = identity::start_session(db, &auth, &profile.id)?;
            Ok(Some((profile, role, session_token)))
        })
        .await?;

    let (profile, role, session_token) = session
        .ok_or_else(|| ApiError::BadRequest("Invalid or expired sign-in link".to_string()))?;
    info!(user_id = %profile.id, role = role.as_str(), "User signed in");

    let cookie = identity::session_cookie(&session_token, state.auth.session_ttl_hours);
    Ok((
        [(header::SET_COOKIE, cookie)],
        Json(json!({
            "ok": true,
            "userId": profile.id,
            "role": role,
            "token": session_token,
        })),
    ))
}

async fn logout(
    State(state): State<SharedState>,
    user: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let token_hash = user.token_hash.clone();
    state
        .db
        .call(move |db| db.delete_session(&token_hash))
        .await?;
    info!(user_id = %user.id(), "User signed out");
    Ok((
        [(header::SET_COOKIE, identity::clear_session_cookie())],
        Json(json!({"ok": true})),
    ))
}

async fn me(user: CurrentUser) -> Json<Value> {
    Json(json!({
        "id": user.profile.id,
        "email": user.profile.email,
        "fullName": user.profile.full_name,
        "role": user.role,
        "isAdmin": user.is_admin(),
        "canReview": user.profile.can_review,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portal::api::tests::{body_json, test_app};
    use axum::http::StatusCode;

    fn token_from_link(text: &str) -> String {
        let start = text.find("token=").expect("link in mail") + "token=".len();
        text[start..]
            .split_whitespace()
            .next()
            .expect("token")
            .to_string()
    }

    #[tokio::test]
    async fn test_magic_link_sign_in_flow() {
        let t = test_app();
        let response = t
            .send(
                "POST",
                "/auth/magic-link",
                None,
                Some(json!({"email": "  Erin@Example.com "})),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = body_json(response).await;
        assert_eq!(body["ok"], true);

        let token = {
            let sent = t.mailer.sent.lock().unwrap();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].to, "erin@example.com");
            token_from_link(&sent[0].text)
        };

        let response = t
            .send("GET", &format!("/auth/callback?token={}", token), None, None)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(cookie.starts_with("fireside_session="));
        let body: Value = body_json(response).await;
        assert_eq!(body["userId"], t.seed.employee.id.as_str());
        assert_eq!(body["role"], "employee");

        let session = body["token"].as_str().unwrap().to_string();
        let response = t.send("GET", "/api/me", Some(&session), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let me: Value = body_json(response).await;
        assert_eq!(me["email"], "erin@example.com");
        assert_eq!(me["isAdmin"], false);

        // Links are single-use.
        let response = t
            .send("GET", &format!("/auth/callback?token={}", token), None, None)
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_email_still_answers_ok() {
        let t = test_app();
        let response = t
            .send(
                "POST",
                "/auth/magic-link",
                None,
                Some(json!({"email": "nobody@example.com"})),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(t.mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_logout_ends_session() {
        let t = test_app();
        let token = t.login(&t.seed.admin.id);

        let response = t.send("GET", "/api/me", Some(&token), None).await;
        let me: Value = body_json(response).await;
        assert_eq!(me["role"], "admin");
        assert_eq!(me["isAdmin"], true);

        let response = t.send("POST", "/auth/logout", Some(&token), None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = t.send("GET", "/api/me", Some(&token), None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
