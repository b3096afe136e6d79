//! Who is calling: session tokens, the `CurrentUser` extractor and role checks.
//!
//! A session token arrives either as `Authorization: Bearer <token>` or in the
//! `fireside_session` cookie. Only its SHA-256 hash is stored.

use axum::extract::FromRequestParts;
use axum::http::{HeaderMap, header, request::Parts};
use chrono::{Duration, SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::api::{ApiError, SharedState};
use super::db::PortalDb;
use super::models::{Profile, UserRole};
use crate::config::AuthSection;

pub const SESSION_COOKIE: &str = "fireside_session";

/// Fresh opaque token (256 bits of v4 UUID randomness, hex).
pub fn generate_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

pub fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

/// Timestamp `duration` from now; `None` means the configured lifetime overflowed.
fn expires_in(duration: Option<Duration>, what: &str) -> anyhow::Result<String> {
    let at = duration
        .and_then(|d| Utc::now().checked_add_signed(d))
        .ok_or_else(|| anyhow::anyhow!("Configured {} is out of range", what))?;
    Ok(at.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Bearer token first, then the session cookie.
pub fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_string());
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

pub fn session_cookie(token: &str, ttl_hours: i64) -> String {
    format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        SESSION_COOKIE,
        token,
        ttl_hours.max(0).saturating_mul(3600)
    )
}

pub fn clear_session_cookie() -> String {
    format!("{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0", SESSION_COOKIE)
}

/// Store a single-use sign-in token for `email` and return the link to mail.
pub fn create_sign_in_link(db: &PortalDb, auth: &AuthSection, email: &str) -> anyhow::Result<String> {
    let token = generate_token();
    db.create_magic_link(
        &hash_token(&token),
        email,
        &expires_in(
            Duration::try_minutes(auth.magic_link_ttl_minutes),
            "magic_link_ttl_minutes",
        )?,
    )?;
    Ok(format!(
        "{}/auth/callback?token={}",
        auth.site_url.trim_end_matches('/'),
        token
    ))
}

/// Start a session for `user_id`; returns the raw token for the cookie.
pub fn start_session(db: &PortalDb, auth: &AuthSection, user_id: &str) -> anyhow::Result<String> {
    let token = generate_token();
    db.create_session(
        &hash_token(&token),
        user_id,
        &expires_in(Duration::try_hours(auth.session_ttl_hours), "session_ttl_hours")?,
    )?;
    Ok(token)
}

/// The signed-in user, resolved from the session on every request.
#[derive(Debug, Clone, Serialize)]
pub struct CurrentUser {
    pub profile: Profile,
    pub role: UserRole,
    #[serde(skip)]
    pub token_hash: String,
}

impl CurrentUser {
    pub fn id(&self) -> &str {
        &self.profile.id
    }

    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }

    pub fn require_admin(&self) -> Result<(), ApiError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(ApiError::Forbidden("Forbidden".to_string()))
        }
    }
}

impl FromRequestParts<SharedState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let token = token_from_headers(&parts.headers).ok_or(ApiError::Unauthorized)?;
        let token_hash = hash_token(&token);
        let lookup = token_hash.clone();

        let resolved = state
            .db
            .call(move |db| {
                let Some(user_id) = db.session_user(&lookup)? else {
                    return Ok(None);
                };
                let Some(profile) = db.get_profile(&user_id)? else {
                    return Ok(None);
                };
                let role = db.effective_role(&profile)?;
                Ok(Some((profile, role)))
            })
            .await?;

        match resolved {
            Some((profile, role)) => Ok(CurrentUser {
                profile,
                role,
                token_hash,
            }),
            None => Err(ApiError::Unauthorized),
        }
    }
}

/// A `CurrentUser` that is an administrator; anyone else gets 403.
pub struct AdminUser(pub CurrentUser);

impl FromRequestParts<SharedState> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let user = CurrentUser::from_request_parts(parts, state).await?;
        user.require_admin()?;
        Ok(AdminUser(user))
    }
}
