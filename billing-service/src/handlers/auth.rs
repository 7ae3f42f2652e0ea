//! Caller identity extractors.
//!
//! The upstream session layer authenticates the user and forwards `X-User-ID` and
//! `X-User-Role`. These headers are trusted as-is.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "X-User-ID";
pub const USER_ROLE_HEADER: &str = "X-User-Role";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserRole {
    Client,
    Talent,
    Manager,
    Admin,
}

impl UserRole {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CLIENT" => Some(UserRole::Client),
            "TALENT" => Some(UserRole::Talent),
            "MANAGER" => Some(UserRole::Manager),
            "ADMIN" => Some(UserRole::Admin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Client => "CLIENT",
            UserRole::Talent => "TALENT",
            UserRole::Manager => "MANAGER",
            UserRole::Admin => "ADMIN",
        }
    }

    pub fn is_manager(&self) -> bool {
        matches!(self, UserRole::Manager | UserRole::Admin)
    }
}

/// Authenticated caller.
#[derive(Debug, Clone, Copy)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub role: UserRole,
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|v| v.to_str().ok())
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = header(parts, USER_ID_HEADER)
            .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Missing X-User-ID header")))?;
        let user_id = Uuid::parse_str(user_id)
            .map_err(|_| AppError::Unauthorized(anyhow::anyhow!("Invalid X-User-ID header")))?;

        let role = header(parts, USER_ROLE_HEADER)
            .and_then(UserRole::parse)
            .ok_or_else(|| {
                AppError::Unauthorized(anyhow::anyhow!("Missing or invalid X-User-Role header"))
            })?;

        tracing::Span::current().record("user_id", tracing::field::display(user_id));

        Ok(AuthContext { user_id, role })
    }
}

fn forbidden(auth: &AuthContext, required: &str) -> AppError {
    tracing::warn!(
        user_id = %auth.user_id,
        role = auth.role.as_str(),
        required = required,
        "Caller lacks required role"
    );
    AppError::Forbidden(anyhow::anyhow!("{} role required", required))
}

/// Caller with the CLIENT role; client routes act on the caller's own records.
#[derive(Debug, Clone, Copy)]
pub struct ClientContext(pub AuthContext);

#[async_trait]
impl<S> FromRequestParts<S> for ClientContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth = AuthContext::from_request_parts(parts, state).await?;
        if auth.role != UserRole::Client {
            return Err(forbidden(&auth, "Client"));
        }
        Ok(ClientContext(auth))
    }
}

/// Caller with MANAGER or ADMIN role.
#[derive(Debug, Clone, Copy)]
pub struct ManagerContext(pub AuthContext);

#[async_trait]
impl<S> FromRequestParts<S> for ManagerContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth = AuthContext::from_request_parts(parts, state).await?;
        if !auth.role.is_manager() {
            return Err(forbidden(&auth, "Manager or admin"));
        }
        Ok(ManagerContext(auth))
    }
}
