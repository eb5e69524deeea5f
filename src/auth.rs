//! Caller identification.
//!
//! Members are resolved through the Authentication service from their bearer
//! token. The scheduled clock authenticates with a shared secret instead and
//! bypasses per-member ownership checks.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use reqwest::Client;
use uuid::Uuid;

use crate::error::{PacError, PacResult};
use crate::model::{CurrentUser, MemberRole};

pub const SUPER_CLOCK_HEADER: &str = "x-super-clock-token";

const SERVICE: &str = "Authentication service";

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn current_user(&self, token: &str) -> PacResult<CurrentUser>;
}

/// A verified member with an organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    pub user_id: Uuid,
    pub organization_id: Uuid,
}

/// Who triggered an operation, and therefore what it may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    Member(Member),
    Clock,
}

impl Caller {
    pub fn organization_id(&self) -> Option<Uuid> {
        match self {
            Caller::Member(m) => Some(m.organization_id),
            Caller::Clock => None,
        }
    }
}

/// Enforce the member-only contract on a resolved user.
pub fn require_member(user: &CurrentUser) -> PacResult<Member> {
    if user.role != Some(MemberRole::Member) {
        return Err(PacError::Forbidden("Only members can perform this action.".into()));
    }
    let organization_id = user.organization_id.ok_or_else(|| {
        PacError::BadRequest("User must belong to an organization.".into())
    })?;
    let user_id = user.id.ok_or_else(|| {
        PacError::BadGateway("Invalid user data received from authentication service.".into())
    })?;
    Ok(Member {
        user_id,
        organization_id,
    })
}

pub fn extract_bearer_token(headers: &HeaderMap) -> PacResult<String> {
    let raw = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(PacError::Unauthorized)?;

    if raw.len() < 7 || !raw[..6].eq_ignore_ascii_case("bearer") {
        return Err(PacError::Unauthorized);
    }
    let token = raw[6..].trim();
    if token.is_empty() {
        return Err(PacError::Unauthorized);
    }
    Ok(token.to_string())
}

/// Check the shared clock secret. Without a configured secret the
/// clock-triggered endpoints fail closed.
pub fn verify_clock_token(headers: &HeaderMap, expected: Option<&str>) -> PacResult<()> {
    let Some(expected) = expected.filter(|s| !s.is_empty()) else {
        return Err(PacError::Forbidden("Super clock access is disabled.".into()));
    };
    let provided = headers
        .get(SUPER_CLOCK_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim);
    match provided {
        Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => Ok(()),
        _ => Err(PacError::Forbidden("Invalid super clock token.".into())),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Authentication service client (`GET /auth/user`).
pub struct HttpAuthenticator {
    base_url: String,
    client: Client,
}

impl HttpAuthenticator {
    pub fn new(base_url: &str, timeout: Duration) -> PacResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PacError::Config(format!("failed to build auth client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    async fn current_user(&self, token: &str) -> PacResult<CurrentUser> {
        let resp = self
            .client
            .get(format!("{}/auth/user", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| {
                tracing::warn!(error=%err, "authentication service unreachable");
                PacError::Unavailable { service: SERVICE }
            })?;
        let status = resp.status();
        if !status.is_success() {
            let detail = resp
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(String::from))
                .unwrap_or_else(|| "Authentication service request failed".to_string());
            return Err(PacError::BadGateway(detail));
        }
        resp.json::<CurrentUser>().await.map_err(|_| {
            PacError::BadGateway("Invalid response from authentication service".into())
        })
    }
}
