// =============================================================================
// AUTH MODULE
// =============================================================================
// Session-token authentication and the authorization policy.
//
// Login verifies the bcrypt credential hash and stores a generated token in
// Redis (token -> user id) with a TTL; the AuthorizedUser extractor resolves
// the Bearer token back to a user row for every protected handler.
//
// All permission decisions run through one policy function, authorize():
// (actor, action, resource owner) -> allow/deny. Handlers and the database
// layer never hand-roll role conditionals.
// =============================================================================

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};
use redis::aio::ConnectionManager;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::SESSION_KEY_PREFIX;
use crate::error::{AppError, AppResult};
use crate::models::{Actor, Role, User};
use crate::AppState;

// =============================================================================
// POLICY
// =============================================================================

/// Every operation a caller can be allowed or denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    CreateBook,
    UpdateBook,
    DeleteBook,
    IssueBook,
    ReturnBook,
    TransferOwnership,
    ViewCatalog,
    ViewOwnershipHistory,
}

impl Action {
    fn describe(&self) -> &'static str {
        match self {
            Action::CreateBook => "create books",
            Action::UpdateBook => "update this book",
            Action::DeleteBook => "delete books",
            Action::IssueBook => "issue books",
            Action::ReturnBook => "process returns",
            Action::TransferOwnership => "transfer ownership of this book",
            Action::ViewCatalog => "view the catalog",
            Action::ViewOwnershipHistory => "view ownership history",
        }
    }
}

fn is_staff(role: Role) -> bool {
    matches!(role, Role::Admin | Role::Bookkeeper)
}

/// The single policy-evaluation function.
///
/// `resource_owner` carries the book's current owner for ownership-sensitive
/// actions; `None` means the owner is not yet known, in which case only the
/// role gate applies (the owner check runs again once the row is loaded).
pub fn authorize(actor: &Actor, action: Action, resource_owner: Option<Uuid>) -> AppResult<()> {
    let allowed = match action {
        // Any authenticated caller may read
        Action::ViewCatalog | Action::ViewOwnershipHistory => true,

        // Staff-only operations
        Action::CreateBook | Action::IssueBook | Action::ReturnBook => is_staff(actor.role),

        // Admin-only
        Action::DeleteBook => actor.role == Role::Admin,

        // Staff, and additionally the book's owner unless the actor is admin
        Action::UpdateBook | Action::TransferOwnership => {
            is_staff(actor.role)
                && match resource_owner {
                    Some(owner) => actor.role == Role::Admin || actor.id == owner,
                    None => true,
                }
        }
    };

    if allowed {
        Ok(())
    } else {
        Err(AppError::Forbidden(format!(
            "{} may not {}",
            actor.role.as_str(),
            action.describe()
        )))
    }
}

// =============================================================================
// CREDENTIALS
// =============================================================================

/// Hash a password for storage.
pub fn hash_password(password: &str) -> AppResult<String> {
    Ok(bcrypt::hash(password, bcrypt::DEFAULT_COST)?)
}

/// Verify a login attempt against the stored hash.
pub fn verify_password(password: &str, password_hash: &str) -> AppResult<bool> {
    Ok(bcrypt::verify(password, password_hash)?)
}

// =============================================================================
// SESSIONS
// =============================================================================
// Tokens are opaque (uuid hex) and live only in Redis; expiry is Redis TTL.

fn session_key(token: &str) -> String {
    format!("{}{}", SESSION_KEY_PREFIX, token)
}

/// Create a session for a user, returning the token to hand to the client.
pub async fn create_session(
    redis: &mut ConnectionManager,
    user_id: Uuid,
    ttl_seconds: u64,
) -> AppResult<String> {
    let token = Uuid::new_v4().simple().to_string();
    redis::cmd("SETEX")
        .arg(session_key(&token))
        .arg(ttl_seconds)
        .arg(user_id.to_string())
        .query_async::<_, ()>(redis)
        .await?;
    Ok(token)
}

/// Resolve a token to the user id it was issued for, if still valid.
pub async fn lookup_session(
    redis: &mut ConnectionManager,
    token: &str,
) -> AppResult<Option<Uuid>> {
    let value: Option<String> = redis::cmd("GET")
        .arg(session_key(token))
        .query_async(redis)
        .await?;
    match value {
        Some(raw) => Ok(Some(
            Uuid::parse_str(&raw).map_err(|_| AppError::Unauthenticated)?,
        )),
        None => Ok(None),
    }
}

/// Delete a session (logout). Deleting an unknown token is not an error.
pub async fn destroy_session(redis: &mut ConnectionManager, token: &str) -> AppResult<()> {
    redis::cmd("DEL")
        .arg(session_key(token))
        .query_async::<_, ()>(redis)
        .await?;
    Ok(())
}

// =============================================================================
// AUTHORIZED USER EXTRACTOR
// =============================================================================

/// The authenticated caller, resolved from the Bearer token before the
/// handler body runs. Adding this parameter to a handler protects the route.
pub struct AuthorizedUser {
    pub token: String,
    pub user: User,
}

impl AuthorizedUser {
    pub fn actor(&self) -> Actor {
        Actor::from(&self.user)
    }
}

/// Pull the token out of an `Authorization: Bearer <token>` header.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthorizedUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or(AppError::Unauthenticated)?;

        // Token -> user id (Redis), then user id -> user row (PostgreSQL)
        let mut redis = state.redis.clone();
        let user_id = lookup_session(&mut redis, &token)
            .await?
            .ok_or(AppError::Unauthenticated)?;

        let user = state
            .db
            .find_user(user_id)
            .await?
            .ok_or(AppError::Unauthenticated)?;

        Ok(Self { token, user })
    }
}

// =============================================================================
// TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn actor(role: Role) -> Actor {
        Actor {
            id: Uuid::new_v4(),
            role,
        }
    }

    #[test]
    fn test_staff_gate() {
        for action in [Action::CreateBook, Action::IssueBook, Action::ReturnBook] {
            assert!(authorize(&actor(Role::Admin), action, None).is_ok());
            assert!(authorize(&actor(Role::Bookkeeper), action, None).is_ok());
            assert!(matches!(
                authorize(&actor(Role::User), action, None),
                Err(AppError::Forbidden(_))
            ));
        }
    }

    #[test]
    fn test_delete_is_admin_only() {
        assert!(authorize(&actor(Role::Admin), Action::DeleteBook, None).is_ok());
        assert!(authorize(&actor(Role::Bookkeeper), Action::DeleteBook, None).is_err());
        assert!(authorize(&actor(Role::User), Action::DeleteBook, None).is_err());
    }

    #[test]
    fn test_ownership_sensitive_actions() {
        let owner = actor(Role::Bookkeeper);
        let other = actor(Role::Bookkeeper);
        let admin = actor(Role::Admin);

        for action in [Action::UpdateBook, Action::TransferOwnership] {
            // The owner may act on their own book
            assert!(authorize(&owner, action, Some(owner.id)).is_ok());
            // A different bookkeeper may not
            assert!(matches!(
                authorize(&other, action, Some(owner.id)),
                Err(AppError::Forbidden(_))
            ));
            // Admin overrides ownership
            assert!(authorize(&admin, action, Some(owner.id)).is_ok());
            // Plain users never pass the role gate
            assert!(authorize(&actor(Role::User), action, Some(owner.id)).is_err());
        }
    }

    #[test]
    fn test_reads_are_open_to_authenticated_callers() {
        for role in [Role::Admin, Role::Bookkeeper, Role::User] {
            assert!(authorize(&actor(role), Action::ViewCatalog, None).is_ok());
            assert!(authorize(&actor(role), Action::ViewOwnershipHistory, None).is_ok());
        }
    }

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc123"),
        );
        assert_eq!(bearer_token(&headers), Some("abc123".to_string()));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic xyz"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn test_password_round_trip() {
        let hash = hash_password("s3cret").unwrap();
        assert!(verify_password("s3cret", &hash).unwrap());
        assert!(!verify_password("wrong", &hash).unwrap());
    }
}
