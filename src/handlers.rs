// =============================================================================
// HANDLERS MODULE
// =============================================================================
// This module contains all HTTP request handlers (controller layer).
//
// Protected routes take the AuthorizedUser extractor, which resolves the
// Bearer token before the handler body runs; role and ownership checks then
// run through the policy function inside the database layer. Handlers only
// validate input shape, call the store, and record telemetry.
// =============================================================================

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::auth::{self, AuthorizedUser};
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::*;
use crate::AppState;

// =============================================================================
// HEALTH CHECK ENDPOINTS
// =============================================================================

/// Liveness probe - Is the service running?
///
/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "library-service".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness probe - Are PostgreSQL and Redis reachable?
///
/// GET /ready
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReadinessResponse>, StatusCode> {
    let db_healthy = state.db.health_check().await;

    let redis_healthy = redis::cmd("PING")
        .query_async::<_, String>(&mut state.redis.clone())
        .await
        .is_ok();

    let all_healthy = db_healthy && redis_healthy;
    let status = if all_healthy { "ready" } else { "not_ready" };

    let response = ReadinessResponse {
        status: status.to_string(),
        checks: ReadinessChecks {
            database: db_healthy,
            redis: redis_healthy,
        },
    };

    if all_healthy {
        Ok(Json(response))
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

// =============================================================================
// METRICS ENDPOINT
// =============================================================================
/// Prometheus metrics endpoint
///
/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

// =============================================================================
// AUTH ENDPOINTS
// =============================================================================

/// Log in with email and password; returns a session token
///
/// POST /api/v1/auth/login
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LoginRequest>,
) -> AppResult<Json<LoginResponse>> {
    let start = Instant::now();

    // One failure path for both unknown email and wrong password
    let user = state
        .db
        .find_user_by_email(request.email.trim())
        .await?
        .ok_or(AppError::Unauthenticated)?;

    if !auth::verify_password(&request.password, &user.password_hash)? {
        return Err(AppError::Unauthenticated);
    }

    let mut redis = state.redis.clone();
    let token = auth::create_session(&mut redis, user.id, state.config.session_ttl_seconds).await?;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("POST", "/api/v1/auth/login", 200, duration);
    metrics::record_redis_operation("setex", duration);

    tracing::info!(user_id = %user.id, role = user.role.as_str(), "User logged in");

    Ok(Json(LoginResponse { token, user }))
}

/// Invalidate the caller's session token
///
/// POST /api/v1/auth/logout
pub async fn logout(
    State(state): State<Arc<AppState>>,
    user: AuthorizedUser,
) -> AppResult<Json<serde_json::Value>> {
    let mut redis = state.redis.clone();
    auth::destroy_session(&mut redis, &user.token).await?;

    tracing::info!(user_id = %user.user.id, "User logged out");

    Ok(Json(serde_json::json!({ "status": "logged_out" })))
}

// =============================================================================
// CATALOG ENDPOINTS
// =============================================================================

/// Query parameters for the book list
///
/// # Example
/// GET /api/v1/books?page=2&per_page=20
#[derive(Debug, Deserialize)]
pub struct ListParams {
    /// Page number (1-indexed, default: 1)
    #[serde(default = "default_page")]
    pub page: i32,

    /// Items per page (default: 20, max: 100)
    #[serde(default = "default_per_page")]
    pub per_page: i32,
}

fn default_page() -> i32 {
    1
}
fn default_per_page() -> i32 {
    20
}

/// List the catalog with pagination
///
/// GET /api/v1/books
pub async fn list_books(
    State(state): State<Arc<AppState>>,
    _user: AuthorizedUser,
    Query(params): Query<ListParams>,
) -> AppResult<Json<BookListResponse>> {
    let start = Instant::now();

    let page = params.page.max(1);
    let per_page = params.per_page.clamp(1, 100);

    let (books, total) = state.db.list_books(page, per_page).await?;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("GET", "/api/v1/books", 200, duration);
    metrics::record_db_query("select", duration);

    for book in &books {
        metrics::set_available_copies(&book.tag, book.available_copies);
    }

    Ok(Json(BookListResponse {
        books,
        total,
        page,
        per_page,
    }))
}

/// Fetch a single book
///
/// GET /api/v1/books/:id
pub async fn get_book(
    State(state): State<Arc<AppState>>,
    _user: AuthorizedUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Book>> {
    let start = Instant::now();

    let book = state
        .db
        .find_book(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("book {} does not exist", id)))?;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("GET", "/api/v1/books/:id", 200, duration);
    metrics::record_db_query("select", duration);

    Ok(Json(book))
}

/// Create a book record
///
/// POST /api/v1/books
///
/// # Request Body
/// ```json
/// {
///   "title": "The Rust Programming Language",
///   "author": "Klabnik & Nichols",
///   "isbn": "978-1593278281",
///   "genre": "Programming",
///   "publication_date": "2019-08-06",
///   "total_copies": 3
/// }
/// ```
///
/// # Response
/// - 201 Created: the book, owned by the caller
/// - 409 Conflict: ISBN already in use
pub async fn create_book(
    State(state): State<Arc<AppState>>,
    user: AuthorizedUser,
    Json(request): Json<CreateBookRequest>,
) -> AppResult<(StatusCode, Json<Book>)> {
    let start = Instant::now();

    request.validate()?;

    tracing::info!(
        isbn = %request.isbn,
        title = %request.title,
        caller = %user.user.id,
        "Creating book"
    );

    let book = state.db.create_book(&request, user.actor()).await?;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("POST", "/api/v1/books", 201, duration);
    metrics::record_db_query("insert", duration);
    metrics::set_available_copies(&book.tag, book.available_copies);

    Ok((StatusCode::CREATED, Json(book)))
}

/// Update a book (partial; only supplied fields are applied)
///
/// PUT /api/v1/books/:id
pub async fn update_book(
    State(state): State<Arc<AppState>>,
    user: AuthorizedUser,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateBookRequest>,
) -> AppResult<Json<Book>> {
    let start = Instant::now();

    request.validate()?;

    let book = state.db.update_book(id, &request, user.actor()).await?;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("PUT", "/api/v1/books/:id", 200, duration);
    metrics::record_db_query("update", duration);
    metrics::set_available_copies(&book.tag, book.available_copies);

    tracing::info!(book_id = %id, caller = %user.user.id, "Book updated");

    Ok(Json(book))
}

/// Delete a book (admin only; blocked while loans are outstanding)
///
/// DELETE /api/v1/books/:id
pub async fn delete_book(
    State(state): State<Arc<AppState>>,
    user: AuthorizedUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    let start = Instant::now();

    state.db.delete_book(id, user.actor()).await?;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("DELETE", "/api/v1/books/:id", 200, duration);
    metrics::record_db_query("delete", duration);

    tracing::info!(book_id = %id, caller = %user.user.id, "Book deleted");

    Ok(Json(serde_json::json!({
        "status": "deleted",
        "id": id
    })))
}

// =============================================================================
// CIRCULATION ENDPOINTS
// =============================================================================

/// Issue a copy of a book to a borrower
///
/// POST /api/v1/books/:id/issue
///
/// # Request Body
/// ```json
/// {
///   "borrower_id": "7d5c...",
///   "due_date": "2026-09-06T00:00:00Z"
/// }
/// ```
///
/// # Response
/// - 200 OK: the loan record plus the plaintext one-time return code
/// - 409 Conflict: no copies available
pub async fn issue_book(
    State(state): State<Arc<AppState>>,
    user: AuthorizedUser,
    Path(book_id): Path<Uuid>,
    Json(request): Json<IssueBookRequest>,
) -> AppResult<Json<IssueBookResponse>> {
    let start = Instant::now();

    tracing::info!(
        book_id = %book_id,
        borrower_id = %request.borrower_id,
        caller = %user.user.id,
        "Issuing book"
    );

    let result = state
        .db
        .issue_book(
            book_id,
            &request,
            user.actor(),
            state.config.otp_ttl_minutes,
        )
        .await;

    let duration = start.elapsed().as_secs_f64();

    match result {
        Ok((issue, code)) => {
            metrics::record_http_request("POST", "/api/v1/books/:id/issue", 200, duration);
            metrics::record_issue(true);

            tracing::info!(issue_id = %issue.id, "Book issued");

            Ok(Json(IssueBookResponse { issue, code }))
        }
        Err(e) => {
            metrics::record_http_request(
                "POST",
                "/api/v1/books/:id/issue",
                e.status_code().as_u16(),
                duration,
            );
            metrics::record_issue(false);

            tracing::warn!(book_id = %book_id, error = %e, "Failed to issue book");

            Err(e)
        }
    }
}

/// Return a copy of a book, verified by the one-time code
///
/// POST /api/v1/books/:id/return
///
/// # Request Body
/// ```json
/// {
///   "borrower_id": "7d5c...",
///   "code": "481526"
/// }
/// ```
pub async fn return_book(
    State(state): State<Arc<AppState>>,
    user: AuthorizedUser,
    Path(book_id): Path<Uuid>,
    Json(request): Json<ReturnBookRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let start = Instant::now();

    tracing::info!(
        book_id = %book_id,
        borrower_id = %request.borrower_id,
        caller = %user.user.id,
        "Processing return"
    );

    let result = state.db.return_book(book_id, &request, user.actor()).await;

    let duration = start.elapsed().as_secs_f64();

    match result {
        Ok(issue) => {
            metrics::record_http_request("POST", "/api/v1/books/:id/return", 200, duration);
            metrics::record_return(true);

            tracing::info!(issue_id = %issue.id, "Book returned");

            Ok(Json(serde_json::json!({
                "status": "returned",
                "issue": issue
            })))
        }
        Err(e) => {
            metrics::record_http_request(
                "POST",
                "/api/v1/books/:id/return",
                e.status_code().as_u16(),
                duration,
            );
            metrics::record_return(false);

            tracing::warn!(book_id = %book_id, error = %e, "Failed to process return");

            Err(e)
        }
    }
}

/// List loans past their due date
///
/// GET /api/v1/issues/overdue
pub async fn list_overdue(
    State(state): State<Arc<AppState>>,
    _user: AuthorizedUser,
) -> AppResult<Json<Vec<Issue>>> {
    let start = Instant::now();

    let issues = state.db.list_overdue_issues().await?;

    metrics::set_overdue_loans(issues.len() as i64);

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("GET", "/api/v1/issues/overdue", 200, duration);

    Ok(Json(issues))
}

// =============================================================================
// OWNERSHIP ENDPOINTS
// =============================================================================

/// Transfer administrative ownership of a book to another bookkeeper
///
/// POST /api/v1/books/:id/transfer
///
/// # Request Body
/// ```json
/// {
///   "new_owner_id": "9f31...",
///   "note": "Handover before leave"
/// }
/// ```
pub async fn transfer_ownership(
    State(state): State<Arc<AppState>>,
    user: AuthorizedUser,
    Path(book_id): Path<Uuid>,
    Json(request): Json<TransferOwnershipRequest>,
) -> AppResult<Json<Book>> {
    let start = Instant::now();

    tracing::info!(
        book_id = %book_id,
        new_owner_id = %request.new_owner_id,
        caller = %user.user.id,
        "Transferring ownership"
    );

    let result = state
        .db
        .transfer_ownership(book_id, &request, user.actor())
        .await;

    let duration = start.elapsed().as_secs_f64();

    match result {
        Ok(book) => {
            metrics::record_http_request("POST", "/api/v1/books/:id/transfer", 200, duration);
            metrics::record_transfer(true);

            tracing::info!(book_id = %book_id, owner_id = %book.owner_id, "Ownership transferred");

            Ok(Json(book))
        }
        Err(e) => {
            metrics::record_http_request(
                "POST",
                "/api/v1/books/:id/transfer",
                e.status_code().as_u16(),
                duration,
            );
            metrics::record_transfer(false);

            tracing::warn!(book_id = %book_id, error = %e, "Failed to transfer ownership");

            Err(e)
        }
    }
}

/// Full ownership provenance of a book, newest first
///
/// GET /api/v1/books/:id/ownership-history
pub async fn ownership_history(
    State(state): State<Arc<AppState>>,
    _user: AuthorizedUser,
    Path(book_id): Path<Uuid>,
) -> AppResult<Json<Vec<OwnershipAudit>>> {
    let start = Instant::now();

    let audits = state.db.ownership_history(book_id).await?;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("GET", "/api/v1/books/:id/ownership-history", 200, duration);
    metrics::record_db_query("select", duration);

    Ok(Json(audits))
}
