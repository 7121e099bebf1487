// =============================================================================
// MODELS MODULE
// =============================================================================
// This module defines the data structures used throughout the service:
// the persisted entities (User, Book, Issue, OwnershipAudit), the role and
// status enums, the API request/response shapes, and the pure domain rules
// (status derivation, one-time code generation, return validation) that the
// database layer applies inside its transactions.
// =============================================================================

use chrono::{DateTime, NaiveDate, Utc};
use rand::{rngs::OsRng, Rng};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::config::OTP_LENGTH;
use crate::error::AppError;

// =============================================================================
// ROLES & STATUSES
// =============================================================================
// Declared once here; every call site uses these enums. The database stores
// them as PostgreSQL enum types created by the migrations.

/// User role. BOOKKEEPER is the canonical name for the staff role that may
/// hold book ownership; ADMIN may additionally delete books and override
/// ownership checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "user_role", rename_all = "UPPERCASE")]
pub enum Role {
    Admin,
    Bookkeeper,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "ADMIN",
            Role::Bookkeeper => "BOOKKEEPER",
            Role::User => "USER",
        }
    }
}

/// Book status. Only AVAILABLE and ISSUED are produced by this service;
/// RESERVED, MAINTENANCE and LOST are set by administrative action elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "book_status", rename_all = "UPPERCASE")]
pub enum BookStatus {
    Available,
    Issued,
    Reserved,
    Maintenance,
    Lost,
}

/// Loan status. This service only produces ISSUED -> RETURNED; OVERDUE and
/// LOST are set by out-of-scope processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "issue_status", rename_all = "UPPERCASE")]
pub enum IssueStatus {
    Issued,
    Returned,
    Overdue,
    Lost,
}

// =============================================================================
// ENTITIES
// =============================================================================

// -----------------------------------------------------------------------------
// USER
// -----------------------------------------------------------------------------
/// A user account. The credential hash never leaves the service.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct User {
    pub id: Uuid,

    pub name: String,

    /// Unique email, also the login identifier
    pub email: String,

    pub role: Role,

    /// bcrypt hash of the password; excluded from every API response
    #[serde(skip_serializing)]
    pub password_hash: String,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

// -----------------------------------------------------------------------------
// BOOK
// -----------------------------------------------------------------------------
/// A catalog record for a title, covering all physical copies of it.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Book {
    pub id: Uuid,

    /// Generated unique shelf tag, e.g. "BK-3FA27C1B"
    pub tag: String,

    pub title: String,

    pub author: String,

    /// Unique across the catalog
    pub isbn: String,

    pub genre: String,

    pub description: Option<String>,

    pub publication_date: NaiveDate,

    /// URL or path of the cover image, if any
    pub cover_image: Option<String>,

    /// Number of physical copies the library holds
    pub total_copies: i32,

    /// Copies currently on the shelf; always within [0, total_copies]
    pub available_copies: i32,

    pub status: BookStatus,

    /// The bookkeeper/admin administratively responsible for this record
    /// (not the borrower)
    pub owner_id: Uuid,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

// -----------------------------------------------------------------------------
// ISSUE (loan record)
// -----------------------------------------------------------------------------
/// One copy of a book lent to a user. Rows are never deleted by the service;
/// a successful return flips the status to RETURNED and stamps returned_at.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Issue {
    pub id: Uuid,

    pub book_id: Uuid,

    pub borrower_id: Uuid,

    pub issued_at: DateTime<Utc>,

    pub due_date: DateTime<Utc>,

    pub returned_at: Option<DateTime<Utc>>,

    pub status: IssueStatus,

    /// One-time return code; only the plaintext handed back at issue time
    /// leaves the service, never this stored copy
    #[serde(skip_serializing)]
    pub otp_code: String,

    #[serde(skip_serializing)]
    pub otp_expires_at: DateTime<Utc>,
}

// -----------------------------------------------------------------------------
// OWNERSHIP AUDIT
// -----------------------------------------------------------------------------
/// Append-only provenance entry for a book's administrative ownership.
/// from_owner_id is NULL only for the creation event.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct OwnershipAudit {
    pub id: Uuid,

    pub book_id: Uuid,

    pub from_owner_id: Option<Uuid>,

    pub to_owner_id: Uuid,

    /// The user who performed the transfer (may differ from either owner)
    pub performed_by: Uuid,

    pub note: String,

    pub created_at: DateTime<Utc>,
}

// -----------------------------------------------------------------------------
// ACTOR
// -----------------------------------------------------------------------------
/// The authenticated caller of an operation, as seen by the database layer.
#[derive(Debug, Clone, Copy)]
pub struct Actor {
    pub id: Uuid,
    pub role: Role,
}

impl From<&User> for Actor {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            role: user.role,
        }
    }
}

// =============================================================================
// API REQUEST STRUCTURES
// =============================================================================

/// Request body for POST /api/v1/auth/login
#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Request body for creating a book
///
/// # Example JSON
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
#[derive(Debug, Clone, Deserialize)]
pub struct CreateBookRequest {
    pub title: String,
    pub author: String,
    pub isbn: String,
    pub genre: String,
    pub publication_date: NaiveDate,
    pub total_copies: i32,
    pub description: Option<String>,
    pub cover_image: Option<String>,
}

impl CreateBookRequest {
    /// Reject malformed input before touching the store.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.title.trim().is_empty() {
            return Err(AppError::Validation("title must not be empty".into()));
        }
        if self.author.trim().is_empty() {
            return Err(AppError::Validation("author must not be empty".into()));
        }
        if self.genre.trim().is_empty() {
            return Err(AppError::Validation("genre must not be empty".into()));
        }
        validate_isbn(&self.isbn)?;
        if self.total_copies < 1 {
            return Err(AppError::Validation(
                "total_copies must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Distinguishes a field that was absent (outer `None`) from one supplied as
/// an explicit JSON null (`Some(None)`), so a partial update can clear a
/// nullable column.
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Request body for updating a book; only supplied fields are applied.
/// The nullable columns (description, cover image) accept an explicit null
/// to clear the stored value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateBookRequest {
    pub title: Option<String>,
    pub author: Option<String>,
    pub isbn: Option<String>,
    pub genre: Option<String>,
    pub publication_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "double_option")]
    pub description: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub cover_image: Option<Option<String>>,
    pub total_copies: Option<i32>,
}

impl UpdateBookRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        if matches!(&self.title, Some(t) if t.trim().is_empty()) {
            return Err(AppError::Validation("title must not be empty".into()));
        }
        if matches!(&self.author, Some(a) if a.trim().is_empty()) {
            return Err(AppError::Validation("author must not be empty".into()));
        }
        if matches!(&self.genre, Some(g) if g.trim().is_empty()) {
            return Err(AppError::Validation("genre must not be empty".into()));
        }
        if let Some(isbn) = &self.isbn {
            validate_isbn(isbn)?;
        }
        if matches!(self.total_copies, Some(n) if n < 1) {
            return Err(AppError::Validation(
                "total_copies must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Request body for issuing a book copy to a borrower
#[derive(Debug, Clone, Deserialize)]
pub struct IssueBookRequest {
    pub borrower_id: Uuid,
    pub due_date: DateTime<Utc>,
}

/// Request body for returning a book copy
#[derive(Debug, Clone, Deserialize)]
pub struct ReturnBookRequest {
    pub borrower_id: Uuid,
    /// The one-time code handed out at issue time
    pub code: String,
}

/// Request body for transferring administrative ownership of a book
#[derive(Debug, Clone, Deserialize)]
pub struct TransferOwnershipRequest {
    pub new_owner_id: Uuid,
    /// Free-text audit note; a default is generated when omitted
    pub note: Option<String>,
}

// =============================================================================
// API RESPONSE STRUCTURES
// =============================================================================

/// Response for a successful login
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: User,
}

/// Response for listing books with pagination metadata
#[derive(Debug, Serialize)]
pub struct BookListResponse {
    pub books: Vec<Book>,
    pub total: i64,
    pub page: i32,
    pub per_page: i32,
}

/// Response for a successful issue: the loan record plus the plaintext
/// one-time code (delivering it to the borrower is the caller's concern)
#[derive(Debug, Serialize)]
pub struct IssueBookResponse {
    pub issue: Issue,
    pub code: String,
}

/// Simple health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Detailed readiness check response
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub checks: ReadinessChecks,
}

/// Individual dependency health checks
#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    pub database: bool,
    pub redis: bool,
}

// =============================================================================
// ERROR RESPONSES
// =============================================================================

/// API error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error type/code
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// Optional additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
        }
    }
}

// =============================================================================
// DOMAIN RULES
// =============================================================================
// Pure functions applied by the database layer inside its transactions.
// They carry the invariants worth unit-testing without a live store.

/// Status derived from the available-copy counter: a book is ISSUED exactly
/// when no copy is on the shelf, AVAILABLE otherwise. Administrative statuses
/// (RESERVED, MAINTENANCE, LOST) are never produced here.
pub fn status_for_copies(available_copies: i32) -> BookStatus {
    if available_copies <= 0 {
        BookStatus::Issued
    } else {
        BookStatus::Available
    }
}

/// Generate a fixed-length numeric one-time code from the OS CSPRNG.
pub fn generate_one_time_code() -> String {
    let bound = 10u32.pow(OTP_LENGTH as u32);
    let n: u32 = OsRng.gen_range(0..bound);
    format!("{:0width$}", n, width = OTP_LENGTH)
}

/// Generate a unique shelf tag for a new book, e.g. "BK-3FA27C1B".
pub fn generate_book_tag() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("BK-{}", hex[..8].to_uppercase())
}

/// Validate a return attempt against the stored loan record.
///
/// Checked in order: code mismatch, then expiry. Both failures leave all
/// state untouched; the caller only mutates after this passes.
pub fn validate_return(issue: &Issue, code: &str, now: DateTime<Utc>) -> Result<(), AppError> {
    if issue.otp_code != code {
        return Err(AppError::InvalidCode);
    }
    if now > issue.otp_expires_at {
        return Err(AppError::CodeExpired);
    }
    Ok(())
}

/// Validate the target of an ownership transfer: the user must exist and
/// hold the BOOKKEEPER role (only bookkeepers may hold book ownership).
pub fn validate_new_owner(target: Option<&User>) -> Result<(), AppError> {
    match target {
        Some(user) if user.role == Role::Bookkeeper => Ok(()),
        Some(user) => Err(AppError::InvalidNewOwner(format!(
            "user {} does not hold the BOOKKEEPER role",
            user.id
        ))),
        None => Err(AppError::InvalidNewOwner(
            "target user does not exist".into(),
        )),
    }
}

/// The single default audit note used whenever the caller supplies none.
pub fn default_transfer_note(actor_role: Role) -> String {
    format!("Ownership transferred by {}", actor_role.as_str())
}

/// Audit note used for the creation event of a book.
pub const INITIAL_OWNERSHIP_NOTE: &str = "Initial book creation";

fn validate_isbn(isbn: &str) -> Result<(), AppError> {
    let isbn = isbn.trim();
    if isbn.is_empty() {
        return Err(AppError::Validation("isbn must not be empty".into()));
    }
    // Digits, hyphens and a trailing X (ISBN-10 check digit) only
    let well_formed = isbn
        .chars()
        .all(|c| c.is_ascii_digit() || c == '-' || c == 'X');
    if !well_formed || !(10..=17).contains(&isbn.len()) {
        return Err(AppError::Validation(format!(
            "isbn '{}' is not a valid ISBN",
            isbn
        )));
    }
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_issue(now: DateTime<Utc>) -> Issue {
        Issue {
            id: Uuid::new_v4(),
            book_id: Uuid::new_v4(),
            borrower_id: Uuid::new_v4(),
            issued_at: now,
            due_date: now + Duration::days(14),
            returned_at: None,
            status: IssueStatus::Issued,
            otp_code: "123456".to_string(),
            otp_expires_at: now + Duration::minutes(10),
        }
    }

    fn sample_user(role: Role) -> User {
        let now = Utc::now();
        User {
            id: Uuid::new_v4(),
            name: "Test User".to_string(),
            email: "test@library.local".to_string(),
            role,
            password_hash: "$2b$12$test".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_status_derivation() {
        assert_eq!(status_for_copies(0), BookStatus::Issued);
        assert_eq!(status_for_copies(1), BookStatus::Available);
        assert_eq!(status_for_copies(42), BookStatus::Available);
    }

    #[test]
    fn test_one_time_code_shape() {
        for _ in 0..100 {
            let code = generate_one_time_code();
            assert_eq!(code.len(), OTP_LENGTH);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_book_tag_shape() {
        let tag = generate_book_tag();
        assert!(tag.starts_with("BK-"));
        assert_eq!(tag.len(), 3 + 8);
    }

    #[test]
    fn test_return_accepts_matching_code_before_expiry() {
        let now = Utc::now();
        let issue = sample_issue(now);
        assert!(validate_return(&issue, "123456", now + Duration::minutes(5)).is_ok());
    }

    #[test]
    fn test_return_rejects_wrong_code() {
        let now = Utc::now();
        let issue = sample_issue(now);
        let err = validate_return(&issue, "654321", now).unwrap_err();
        assert!(matches!(err, AppError::InvalidCode));
    }

    #[test]
    fn test_return_rejects_expired_code_even_when_matching() {
        let now = Utc::now();
        let issue = sample_issue(now);
        let err = validate_return(&issue, "123456", now + Duration::minutes(11)).unwrap_err();
        assert!(matches!(err, AppError::CodeExpired));
    }

    #[test]
    fn test_wrong_code_reported_before_expiry() {
        // A mismatching code on an expired loan reports InvalidCode, not
        // CodeExpired: the mismatch check runs first.
        let now = Utc::now();
        let issue = sample_issue(now);
        let err = validate_return(&issue, "000000", now + Duration::hours(1)).unwrap_err();
        assert!(matches!(err, AppError::InvalidCode));
    }

    #[test]
    fn test_new_owner_must_be_bookkeeper() {
        let bookkeeper = sample_user(Role::Bookkeeper);
        let admin = sample_user(Role::Admin);
        let member = sample_user(Role::User);

        assert!(validate_new_owner(Some(&bookkeeper)).is_ok());
        assert!(matches!(
            validate_new_owner(Some(&admin)),
            Err(AppError::InvalidNewOwner(_))
        ));
        assert!(matches!(
            validate_new_owner(Some(&member)),
            Err(AppError::InvalidNewOwner(_))
        ));
        assert!(matches!(
            validate_new_owner(None),
            Err(AppError::InvalidNewOwner(_))
        ));
    }

    #[test]
    fn test_default_transfer_note() {
        assert_eq!(
            default_transfer_note(Role::Admin),
            "Ownership transferred by ADMIN"
        );
        assert_eq!(
            default_transfer_note(Role::Bookkeeper),
            "Ownership transferred by BOOKKEEPER"
        );
    }

    #[test]
    fn test_create_book_validation() {
        let valid = CreateBookRequest {
            title: "Title".into(),
            author: "Author".into(),
            isbn: "978-0000000001".into(),
            genre: "Fiction".into(),
            publication_date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            total_copies: 2,
            description: None,
            cover_image: None,
        };
        assert!(valid.validate().is_ok());

        let mut no_title = valid.clone();
        no_title.title = "  ".into();
        assert!(matches!(
            no_title.validate(),
            Err(AppError::Validation(_))
        ));

        let mut bad_isbn = valid.clone();
        bad_isbn.isbn = "not-an-isbn".into();
        assert!(matches!(
            bad_isbn.validate(),
            Err(AppError::Validation(_))
        ));

        let mut zero_copies = valid;
        zero_copies.total_copies = 0;
        assert!(matches!(
            zero_copies.validate(),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_update_book_validation_is_partial() {
        // An empty update is a no-op, not an error
        assert!(UpdateBookRequest::default().validate().is_ok());

        let bad = UpdateBookRequest {
            total_copies: Some(0),
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_update_request_distinguishes_null_from_absent() {
        // Absent field: keep the stored value
        let absent: UpdateBookRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(absent.description, None);
        assert_eq!(absent.cover_image, None);

        // Explicit null: clear the stored value
        let cleared: UpdateBookRequest =
            serde_json::from_str(r#"{"description": null, "cover_image": null}"#).unwrap();
        assert_eq!(cleared.description, Some(None));
        assert_eq!(cleared.cover_image, Some(None));

        // Supplied value: replace the stored value
        let set: UpdateBookRequest =
            serde_json::from_str(r#"{"description": "First edition"}"#).unwrap();
        assert_eq!(set.description, Some(Some("First edition".to_string())));
        assert_eq!(set.cover_image, None);
    }

    #[test]
    fn test_role_serde_uppercase() {
        assert_eq!(serde_json::to_string(&Role::Bookkeeper).unwrap(), "\"BOOKKEEPER\"");
        let role: Role = serde_json::from_str("\"ADMIN\"").unwrap();
        assert_eq!(role, Role::Admin);
    }

    #[test]
    fn test_issue_serialization_hides_code() {
        let issue = sample_issue(Utc::now());
        let json = serde_json::to_string(&issue).unwrap();
        assert!(!json.contains("otp_code"));
        assert!(!json.contains("123456"));
    }
}
