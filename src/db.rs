// =============================================================================
// DATABASE MODULE
// =============================================================================
// This module handles all PostgreSQL operations: the catalog (book CRUD),
// circulation (issue/return with one-time codes) and ownership transfer with
// its append-only audit trail.
//
// Every multi-write operation runs inside one transaction so a failure
// partway through leaves no partial mutation visible. The last-copy race on
// issue is settled by the store itself: the decrement is a conditional
// UPDATE guarded by `available_copies > 0`, on a row locked with FOR UPDATE.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::auth::{authorize, Action};
use crate::error::{AppError, AppResult};
use crate::models::{
    default_transfer_note, generate_book_tag, generate_one_time_code, status_for_copies,
    validate_new_owner, validate_return, Actor, Book, CreateBookRequest, Issue, IssueBookRequest,
    OwnershipAudit, ReturnBookRequest, TransferOwnershipRequest, UpdateBookRequest, User,
    INITIAL_OWNERSHIP_NOTE,
};

// -----------------------------------------------------------------------------
// SHARED SQL
// -----------------------------------------------------------------------------

/// Locked book lookup used by every catalog/circulation/ownership write path.
/// The row lock serializes concurrent writes against the same book until the
/// surrounding transaction commits.
const LOCK_BOOK_SQL: &str = r#"
    SELECT id, tag, title, author, isbn, genre, description,
           publication_date, cover_image, total_copies, available_copies,
           status, owner_id, created_at, updated_at
    FROM books
    WHERE id = $1
    FOR UPDATE
"#;

/// Translate a unique-violation on the books ISBN constraint into the typed
/// conflict; the pre-insert existence check cannot see a row another
/// uncommitted transaction is about to commit, so the constraint is the
/// final arbiter.
fn map_isbn_conflict(err: sqlx::Error, isbn: &str) -> AppError {
    if let sqlx::Error::Database(db_err) = &err {
        if matches!(db_err.kind(), sqlx::error::ErrorKind::UniqueViolation)
            && db_err.constraint() == Some("books_isbn_key")
        {
            return AppError::DuplicateIsbn(isbn.to_string());
        }
    }
    AppError::Database(err)
}

// -----------------------------------------------------------------------------
// DATABASE WRAPPER
// -----------------------------------------------------------------------------
// Wraps the SQLx connection pool and provides typed methods for all domain
// operations, keeping the SQL out of the handler layer.
#[derive(Clone)]
pub struct Database {
    /// SQLx PostgreSQL connection pool
    pool: PgPool,
}

impl Database {
    // -------------------------------------------------------------------------
    // CONNECTION
    // -------------------------------------------------------------------------
    /// Create a new database connection pool
    ///
    /// # Arguments
    /// * `database_url` - PostgreSQL connection string
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(2)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .idle_timeout(std::time::Duration::from_secs(300))
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self { pool })
    }

    // -------------------------------------------------------------------------
    // MIGRATIONS
    // -------------------------------------------------------------------------
    /// Create enum types, tables and indexes. Idempotent (safe to run on
    /// every startup).
    pub async fn run_migrations(&self) -> Result<()> {
        // Enum types; duplicate_object is swallowed so re-runs are no-ops
        for ddl in [
            r#"
            DO $$ BEGIN
                CREATE TYPE user_role AS ENUM ('ADMIN', 'BOOKKEEPER', 'USER');
            EXCEPTION WHEN duplicate_object THEN NULL;
            END $$
            "#,
            r#"
            DO $$ BEGIN
                CREATE TYPE book_status AS ENUM
                    ('AVAILABLE', 'ISSUED', 'RESERVED', 'MAINTENANCE', 'LOST');
            EXCEPTION WHEN duplicate_object THEN NULL;
            END $$
            "#,
            r#"
            DO $$ BEGIN
                CREATE TYPE issue_status AS ENUM ('ISSUED', 'RETURNED', 'OVERDUE', 'LOST');
            EXCEPTION WHEN duplicate_object THEN NULL;
            END $$
            "#,
        ] {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .context("Failed to create enum type")?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                name VARCHAR(255) NOT NULL,
                email VARCHAR(255) UNIQUE NOT NULL,
                role user_role NOT NULL DEFAULT 'USER',
                password_hash VARCHAR(255) NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create users table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS books (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),

                -- Generated unique shelf tag, e.g. BK-3FA27C1B
                tag VARCHAR(16) UNIQUE NOT NULL,

                title VARCHAR(512) NOT NULL,
                author VARCHAR(255) NOT NULL,

                -- ISBN must be unique across the catalog
                isbn VARCHAR(32) UNIQUE NOT NULL,

                genre VARCHAR(100) NOT NULL,
                description TEXT,
                publication_date DATE NOT NULL,
                cover_image TEXT,

                total_copies INTEGER NOT NULL,
                available_copies INTEGER NOT NULL,
                status book_status NOT NULL DEFAULT 'AVAILABLE',

                -- The bookkeeper/admin administratively responsible for the record
                owner_id UUID NOT NULL REFERENCES users(id),

                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

                CONSTRAINT positive_total CHECK (total_copies > 0),

                -- availableCopies stays within [0, totalCopies]
                CONSTRAINT copies_within_bounds
                    CHECK (available_copies >= 0 AND available_copies <= total_copies)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create books table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS issues (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                book_id UUID NOT NULL REFERENCES books(id) ON DELETE CASCADE,
                borrower_id UUID NOT NULL REFERENCES users(id),
                issued_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                due_date TIMESTAMPTZ NOT NULL,
                returned_at TIMESTAMPTZ,
                status issue_status NOT NULL DEFAULT 'ISSUED',

                -- One-time return code and its validity window
                otp_code VARCHAR(12) NOT NULL,
                otp_expires_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create issues table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ownership_audits (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                book_id UUID NOT NULL REFERENCES books(id) ON DELETE CASCADE,

                -- NULL only for the creation event
                from_owner_id UUID REFERENCES users(id),
                to_owner_id UUID NOT NULL REFERENCES users(id),
                performed_by UUID NOT NULL REFERENCES users(id),
                note TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create ownership_audits table")?;

        for idx in [
            "CREATE INDEX IF NOT EXISTS idx_books_isbn ON books(isbn)",
            "CREATE INDEX IF NOT EXISTS idx_issues_book_status ON issues(book_id, status)",
            "CREATE INDEX IF NOT EXISTS idx_issues_borrower ON issues(borrower_id)",
            "CREATE INDEX IF NOT EXISTS idx_audits_book_created
                 ON ownership_audits(book_id, created_at DESC)",
        ] {
            sqlx::query(idx)
                .execute(&self.pool)
                .await
                .context("Failed to create index")?;
        }

        Ok(())
    }

    /// Seed the bootstrap admin account when the users table is empty.
    pub async fn seed_admin(&self, email: &str, password: &str) -> Result<()> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;

        if count > 0 {
            return Ok(());
        }

        let password_hash = crate::auth::hash_password(password)?;

        sqlx::query(
            r#"
            INSERT INTO users (name, email, role, password_hash)
            VALUES ('Administrator', $1, 'ADMIN', $2)
            ON CONFLICT (email) DO NOTHING
            "#,
        )
        .bind(email)
        .bind(&password_hash)
        .execute(&self.pool)
        .await
        .context("Failed to seed bootstrap admin")?;

        tracing::info!(email = %email, "Seeded bootstrap admin account");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // USERS
    // -------------------------------------------------------------------------

    pub async fn find_user(&self, id: Uuid) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, name, email, role, password_hash, created_at, updated_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    pub async fn find_user_by_email(&self, email: &str) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, name, email, role, password_hash, created_at, updated_at
            FROM users
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    // -------------------------------------------------------------------------
    // CATALOG OPERATIONS
    // -------------------------------------------------------------------------

    /// Fetch a book inside a transaction, taking a row lock held until the
    /// transaction commits. All write paths go through this.
    async fn lock_book(&self, tx: &mut Transaction<'_, Postgres>, id: Uuid) -> AppResult<Book> {
        sqlx::query_as::<_, Book>(LOCK_BOOK_SQL)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("book {} does not exist", id)))
    }

    /// Create a book record owned by the caller, together with its initial
    /// ownership audit entry, in one transaction.
    pub async fn create_book(&self, req: &CreateBookRequest, creator: Actor) -> AppResult<Book> {
        authorize(&creator, Action::CreateBook, None)?;

        let mut tx = self.pool.begin().await?;

        // ISBN uniqueness; checked up front so the common case is a typed
        // conflict without touching the constraint. A racing insert that
        // slips past this check is caught by map_isbn_conflict below.
        let isbn_taken: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM books WHERE isbn = $1)")
                .bind(req.isbn.trim())
                .fetch_one(&mut *tx)
                .await?;
        if isbn_taken {
            return Err(AppError::DuplicateIsbn(req.isbn.trim().to_string()));
        }

        let book = sqlx::query_as::<_, Book>(
            r#"
            INSERT INTO books
                (tag, title, author, isbn, genre, description, publication_date,
                 cover_image, total_copies, available_copies, status, owner_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9, 'AVAILABLE', $10)
            RETURNING id, tag, title, author, isbn, genre, description,
                      publication_date, cover_image, total_copies, available_copies,
                      status, owner_id, created_at, updated_at
            "#,
        )
        .bind(generate_book_tag())
        .bind(req.title.trim())
        .bind(req.author.trim())
        .bind(req.isbn.trim())
        .bind(req.genre.trim())
        .bind(&req.description)
        .bind(req.publication_date)
        .bind(&req.cover_image)
        .bind(req.total_copies)
        .bind(creator.id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_isbn_conflict(e, req.isbn.trim()))?;

        // Creation event: from_owner is NULL, the creator receives ownership
        sqlx::query(
            r#"
            INSERT INTO ownership_audits (book_id, from_owner_id, to_owner_id, performed_by, note)
            VALUES ($1, NULL, $2, $2, $3)
            "#,
        )
        .bind(book.id)
        .bind(creator.id)
        .bind(INITIAL_OWNERSHIP_NOTE)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(book)
    }

    /// List books with pagination.
    ///
    /// # Returns
    /// Tuple of (books, total_count)
    pub async fn list_books(&self, page: i32, per_page: i32) -> AppResult<(Vec<Book>, i64)> {
        let offset = (page - 1) * per_page;

        let books = sqlx::query_as::<_, Book>(
            r#"
            SELECT id, tag, title, author, isbn, genre, description,
                   publication_date, cover_image, total_copies, available_copies,
                   status, owner_id, created_at, updated_at
            FROM books
            ORDER BY title ASC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(per_page)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM books")
            .fetch_one(&self.pool)
            .await?;

        Ok((books, total))
    }

    pub async fn find_book(&self, id: Uuid) -> AppResult<Option<Book>> {
        let book = sqlx::query_as::<_, Book>(
            r#"
            SELECT id, tag, title, author, isbn, genre, description,
                   publication_date, cover_image, total_copies, available_copies,
                   status, owner_id, created_at, updated_at
            FROM books
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(book)
    }

    /// Apply a partial update. Only the book's owner or an admin may update;
    /// changing the ISBN to one held by another book is a conflict. Shrinking
    /// total_copies clamps available_copies into the new bounds.
    pub async fn update_book(
        &self,
        id: Uuid,
        req: &UpdateBookRequest,
        actor: Actor,
    ) -> AppResult<Book> {
        let mut tx = self.pool.begin().await?;

        let current = self.lock_book(&mut tx, id).await?;

        authorize(&actor, Action::UpdateBook, Some(current.owner_id))?;

        if let Some(new_isbn) = req.isbn.as_deref().map(str::trim) {
            if new_isbn != current.isbn {
                let taken: bool = sqlx::query_scalar(
                    "SELECT EXISTS(SELECT 1 FROM books WHERE isbn = $1 AND id <> $2)",
                )
                .bind(new_isbn)
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
                if taken {
                    return Err(AppError::DuplicateIsbn(new_isbn.to_string()));
                }
            }
        }

        // COALESCE keeps every unsupplied field as-is. The two nullable
        // columns instead carry a supplied flag, so an explicit JSON null
        // clears them (COALESCE cannot express that). Changing total_copies
        // preserves the number of outstanding loans (total - available), so
        // available becomes new_total - outstanding, floored at zero; the
        // status CASE keeps the AVAILABLE/ISSUED pair consistent with that
        // counter while leaving administrative statuses alone.
        let book = sqlx::query_as::<_, Book>(
            r#"
            UPDATE books SET
                title = COALESCE($2, title),
                author = COALESCE($3, author),
                isbn = COALESCE($4, isbn),
                genre = COALESCE($5, genre),
                publication_date = COALESCE($6, publication_date),
                description = CASE WHEN $7 THEN $8 ELSE description END,
                cover_image = CASE WHEN $9 THEN $10 ELSE cover_image END,
                total_copies = COALESCE($11, total_copies),
                available_copies = GREATEST(
                    COALESCE($11, total_copies) - (total_copies - available_copies), 0),
                status = CASE
                    WHEN status IN ('AVAILABLE', 'ISSUED') THEN
                        (CASE
                            WHEN GREATEST(
                                COALESCE($11, total_copies)
                                    - (total_copies - available_copies), 0) <= 0
                                THEN 'ISSUED'
                            ELSE 'AVAILABLE'
                        END)::book_status
                    ELSE status
                END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, tag, title, author, isbn, genre, description,
                      publication_date, cover_image, total_copies, available_copies,
                      status, owner_id, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(req.title.as_deref().map(str::trim))
        .bind(req.author.as_deref().map(str::trim))
        .bind(req.isbn.as_deref().map(str::trim))
        .bind(req.genre.as_deref().map(str::trim))
        .bind(req.publication_date)
        .bind(req.description.is_some())
        .bind(req.description.clone().flatten())
        .bind(req.cover_image.is_some())
        .bind(req.cover_image.clone().flatten())
        .bind(req.total_copies)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            let isbn = req.isbn.as_deref().map(str::trim).unwrap_or(&current.isbn);
            map_isbn_conflict(e, isbn)
        })?;

        tx.commit().await?;

        Ok(book)
    }

    /// Delete a book. Blocked while any loan for it is still ISSUED; the
    /// issue/audit history of a deletable book goes with it via FK cascade.
    pub async fn delete_book(&self, id: Uuid, actor: Actor) -> AppResult<()> {
        authorize(&actor, Action::DeleteBook, None)?;

        let mut tx = self.pool.begin().await?;

        // Lock the book row so the loan count below cannot race an in-flight
        // issue transaction for the same book
        self.lock_book(&mut tx, id).await?;

        let active_loans: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM issues WHERE book_id = $1 AND status = 'ISSUED'",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        if active_loans > 0 {
            return Err(AppError::HasActiveLoans(active_loans));
        }

        sqlx::query("DELETE FROM books WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }

    // -------------------------------------------------------------------------
    // CIRCULATION OPERATIONS
    // -------------------------------------------------------------------------

    /// Issue one copy of a book to a borrower.
    ///
    /// Creates the loan row, decrements the available-copy counter and flips
    /// the book to ISSUED when the last copy leaves the shelf, all in one
    /// transaction. Returns the loan plus the plaintext one-time code.
    pub async fn issue_book(
        &self,
        book_id: Uuid,
        req: &IssueBookRequest,
        actor: Actor,
        otp_ttl_minutes: i64,
    ) -> AppResult<(Issue, String)> {
        authorize(&actor, Action::IssueBook, None)?;

        let mut tx = self.pool.begin().await?;

        // Lock the book row; the availability check and the decrement below
        // see the same state
        let book = self.lock_book(&mut tx, book_id).await?;

        let borrower_exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE id = $1)")
                .bind(req.borrower_id)
                .fetch_one(&mut *tx)
                .await?;
        if !borrower_exists {
            return Err(AppError::NotFound(format!(
                "user {} does not exist",
                req.borrower_id
            )));
        }

        if book.available_copies <= 0 {
            return Err(AppError::NoCopiesAvailable);
        }

        let now = Utc::now();
        let code = generate_one_time_code();
        let expires_at = now + Duration::minutes(otp_ttl_minutes);

        let issue = sqlx::query_as::<_, Issue>(
            r#"
            INSERT INTO issues
                (book_id, borrower_id, issued_at, due_date, status, otp_code, otp_expires_at)
            VALUES ($1, $2, $3, $4, 'ISSUED', $5, $6)
            RETURNING id, book_id, borrower_id, issued_at, due_date, returned_at,
                      status, otp_code, otp_expires_at
            "#,
        )
        .bind(book_id)
        .bind(req.borrower_id)
        .bind(now)
        .bind(req.due_date)
        .bind(&code)
        .bind(expires_at)
        .fetch_one(&mut *tx)
        .await?;

        // Conditional decrement; the guard makes the last-copy race a store
        // decision rather than an application one
        let new_status = status_for_copies(book.available_copies - 1);
        let updated = sqlx::query(
            r#"
            UPDATE books
            SET available_copies = available_copies - 1,
                status = $2,
                updated_at = NOW()
            WHERE id = $1 AND available_copies > 0
            "#,
        )
        .bind(book_id)
        .bind(new_status)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(AppError::NoCopiesAvailable);
        }

        tx.commit().await?;

        Ok((issue, code))
    }

    /// Process a return. The loan is located by (book, borrower, ISSUED); the
    /// supplied code must match the stored one and still be inside its
    /// validity window. Both writes (loan flip, counter increment) commit
    /// together.
    pub async fn return_book(
        &self,
        book_id: Uuid,
        req: &ReturnBookRequest,
        actor: Actor,
    ) -> AppResult<Issue> {
        authorize(&actor, Action::ReturnBook, None)?;

        let mut tx = self.pool.begin().await?;

        // Lock the loan row so two concurrent returns cannot both pass
        // validation
        let issue = sqlx::query_as::<_, Issue>(
            r#"
            SELECT id, book_id, borrower_id, issued_at, due_date, returned_at,
                   status, otp_code, otp_expires_at
            FROM issues
            WHERE book_id = $1 AND borrower_id = $2 AND status = 'ISSUED'
            ORDER BY issued_at ASC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(book_id)
        .bind(req.borrower_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!(
                "no active loan of book {} for user {}",
                book_id, req.borrower_id
            ))
        })?;

        let now = Utc::now();
        validate_return(&issue, req.code.trim(), now)?;

        let returned = sqlx::query_as::<_, Issue>(
            r#"
            UPDATE issues
            SET status = 'RETURNED', returned_at = $2
            WHERE id = $1
            RETURNING id, book_id, borrower_id, issued_at, due_date, returned_at,
                      status, otp_code, otp_expires_at
            "#,
        )
        .bind(issue.id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        // A returned copy always makes the book available
        sqlx::query(
            r#"
            UPDATE books
            SET available_copies = LEAST(available_copies + 1, total_copies),
                status = 'AVAILABLE',
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(book_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(returned)
    }

    /// Loans still ISSUED past their due date, oldest first. Read-only; the
    /// OVERDUE status itself is set by an out-of-scope process.
    pub async fn list_overdue_issues(&self) -> AppResult<Vec<Issue>> {
        let issues = sqlx::query_as::<_, Issue>(
            r#"
            SELECT id, book_id, borrower_id, issued_at, due_date, returned_at,
                   status, otp_code, otp_expires_at
            FROM issues
            WHERE status = 'ISSUED' AND due_date < NOW()
            ORDER BY due_date ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(issues)
    }

    // -------------------------------------------------------------------------
    // OWNERSHIP OPERATIONS
    // -------------------------------------------------------------------------

    /// Reassign the administrative owner of a book and append the audit
    /// entry, atomically. Only bookkeepers may receive ownership; only the
    /// current owner or an admin may hand it over; transferring to the
    /// current owner is rejected without writing anything.
    pub async fn transfer_ownership(
        &self,
        book_id: Uuid,
        req: &TransferOwnershipRequest,
        actor: Actor,
    ) -> AppResult<Book> {
        let mut tx = self.pool.begin().await?;

        let book = self.lock_book(&mut tx, book_id).await?;

        let target = sqlx::query_as::<_, User>(
            r#"
            SELECT id, name, email, role, password_hash, created_at, updated_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(req.new_owner_id)
        .fetch_optional(&mut *tx)
        .await?;

        validate_new_owner(target.as_ref())?;
        authorize(&actor, Action::TransferOwnership, Some(book.owner_id))?;

        if req.new_owner_id == book.owner_id {
            return Err(AppError::NoOpTransfer);
        }

        let note = req
            .note
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(String::from)
            .unwrap_or_else(|| default_transfer_note(actor.role));

        let updated = sqlx::query_as::<_, Book>(
            r#"
            UPDATE books
            SET owner_id = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING id, tag, title, author, isbn, genre, description,
                      publication_date, cover_image, total_copies, available_copies,
                      status, owner_id, created_at, updated_at
            "#,
        )
        .bind(book_id)
        .bind(req.new_owner_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO ownership_audits (book_id, from_owner_id, to_owner_id, performed_by, note)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(book_id)
        .bind(book.owner_id)
        .bind(req.new_owner_id)
        .bind(actor.id)
        .bind(&note)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(updated)
    }

    /// Full provenance chain for a book's ownership, newest first.
    pub async fn ownership_history(&self, book_id: Uuid) -> AppResult<Vec<OwnershipAudit>> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM books WHERE id = $1)")
            .bind(book_id)
            .fetch_one(&self.pool)
            .await?;
        if !exists {
            return Err(AppError::NotFound(format!(
                "book {} does not exist",
                book_id
            )));
        }

        let audits = sqlx::query_as::<_, OwnershipAudit>(
            r#"
            SELECT id, book_id, from_owner_id, to_owner_id, performed_by, note, created_at
            FROM ownership_audits
            WHERE book_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(book_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(audits)
    }

    // -------------------------------------------------------------------------
    // HEALTH CHECK
    // -------------------------------------------------------------------------

    /// Check if database connection is healthy
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }
}

// =============================================================================
// TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    // Stands in for a PostgreSQL constraint violation
    #[derive(Debug)]
    struct StubConstraintViolation(&'static str);

    impl std::fmt::Display for StubConstraintViolation {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "duplicate key value violates unique constraint \"{}\"", self.0)
        }
    }

    impl std::error::Error for StubConstraintViolation {}

    impl sqlx::error::DatabaseError for StubConstraintViolation {
        fn message(&self) -> &str {
            "duplicate key value violates unique constraint"
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            sqlx::error::ErrorKind::UniqueViolation
        }

        fn constraint(&self) -> Option<&str> {
            Some(self.0)
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }
    }

    #[test]
    fn test_write_paths_lock_the_book_row() {
        assert!(LOCK_BOOK_SQL.trim_end().ends_with("FOR UPDATE"));
    }

    #[test]
    fn test_isbn_unique_violation_becomes_typed_conflict() {
        let err = sqlx::Error::Database(Box::new(StubConstraintViolation("books_isbn_key")));
        match map_isbn_conflict(err, "978-0000000001") {
            AppError::DuplicateIsbn(isbn) => assert_eq!(isbn, "978-0000000001"),
            other => panic!("expected DuplicateIsbn, got {:?}", other),
        }
    }

    #[test]
    fn test_other_unique_violations_stay_infrastructure_errors() {
        let err = sqlx::Error::Database(Box::new(StubConstraintViolation("books_tag_key")));
        assert!(matches!(
            map_isbn_conflict(err, "978-0000000001"),
            AppError::Database(_)
        ));
    }

    #[test]
    fn test_non_database_errors_pass_through() {
        assert!(matches!(
            map_isbn_conflict(sqlx::Error::RowNotFound, "978-0000000001"),
            AppError::Database(_)
        ));
    }
}
