use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;

use crate::Database;
use crate::error::{StoreError, StoreResult};
use crate::models::{UserRow, format_timestamp, parse_timestamp};

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, name: &str, email: &str, password_hash: &str) -> StoreResult<()> {
        self.with_conn(|conn| {
            if query_user_by_email(conn, email)?.is_some() {
                return Err(StoreError::Conflict(format!("email '{}' already exists", email)));
            }

            let now = format_timestamp(&Utc::now());
            conn.execute(
                "INSERT INTO users (id, name, email, password, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                rusqlite::params![id, name, email, password_hash, now],
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_email(&self, email: &str) -> StoreResult<Option<UserRow>> {
        self.with_conn(|conn| query_user_by_email(conn, email))
    }

    pub fn set_user_active(&self, email: &str, active: bool) -> StoreResult<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET active = ?1, updated_at = ?2 WHERE email = ?3",
                rusqlite::params![active, format_timestamp(&Utc::now()), email],
            )?;
            if changed == 0 {
                return Err(StoreError::user_not_found(email));
            }
            Ok(())
        })
    }

    // -- Email verification --

    pub fn set_email_otp(&self, email: &str, otp: &str, issued_at: DateTime<Utc>) -> StoreResult<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET email_otp = ?1, otp_generated_at = ?2, updated_at = ?2 WHERE email = ?3",
                rusqlite::params![otp, format_timestamp(&issued_at), email],
            )?;
            if changed == 0 {
                return Err(StoreError::user_not_found(email));
            }
            Ok(())
        })
    }

    /// Marks the email verified, clears the outstanding code and opens the
    /// password reset window.
    pub fn mark_email_verified(&self, email: &str) -> StoreResult<()> {
        self.with_conn(|conn| {
            let now = format_timestamp(&Utc::now());
            let changed = conn.execute(
                "UPDATE users
                 SET email_verified = 1, email_otp = NULL, otp_generated_at = NULL,
                     otp_verified_at = ?1, updated_at = ?1
                 WHERE email = ?2",
                rusqlite::params![now, email],
            )?;
            if changed == 0 {
                return Err(StoreError::user_not_found(email));
            }
            Ok(())
        })
    }

    // -- Profile --

    /// Renames the account and, when given, replaces the password hash.
    pub fn update_profile(&self, email: &str, name: &str, password_hash: Option<&str>) -> StoreResult<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET name = ?1, password = COALESCE(?2, password), updated_at = ?3 WHERE email = ?4",
                rusqlite::params![name, password_hash, format_timestamp(&Utc::now()), email],
            )?;
            if changed == 0 {
                return Err(StoreError::user_not_found(email));
            }
            Ok(())
        })
    }

    /// Replaces the password of an account whose OTP was verified less than
    /// `window` ago. The verification is spent by the reset.
    pub fn reset_password(&self, email: &str, password_hash: &str, window: Duration) -> StoreResult<()> {
        self.with_conn(|conn| {
            let user = query_user_by_email(conn, email)?.ok_or_else(|| StoreError::user_not_found(email))?;

            let verified_at = user.otp_verified_at.as_deref().and_then(parse_timestamp);
            let now = Utc::now();
            match verified_at {
                Some(at) if now - at <= window => {}
                _ => {
                    return Err(StoreError::Forbidden(format!(
                        "verify an OTP for {} before resetting the password",
                        email
                    )));
                }
            }

            conn.execute(
                "UPDATE users SET password = ?1, otp_verified_at = NULL, updated_at = ?2 WHERE email = ?3",
                rusqlite::params![password_hash, format_timestamp(&now), email],
            )?;
            Ok(())
        })
    }
}

fn query_user_by_email(conn: &Connection, email: &str) -> StoreResult<Option<UserRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, email, password, active, email_verified, email_otp, otp_generated_at, otp_verified_at,
                created_at
         FROM users WHERE email = ?1",
    )?;

    let row = stmt
        .query_row([email], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                name: row.get(1)?,
                email: row.get(2)?,
                password: row.get(3)?,
                active: row.get(4)?,
                email_verified: row.get(5)?,
                email_otp: row.get(6)?,
                otp_generated_at: row.get(7)?,
                otp_verified_at: row.get(8)?,
                created_at: row.get(9)?,
            })
        })
        .optional()?;

    Ok(row)
}

/// Extension trait for optional query results
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> StoreResult<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> StoreResult<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_email_conflicts() {
        let db = Database::open_in_memory().unwrap();
        db.create_user("u1", "Alice", "alice@example.com", "hash").unwrap();

        let err = db.create_user("u2", "Alice 2", "alice@example.com", "hash").unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn otp_cleared_on_verify() {
        let db = Database::open_in_memory().unwrap();
        db.create_user("u1", "Alice", "alice@example.com", "hash").unwrap();
        db.set_email_otp("alice@example.com", "123456", Utc::now()).unwrap();

        let user = db.get_user_by_email("alice@example.com").unwrap().unwrap();
        assert_eq!(user.email_otp.as_deref(), Some("123456"));
        assert!(!user.email_verified);

        db.mark_email_verified("alice@example.com").unwrap();
        let user = db.get_user_by_email("alice@example.com").unwrap().unwrap();
        assert!(user.email_verified);
        assert!(user.email_otp.is_none());
        assert!(user.otp_generated_at.is_none());
    }

    #[test]
    fn unknown_user_updates_fail() {
        let db = Database::open_in_memory().unwrap();
        let err = db.set_email_otp("ghost@example.com", "123456", Utc::now()).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { kind: "user", .. }));
    }

    #[test]
    fn profile_update_keeps_password_unless_given() {
        let db = Database::open_in_memory().unwrap();
        db.create_user("u1", "Alice", "alice@example.com", "hash-1").unwrap();

        db.update_profile("alice@example.com", "Alice B", None).unwrap();
        let user = db.get_user_by_email("alice@example.com").unwrap().unwrap();
        assert_eq!(user.name, "Alice B");
        assert_eq!(user.password, "hash-1");

        db.update_profile("alice@example.com", "Alice B", Some("hash-2")).unwrap();
        let user = db.get_user_by_email("alice@example.com").unwrap().unwrap();
        assert_eq!(user.password, "hash-2");

        let err = db.update_profile("ghost@example.com", "Ghost", None).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { kind: "user", .. }));
    }

    #[test]
    fn reset_needs_a_fresh_verification_and_spends_it() {
        let db = Database::open_in_memory().unwrap();
        db.create_user("u1", "Alice", "alice@example.com", "hash-1").unwrap();
        let window = Duration::minutes(10);

        let err = db.reset_password("alice@example.com", "hash-2", window).unwrap_err();
        assert!(matches!(err, StoreError::Forbidden(_)));

        db.set_email_otp("alice@example.com", "123456", Utc::now()).unwrap();
        db.mark_email_verified("alice@example.com").unwrap();
        db.reset_password("alice@example.com", "hash-2", window).unwrap();
        assert_eq!(
            db.get_user_by_email("alice@example.com").unwrap().unwrap().password,
            "hash-2"
        );

        let err = db.reset_password("alice@example.com", "hash-3", window).unwrap_err();
        assert!(matches!(err, StoreError::Forbidden(_)));
    }

    #[test]
    fn stale_verification_does_not_allow_reset() {
        let db = Database::open_in_memory().unwrap();
        db.create_user("u1", "Alice", "alice@example.com", "hash-1").unwrap();
        db.mark_email_verified("alice@example.com").unwrap();

        let err = db
            .reset_password("alice@example.com", "hash-2", Duration::seconds(-1))
            .unwrap_err();
        assert!(matches!(err, StoreError::Forbidden(_)));
    }
}
