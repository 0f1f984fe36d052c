//! Account table operations.
//!
//! The relay owns the whole password lifecycle here: registration never
//! overwrites an existing row, and hashing happens in the server layer
//! before the value reaches this crate.

use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Account;

impl Database {
    /// Insert a new account. Fails with [`StoreError::AccountExists`] if the
    /// user id is already taken.
    pub fn create_account(&self, user_id: &str, password_hash: &str) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO accounts (user_id, password_hash, created_at)
                 VALUES (?1, ?2, ?3)",
                params![user_id, password_hash, Utc::now().to_rfc3339()],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(f, _)
                    if f.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    StoreError::AccountExists
                }
                other => StoreError::Sqlite(other),
            })?;
        Ok(())
    }

    pub fn get_account(&self, user_id: &str) -> Result<Option<Account>> {
        match self.conn().query_row(
            "SELECT user_id, password_hash, created_at
             FROM accounts WHERE user_id = ?1",
            params![user_id],
            row_to_account,
        ) {
            Ok(account) => Ok(Some(account)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(other) => Err(StoreError::Sqlite(other)),
        }
    }

    pub fn account_exists(&self, user_id: &str) -> Result<bool> {
        let exists: bool = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM accounts WHERE user_id = ?1)",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Replace the stored password hash for an existing account.
    pub fn update_password(&self, user_id: &str, password_hash: &str) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE accounts SET password_hash = ?1 WHERE user_id = ?2",
            params![password_hash, user_id],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

fn row_to_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    let user_id: String = row.get(0)?;
    let password_hash: String = row.get(1)?;
    let ts_str: String = row.get(2)?;

    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Account {
        user_id,
        password_hash,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn test_create_and_get_account() {
        let (_dir, db) = open_test_db();

        db.create_account("alice", "deadbeef").unwrap();
        let account = db.get_account("alice").unwrap().unwrap();

        assert_eq!(account.user_id, "alice");
        assert_eq!(account.password_hash, "deadbeef");
        assert!(db.account_exists("alice").unwrap());
        assert!(!db.account_exists("bob").unwrap());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let (_dir, db) = open_test_db();

        db.create_account("alice", "hash1").unwrap();
        let err = db.create_account("alice", "hash2").unwrap_err();
        assert!(matches!(err, StoreError::AccountExists));

        // The original hash is untouched.
        let account = db.get_account("alice").unwrap().unwrap();
        assert_eq!(account.password_hash, "hash1");
    }

    #[test]
    fn test_update_password() {
        let (_dir, db) = open_test_db();

        db.create_account("alice", "old").unwrap();
        db.update_password("alice", "new").unwrap();

        let account = db.get_account("alice").unwrap().unwrap();
        assert_eq!(account.password_hash, "new");
    }

    #[test]
    fn test_update_password_missing_account() {
        let (_dir, db) = open_test_db();
        assert!(matches!(
            db.update_password("ghost", "x"),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_get_missing_account_is_none() {
        let (_dir, db) = open_test_db();
        assert!(db.get_account("nobody").unwrap().is_none());
    }
}
