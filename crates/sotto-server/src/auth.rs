//! Account registration and credential checks.

use subtle::ConstantTimeEq;

use sotto_shared::constants::KDF_CONTEXT_PASSWORD;
use sotto_shared::envelope::reason;
use sotto_shared::validate;
use sotto_store::{Database, StoreError};

/// Outcome of a credential operation. A refusal carries the wire reason
/// code for the corresponding `*_RESULT` envelope.
#[derive(Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    Accepted,
    Refused(&'static str),
}

/// Hash a password for storage: BLAKE3 in derive-key mode, hex encoded.
///
/// There is no per-user salt, so identical passwords produce identical
/// stored digests.
pub fn hash_password(password: &str) -> String {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_PASSWORD);
    hasher.update(password.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Constant-time comparison of two hex digests.
fn hashes_match(stored: &str, computed: &str) -> bool {
    stored.as_bytes().ct_eq(computed.as_bytes()).into()
}

/// Create an account. Never overwrites an existing one.
pub fn register_account(
    db: &Database,
    user_id: &str,
    password: &str,
) -> Result<AuthOutcome, StoreError> {
    if !validate::valid_user_id(user_id) || !validate::valid_password(password) {
        return Ok(AuthOutcome::Refused(reason::INVALID_INPUT));
    }

    match db.create_account(user_id, &hash_password(password)) {
        Ok(()) => Ok(AuthOutcome::Accepted),
        Err(StoreError::AccountExists) => Ok(AuthOutcome::Refused(reason::USER_EXISTS)),
        Err(err) => Err(err),
    }
}

/// Check credentials for login. No lockout; abuse is handled by the per-IP
/// limiter in front of this.
pub fn authenticate(
    db: &Database,
    user_id: &str,
    password: &str,
) -> Result<AuthOutcome, StoreError> {
    if !validate::valid_user_id(user_id) || !validate::valid_password(password) {
        return Ok(AuthOutcome::Refused(reason::INVALID_INPUT));
    }

    let account = match db.get_account(user_id)? {
        Some(account) => account,
        None => return Ok(AuthOutcome::Refused(reason::NOT_REGISTERED)),
    };

    if hashes_match(&account.password_hash, &hash_password(password)) {
        Ok(AuthOutcome::Accepted)
    } else {
        Ok(AuthOutcome::Refused(reason::BAD_PASSWORD))
    }
}

/// Replace the stored password hash. The caller must have verified that
/// `user_id` belongs to the requesting session.
pub fn change_password(
    db: &Database,
    user_id: &str,
    new_password: &str,
) -> Result<AuthOutcome, StoreError> {
    if !validate::valid_password(new_password) {
        return Ok(AuthOutcome::Refused(reason::INVALID_INPUT));
    }

    db.update_password(user_id, &hash_password(new_password))?;
    Ok(AuthOutcome::Accepted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_db(dir: &tempfile::TempDir) -> Database {
        Database::open_at(&dir.path().join("auth-test.db")).unwrap()
    }

    #[test]
    fn test_hash_password_deterministic() {
        assert_eq!(hash_password("hunter22"), hash_password("hunter22"));
        assert_ne!(hash_password("hunter22"), hash_password("hunter23"));
        // Derive-key mode, not a plain hash of the input bytes.
        assert_ne!(
            hash_password("hunter22"),
            blake3::hash(b"hunter22").to_hex().to_string()
        );
    }

    #[test]
    fn test_register_then_authenticate() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);

        assert_eq!(
            register_account(&db, "alice", "hunter22").unwrap(),
            AuthOutcome::Accepted
        );
        assert_eq!(
            authenticate(&db, "alice", "hunter22").unwrap(),
            AuthOutcome::Accepted
        );
    }

    #[test]
    fn test_register_rejects_duplicate_and_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);

        register_account(&db, "alice", "hunter22").unwrap();
        assert_eq!(
            register_account(&db, "alice", "other-password").unwrap(),
            AuthOutcome::Refused(reason::USER_EXISTS)
        );
        assert_eq!(
            register_account(&db, "a", "hunter22").unwrap(),
            AuthOutcome::Refused(reason::INVALID_INPUT)
        );
        assert_eq!(
            register_account(&db, "bob", "shrt").unwrap(),
            AuthOutcome::Refused(reason::INVALID_INPUT)
        );
    }

    #[test]
    fn test_authenticate_refusals() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);

        register_account(&db, "alice", "hunter22").unwrap();
        assert_eq!(
            authenticate(&db, "alice", "wrong-password").unwrap(),
            AuthOutcome::Refused(reason::BAD_PASSWORD)
        );
        assert_eq!(
            authenticate(&db, "nobody", "hunter22").unwrap(),
            AuthOutcome::Refused(reason::NOT_REGISTERED)
        );
    }

    #[test]
    fn test_change_password() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);

        register_account(&db, "alice", "hunter22").unwrap();
        assert_eq!(
            change_password(&db, "alice", "betterpass").unwrap(),
            AuthOutcome::Accepted
        );
        assert_eq!(
            authenticate(&db, "alice", "hunter22").unwrap(),
            AuthOutcome::Refused(reason::BAD_PASSWORD)
        );
        assert_eq!(
            authenticate(&db, "alice", "betterpass").unwrap(),
            AuthOutcome::Accepted
        );
    }
}
