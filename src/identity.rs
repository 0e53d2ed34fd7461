use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use serde::{Deserialize, Serialize};
use std::rc::Rc;
use std::sync::LazyLock;

use crate::db::{Database, SESSION_KEY, USERS_KEY};
use crate::errors::{TrackerError, TrackerResult};
use crate::models::Principal;

const MIN_PASSWORD_LEN: usize = 6;

static EMAIL_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email regex"));

/// Receives every login, signup and logout transition, synchronously and in
/// subscription order.
pub trait PrincipalObserver {
    fn principal_changed(&self, principal: Option<&Principal>);
}

/// Entry in the credential-bearing principal list. Only the Argon2id PHC
/// string of the password is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PrincipalRecord {
    id: String,
    email: String,
    name: String,
    password_hash: String,
}

impl PrincipalRecord {
    fn principal(&self) -> Principal {
        Principal {
            id: self.id.clone(),
            email: self.email.clone(),
            name: self.name.clone(),
        }
    }

    fn verify(&self, password: &str) -> bool {
        match PasswordHash::new(&self.password_hash) {
            Ok(parsed) => Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok(),
            Err(e) => {
                tracing::warn!(error = %e, principal = %self.id, "stored password hash is unreadable");
                false
            }
        }
    }
}

pub struct IdentityContext {
    db: Rc<Database>,
    current: Option<Principal>,
    observers: Vec<Rc<dyn PrincipalObserver>>,
}

impl IdentityContext {
    pub fn new(db: Rc<Database>) -> Self {
        Self {
            db,
            current: None,
            observers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, observer: Rc<dyn PrincipalObserver>) {
        self.observers.push(observer);
    }

    pub fn current(&self) -> Option<&Principal> {
        self.current.as_ref()
    }

    pub fn is_logged_in(&self) -> bool {
        self.current.is_some()
    }

    /// Picks up the session left by a previous run and announces it.
    pub fn restore_session(&mut self) -> TrackerResult<()> {
        let restored = match self.db.get(SESSION_KEY)? {
            Some(raw) => match serde_json::from_str::<Principal>(&raw) {
                Ok(principal) => Some(principal),
                Err(e) => {
                    tracing::warn!(error = %e, "discarding unreadable session record");
                    self.db.remove(SESSION_KEY)?;
                    None
                }
            },
            None => None,
        };
        if let Some(p) = &restored {
            tracing::info!(principal = %p.id, "session restored");
        }
        self.transition(restored);
        Ok(())
    }

    pub fn login(&mut self, email: &str, password: &str) -> TrackerResult<Principal> {
        validate_email(email)?;
        let records = self.load_records()?;
        let record = records
            .iter()
            .find(|r| r.email.eq_ignore_ascii_case(email.trim()) && r.verify(password))
            .ok_or(TrackerError::InvalidCredentials)?;

        let principal = record.principal();
        self.db.set(SESSION_KEY, &serde_json::to_string(&principal)?)?;
        tracing::info!(principal = %principal.id, "logged in");
        self.transition(Some(principal.clone()));
        Ok(principal)
    }

    pub fn signup(&mut self, name: &str, email: &str, password: &str) -> TrackerResult<Principal> {
        if name.trim().is_empty() {
            return Err(TrackerError::Validation("Name is required.".to_string()));
        }
        validate_email(email)?;
        if password.len() < MIN_PASSWORD_LEN {
            return Err(TrackerError::Validation(format!(
                "Password must be at least {} characters.",
                MIN_PASSWORD_LEN
            )));
        }

        let mut records = self.load_records()?;
        let email = email.trim().to_lowercase();
        if records.iter().any(|r| r.email.eq_ignore_ascii_case(&email)) {
            return Err(TrackerError::EmailTaken);
        }

        records.push(PrincipalRecord {
            id: uuid::Uuid::new_v4().to_string(),
            email: email.clone(),
            name: name.trim().to_string(),
            password_hash: hash_password(password)?,
        });
        self.db.set(USERS_KEY, &serde_json::to_string(&records)?)?;

        // Auto login
        self.login(&email, password)
    }

    pub fn logout(&mut self) -> TrackerResult<()> {
        self.db.remove(SESSION_KEY)?;
        if let Some(p) = &self.current {
            tracing::info!(principal = %p.id, "logged out");
        }
        self.transition(None);
        Ok(())
    }

    fn transition(&mut self, principal: Option<Principal>) {
        self.current = principal;
        for observer in &self.observers {
            observer.principal_changed(self.current.as_ref());
        }
    }

    fn load_records(&self) -> TrackerResult<Vec<PrincipalRecord>> {
        let Some(raw) = self.db.get(USERS_KEY)? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str(&raw) {
            Ok(records) => Ok(records),
            Err(e) => {
                tracing::warn!(error = %e, "principal list is unreadable, starting empty");
                Ok(Vec::new())
            }
        }
    }
}

fn validate_email(email: &str) -> TrackerResult<()> {
    if EMAIL_RE.is_match(email.trim()) {
        Ok(())
    } else {
        Err(TrackerError::Validation(format!("'{}' is not a valid email address.", email)))
    }
}

/// Argon2id with default parameters, as a PHC string carrying salt and cost.
fn hash_password(password: &str) -> TrackerResult<String> {
    let salt = SaltString::generate(&mut rand::rngs::OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| TrackerError::Storage(anyhow::anyhow!("Failed to hash password: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recorder {
        seen: RefCell<Vec<Option<String>>>,
    }

    impl PrincipalObserver for Recorder {
        fn principal_changed(&self, principal: Option<&Principal>) {
            self.seen.borrow_mut().push(principal.map(|p| p.id.clone()));
        }
    }

    fn context() -> (IdentityContext, Rc<Database>) {
        let db = Rc::new(Database::open_in_memory().unwrap());
        (IdentityContext::new(db.clone()), db)
    }

    #[test]
    fn test_signup_logs_in_and_lowercases_email() {
        let (mut identity, _) = context();
        let p = identity.signup("Ada", "Ada@Example.com", "secret1").unwrap();
        assert_eq!(p.email, "ada@example.com");
        assert_eq!(identity.current(), Some(&p));
    }

    #[test]
    fn test_signup_rejects_duplicate_email_case_insensitively() {
        let (mut identity, _) = context();
        identity.signup("Ada", "ada@example.com", "secret1").unwrap();
        let err = identity.signup("Other", "ADA@example.com", "secret2").unwrap_err();
        assert!(matches!(err, TrackerError::EmailTaken));
        assert_eq!(err.to_string(), "Email already in use.");
    }

    #[test]
    fn test_signup_validation() {
        let (mut identity, _) = context();
        assert!(matches!(
            identity.signup("Ada", "not-an-email", "secret1"),
            Err(TrackerError::Validation(_))
        ));
        assert!(matches!(
            identity.signup("Ada", "ada@example.com", "short"),
            Err(TrackerError::Validation(_))
        ));
        assert!(matches!(
            identity.signup("  ", "ada@example.com", "secret1"),
            Err(TrackerError::Validation(_))
        ));
        assert!(!identity.is_logged_in());
    }

    #[test]
    fn test_login_checks_password() {
        let (mut identity, _) = context();
        identity.signup("Ada", "ada@example.com", "secret1").unwrap();
        identity.logout().unwrap();

        let err = identity.login("ada@example.com", "wrong-pass").unwrap_err();
        assert!(matches!(err, TrackerError::InvalidCredentials));
        assert!(!identity.is_logged_in());

        let p = identity.login("ADA@example.com", "secret1").unwrap();
        assert_eq!(p.name, "Ada");
    }

    #[test]
    fn test_credentials_never_stored_in_clear_or_in_session() {
        let (mut identity, db) = context();
        identity.signup("Ada", "ada@example.com", "secret1").unwrap();

        let session = db.get(SESSION_KEY).unwrap().unwrap();
        assert!(!session.contains("secret1"));
        assert!(!session.contains("password"));

        let users = db.get(USERS_KEY).unwrap().unwrap();
        assert!(!users.contains("secret1"));
        assert!(users.contains("$argon2id$"));
    }

    #[test]
    fn test_same_password_gets_distinct_hashes() {
        let first = hash_password("secret1").unwrap();
        let second = hash_password("secret1").unwrap();
        assert_ne!(first, second);
        assert!(first.starts_with("$argon2id$"));
    }

    #[test]
    fn test_unreadable_hash_never_verifies() {
        let (mut identity, db) = context();
        let legacy = r#"[{"id":"u1","email":"ada@example.com","name":"Ada","salt":"00","password_hash":"deadbeef"}]"#;
        db.set(USERS_KEY, legacy).unwrap();
        assert!(matches!(
            identity.login("ada@example.com", "secret1"),
            Err(TrackerError::InvalidCredentials)
        ));
    }

    #[test]
    fn test_observers_see_every_transition() {
        let (mut identity, _) = context();
        let recorder = Rc::new(Recorder::default());
        identity.subscribe(recorder.clone());

        let p = identity.signup("Ada", "ada@example.com", "secret1").unwrap();
        identity.logout().unwrap();

        assert_eq!(*recorder.seen.borrow(), vec![Some(p.id.clone()), None]);
    }

    #[test]
    fn test_restore_session_from_previous_run() {
        let (mut identity, db) = context();
        let p = identity.signup("Ada", "ada@example.com", "secret1").unwrap();

        let mut next_run = IdentityContext::new(db);
        let recorder = Rc::new(Recorder::default());
        next_run.subscribe(recorder.clone());
        next_run.restore_session().unwrap();

        assert_eq!(next_run.current(), Some(&p));
        assert_eq!(*recorder.seen.borrow(), vec![Some(p.id)]);
    }

    #[test]
    fn test_corrupt_session_is_cleared() {
        let (mut identity, db) = context();
        db.set(SESSION_KEY, "{not json").unwrap();
        identity.restore_session().unwrap();
        assert!(!identity.is_logged_in());
        assert_eq!(db.get(SESSION_KEY).unwrap(), None);
    }
}
