//! Identity provider seam plus an in-memory provider used by the headless driver.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("invalid email address")]
    InvalidEmail,
    #[error("password must be at least 6 characters")]
    WeakPassword,
    #[error("an account already exists for this email")]
    EmailInUse,
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

/// Authenticated account as reported by the provider, before role resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub uid: String,
    pub email: String,
    pub display_name: Option<String>,
}

pub trait IdentityProvider: Send + Sync + 'static {
    /// Emits `None` on logout and an account whenever a session is established.
    fn principal_changes(&self) -> watch::Receiver<Option<Account>>;

    fn sign_in(
        &self,
        email: &str,
        password: &str,
    ) -> impl Future<Output = Result<Account, IdentityError>> + Send;

    fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> impl Future<Output = Result<Account, IdentityError>> + Send;

    fn sign_out(&self) -> impl Future<Output = Result<(), IdentityError>> + Send;
}

struct StoredAccount {
    account: Account,
    password: String,
}

#[derive(Clone)]
pub struct MemoryIdentity {
    accounts: Arc<Mutex<HashMap<String, StoredAccount>>>,
    current: Arc<watch::Sender<Option<Account>>>,
}

impl Default for MemoryIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIdentity {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            accounts: Arc::new(Mutex::new(HashMap::new())),
            current: Arc::new(tx),
        }
    }

    fn accounts(&self) -> MutexGuard<'_, HashMap<String, StoredAccount>> {
        self.accounts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers an account with a fixed uid (e.g. the configured super-admin).
    pub fn register(
        &self,
        uid: &str,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> Result<Account, IdentityError> {
        let email = normalize_email(email)?;
        validate_password(password)?;
        let mut accounts = self.accounts();
        if accounts.contains_key(&email) {
            return Err(IdentityError::EmailInUse);
        }
        let account = Account {
            uid: uid.to_string(),
            email: email.clone(),
            display_name: display_name
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string),
        };
        accounts.insert(
            email,
            StoredAccount {
                account: account.clone(),
                password: password.to_string(),
            },
        );
        Ok(account)
    }

    pub fn current(&self) -> Option<Account> {
        self.current.borrow().clone()
    }
}

fn normalize_email(email: &str) -> Result<String, IdentityError> {
    let trimmed = email.trim().to_lowercase();
    match trimmed.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(trimmed),
        _ => Err(IdentityError::InvalidEmail),
    }
}

fn validate_password(password: &str) -> Result<(), IdentityError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(IdentityError::WeakPassword);
    }
    Ok(())
}

impl IdentityProvider for MemoryIdentity {
    fn principal_changes(&self) -> watch::Receiver<Option<Account>> {
        self.current.subscribe()
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Account, IdentityError> {
        let email = normalize_email(email)?;
        let account = {
            let accounts = self.accounts();
            match accounts.get(&email) {
                Some(stored) if stored.password == password => stored.account.clone(),
                _ => return Err(IdentityError::InvalidCredentials),
            }
        };
        tracing::info!(user_id = %account.uid, "signed in");
        self.current.send_replace(Some(account.clone()));
        Ok(account)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> Result<Account, IdentityError> {
        let uid = Uuid::new_v4().simple().to_string();
        let account = self.register(&uid, email, password, display_name)?;
        tracing::info!(user_id = %account.uid, "account created");
        self.current.send_replace(Some(account.clone()));
        Ok(account)
    }

    async fn sign_out(&self) -> Result<(), IdentityError> {
        if let Some(previous) = self.current.send_replace(None) {
            tracing::info!(user_id = %previous.uid, "signed out");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sign_up_then_sign_in_publishes_account_changes() {
        let identity = MemoryIdentity::new();
        let mut changes = identity.principal_changes();
        assert!(changes.borrow_and_update().is_none());

        let created = identity
            .sign_up("Ana@Example.com", "secret1", Some("Ana"))
            .await
            .unwrap();
        assert_eq!(created.email, "ana@example.com");
        assert!(changes.has_changed().unwrap());
        assert_eq!(changes.borrow_and_update().as_ref(), Some(&created));

        identity.sign_out().await.unwrap();
        assert!(changes.borrow_and_update().is_none());

        let again = identity.sign_in("ana@example.com", "secret1").await.unwrap();
        assert_eq!(again.uid, created.uid);
        assert_eq!(identity.current(), Some(again));
    }

    #[tokio::test]
    async fn rejects_bad_input_and_credentials() {
        let identity = MemoryIdentity::new();
        assert_eq!(
            identity.sign_up("no-at-sign", "secret1", None).await,
            Err(IdentityError::InvalidEmail)
        );
        assert_eq!(
            identity.sign_up("bo@example.com", "123", None).await,
            Err(IdentityError::WeakPassword)
        );
        identity.sign_up("bo@example.com", "secret1", None).await.unwrap();
        assert_eq!(
            identity.sign_up("bo@example.com", "secret2", None).await,
            Err(IdentityError::EmailInUse)
        );
        assert_eq!(
            identity.sign_in("bo@example.com", "wrong-pass").await,
            Err(IdentityError::InvalidCredentials)
        );
    }
}
