//! Mail passwords and the gateway API key in the OS keychain.

use thiserror::Error;

use crate::domain::AccountId;

#[derive(Debug, Error)]
pub enum KeychainError {
    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Keychain worker failed: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, KeychainError>;

/// Entry name of the password for one mail account.
fn password_entry(account_id: &AccountId) -> String {
    format!("mail.password.{}", account_id)
}

const GATEWAY_KEY_ENTRY: &str = "ai.api_key.gateway";

/// Secrets kept outside settings and the database.
///
/// Every keyring call blocks, so each one runs on a blocking worker.
#[derive(Debug, Clone)]
pub struct KeychainAccess {
    service: String,
}

impl KeychainAccess {
    pub const DEFAULT_SERVICE: &'static str = "io.mailtriage";

    pub fn new() -> Self {
        Self::with_service(Self::DEFAULT_SERVICE)
    }

    /// Uses a separate keychain namespace, e.g. for tests.
    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Password for a mail account, if one was stored.
    pub async fn account_password(&self, account_id: &AccountId) -> Result<Option<String>> {
        self.read(password_entry(account_id)).await
    }

    /// Stores or replaces a mail account's password.
    pub async fn set_account_password(&self, account_id: &AccountId, password: &str) -> Result<()> {
        let password = password.to_string();
        self.on_entry(password_entry(account_id), move |entry| {
            Ok(entry.set_password(&password)?)
        })
        .await
    }

    /// Removes a mail account's password. Absent entries are not an error.
    pub async fn remove_account_password(&self, account_id: &AccountId) -> Result<()> {
        self.on_entry(password_entry(account_id), |entry| {
            match entry.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    /// API key for the model gateway, if one was stored.
    pub async fn gateway_api_key(&self) -> Result<Option<String>> {
        self.read(GATEWAY_KEY_ENTRY.to_string()).await
    }

    async fn read(&self, name: String) -> Result<Option<String>> {
        self.on_entry(name, |entry| match entry.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn on_entry<F, T>(&self, name: String, f: F) -> Result<T>
    where
        F: FnOnce(keyring::Entry) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let service = self.service.clone();
        tokio::task::spawn_blocking(move || f(keyring::Entry::new(&service, &name)?))
            .await
            .map_err(|e| KeychainError::Worker(e.to_string()))?
    }
}

impl Default for KeychainAccess {
    fn default() -> Self {
        Self::new()
    }
}
