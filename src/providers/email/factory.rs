//! Building protocol clients for stored accounts.

use async_trait::async_trait;

use super::transport::{ConnectOptions, RetryPolicy, TcpDialer};
use super::{Credentials, ImapClient, MailClient, Pop3Client, ProtocolError, Result};
use crate::domain::{Account, Protocol};
use crate::storage::KeychainAccess;

/// Creates an unconnected client for an account.
#[async_trait]
pub trait MailClientFactory: Send + Sync {
    async fn create(&self, account: &Account) -> Result<Box<dyn MailClient>>;
}

#[cfg(test)]
mockall::mock! {
    pub ClientFactory {}

    #[async_trait]
    impl MailClientFactory for ClientFactory {
        async fn create(&self, account: &Account) -> Result<Box<dyn MailClient>>;
    }
}

/// Factory that resolves passwords from the OS keychain and dials real sockets.
#[derive(Debug, Clone)]
pub struct KeychainClientFactory {
    keychain: KeychainAccess,
    retry: RetryPolicy,
}

impl KeychainClientFactory {
    pub fn new(keychain: KeychainAccess, retry: RetryPolicy) -> Self {
        Self { keychain, retry }
    }

    async fn credentials(&self, account: &Account) -> Result<Credentials> {
        let password = self
            .keychain
            .account_password(&account.id)
            .await
            .map_err(|e| ProtocolError::Authentication(format!("keychain: {e}")))?
            .ok_or_else(|| {
                ProtocolError::Authentication(format!("no password stored for {}", account.id))
            })?;
        Ok(Credentials::new(account.username.clone(), password))
    }
}

#[async_trait]
impl MailClientFactory for KeychainClientFactory {
    async fn create(&self, account: &Account) -> Result<Box<dyn MailClient>> {
        let credentials = self.credentials(account).await?;
        let dialer = TcpDialer(ConnectOptions::for_account(account, self.retry));

        tracing::debug!(
            account_id = %account.id,
            protocol = %account.protocol,
            host = %account.host,
            port = account.port,
            "creating mail client"
        );

        let client: Box<dyn MailClient> = match account.protocol {
            Protocol::Imap => Box::new(ImapClient::new(dialer, credentials)),
            Protocol::Pop3 => Box::new(Pop3Client::new(dialer, credentials)),
        };
        Ok(client)
    }
}
