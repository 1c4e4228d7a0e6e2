//! Mail retrieval protocols.
//!
//! This module contains the [`MailClient`] trait and its implementations:
//!
//! - [`ImapClient`] - IMAP4rev1 via the `imap` crate, over implicit TLS or plain TCP
//! - [`Pop3Client`] - POP3 with UIDL-based change detection
//!
//! # Architecture
//!
//! Both clients run over blocking sockets obtained from a [`Dialer`]. The async engine never calls them directly; it wraps each one
//! in a [`PooledClient`], which runs every call on a bounded pool of blocking
//! workers. A [`MailClientFactory`] builds clients for stored accounts.
//!
//! # Example
//!
//! ```ignore
//! use mailtriage::providers::email::{BlockingPool, MailClientFactory, PooledClient};
//!
//! async fn folders(factory: &dyn MailClientFactory, account: &Account) -> Result<Vec<String>> {
//!     let client = PooledClient::new(factory.create(account).await?, BlockingPool::new(4));
//!     client.connect().await?;
//!     let folders = client.list_folders().await;
//!     client.disconnect().await;
//!     folders
//! }
//! ```

mod factory;
mod imap;
mod pool;
mod pop3;
#[cfg(test)]
pub(crate) mod script;
mod traits;
mod transport;

pub use factory::{KeychainClientFactory, MailClientFactory};
#[cfg(test)]
pub use factory::MockClientFactory;
pub use imap::ImapClient;
pub use pool::{BlockingPool, PooledClient};
pub use pop3::{Pop3Client, Pop3Session, POP3_FOLDER};
pub use traits::{Credentials, FolderState, MailClient, ProtocolError, RemoteId, Result};
pub use transport::{connect, ConnectOptions, Dialer, MailStream, RetryPolicy, TcpDialer};
