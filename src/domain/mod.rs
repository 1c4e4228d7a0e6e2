//! Domain layer types.
//!
//! This module contains the core types shared by the protocol clients,
//! the sync engine, the classifier and storage.

mod account;
mod audit;
mod checkpoint;
mod classification;
mod message;
mod types;

pub use account::{Account, Protocol};
pub use audit::{AuditEntry, AuditStatus};
pub use checkpoint::SyncCheckpoint;
pub use classification::{
    Category, ClassificationResult, DecidedBy, ModelVerdict, DELETED_LABEL,
};
pub use message::{Address, Attachment, Envelope, NewAttachment, NewMessage, StoredMessage};
pub use types::{AccountId, MessageId};
