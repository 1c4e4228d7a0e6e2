//! Business services layer.
//!
//! This module contains the services that turn remote mailboxes into
//! classified local messages, coordinating between providers, storage, and
//! domain types.
//!
//! # Architecture
//!
//! ```text
//!          Scheduler (cron, one account at a time)
//!              |
//!              v
//!         AccountCycle ---------------------> audit log
//!          |         |
//!          v         v
//!   SyncEngine    ClassificationPipeline
//!      |              |           |
//!      v              v           v
//!  MailClient     RuleEngine  ConsensusClassifier
//!  (IMAP/POP3)                    |
//!                                 v
//!                            ModelGateway
//! ```
//!
//! # Services Overview
//!
//! - [`SyncEngine`]: Incremental fetch of new mail into storage
//! - [`RuleEngine`]: Deterministic whitelist and internal-loop rules
//! - [`ConsensusClassifier`]: Two voting models plus an arbiter
//! - [`ClassificationPipeline`]: Rules, then models, saved as one batch
//! - [`Scheduler`]: Cron-driven sequential account cycles
//!
//! Every stage reports to a [`ProgressSink`].

mod classifier;
mod pipeline;
mod progress;
mod rules;
mod scheduler;
mod sync_service;

pub use classifier::{ConsensusClassifier, ModelSet};
pub use pipeline::{ClassificationPipeline, ClassifyError, ClassifyOutcome};
pub use progress::{ProgressEvent, ProgressSink, ProgressStream};
pub use rules::{RuleEngine, WhitelistMatcher};
pub use scheduler::{
    AccountCycle, CycleReport, Scheduler, SchedulerError, BACKGROUND_ACTION, CLASSIFY_ACTION,
    MANUAL_ACTION,
};
pub use sync_service::{SyncEngine, SyncError, SyncOutcome};
