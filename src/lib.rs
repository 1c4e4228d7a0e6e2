//! mailtriage - Incremental mail sync with rule and AI-consensus triage
//!
//! This crate pulls new mail from IMAP and POP3 accounts into a local store,
//! classifies it with deterministic rules and a pair of language models
//! arbitrated by a third, and runs the whole cycle on a cron schedule.

pub mod app;
pub mod config;
pub mod domain;
pub mod mime;
pub mod providers;
pub mod services;
pub mod storage;

pub use app::App;
