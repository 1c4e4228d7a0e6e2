//! Mail protocol and AI model providers.
//!
//! This module contains provider traits and implementations for external services:
//!
//! - [`email`] - Mail retrieval clients (IMAP, POP3)
//! - [`ai`] - Language model gateway over HTTP

pub mod ai;
pub mod email;
