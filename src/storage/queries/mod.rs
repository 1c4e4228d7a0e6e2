//! Database query modules.
//!
//! Each module provides async functions over a [`Database`](super::Database).

pub mod accounts;
pub mod audit;
pub mod checkpoints;
pub mod classifications;
pub mod messages;
