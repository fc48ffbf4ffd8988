//! Core domain models and persistence for the cart recovery service.
//!
//! Provides the lead and scheduled-action types, the storage error
//! taxonomy, a clock abstraction for deterministic tests and the PostgreSQL
//! repositories every other crate builds on.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    ActionId, ActionKind, ActionStatus, Lead, LeadEmail, LeadStatus, ScheduledAction,
};
pub use time::{Clock, RealClock, TestClock};
