//! Shared vocabulary for the tocsin alerting scheduler.
//!
//! Alert keys, statuses, operator actions, evaluation events, incidents,
//! and silences are defined here so the storage layer and the scheduler
//! agree on one wire form. The [`collect`] module holds the in-process
//! tagged counter/gauge registry both of them report into.

pub mod collect;
pub mod key;
pub mod types;
