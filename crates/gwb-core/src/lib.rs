//! Core of the group welcome bot.
//!
//! The worker, its state machines and the control surface live here. The
//! message-thread provider sits behind the [`provider::port::GroupProvider`]
//! port and is implemented in adapter crates.

pub mod accounts;
pub mod commands;
pub mod config;
pub mod control;
pub mod dedup;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod membership;
pub mod provider;
pub mod status;
pub mod utils;
pub mod welcome;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::{Error, Result};
