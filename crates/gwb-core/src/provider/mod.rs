//! Message-thread provider port and its decorators.

pub mod port;
pub mod retry;
pub mod throttled;

pub use port::{GroupProvider, ProviderResult};
