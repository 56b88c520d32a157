//! Transaction categorizer: rule-based classification and merchant linking
//! for bank transaction events.

pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod pipeline;
pub mod source;
pub mod store;
