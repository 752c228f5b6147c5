//! Gatewarden Core Types and Traits
//!
//! This crate provides the fundamental types and traits used throughout Gatewarden:
//! - Core error taxonomy
//! - Injectable clock
//! - Collaborator traits (shared counter store, auth validator)

pub mod auth;
pub mod clock;
pub mod counter_store;
pub mod error;

pub use auth::{AuthValidator, Credential, RateLimitHint};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use counter_store::{CounterStore, is_window_key};
pub use error::{Error, Result};
