//! Test utilities shared by the unit tests.
//!
//! This module provides:
//! - Test data factories for creating valid fixtures
//! - An in-memory store implementing every repository trait
//! - Provider payload builders and a recording notifier
//! - A builder for an `AppState` wired to the in-memory store

mod app_state_builder;
mod factories;
mod in_memory;
mod payloads;

pub use app_state_builder::*;
pub use factories::*;
pub use in_memory::*;
pub use payloads::*;
