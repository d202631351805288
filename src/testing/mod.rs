//! Testing utilities
//!
//! Fake clock, recording transport and subscriber doubles for exercising
//! the client without a network or wall-clock waits.

pub mod mocks;

pub use mocks::*;
