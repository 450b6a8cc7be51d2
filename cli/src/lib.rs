//! Thin image CLI - conversion daemon and store-backed driver tooling.

pub mod commands;
pub mod output;
