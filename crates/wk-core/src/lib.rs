//! Core library for warkeep — domain types, the immutable game-data catalog,
//! server configuration, and the error taxonomy shared by every other crate.

pub mod catalog;
pub mod config;
pub mod error;
pub mod types;

pub use error::{GameError, GameResult};
