//! # nmq-client
//!
//! Client library for nmq.
//!
//! This crate provides:
//! - Async TCP connection with connect and read timeouts
//! - Masked Text/Binary frames, ping and close
//! - Frame-at-a-time receive with fragment-aware helpers

pub mod connection;
pub mod error;

pub use connection::{ClientConfig, Connection};
pub use error::ClientError;
