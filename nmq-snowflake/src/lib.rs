//! # nmq-snowflake
//!
//! Time-ordered unique ids for nmq connections and messages.
//!
//! This crate provides:
//! - A per-node snowflake generator with a layout fixed at construction
//! - Decimal, base2/32/36/58/64 and big-endian byte encodings of ids
//! - A pluggable clock and node number derivation from a component name

pub mod clock;
pub mod error;
pub mod id;
pub mod node;

pub use clock::{Clock, MonotonicClock};
pub use error::SnowflakeError;
pub use id::SnowId;
pub use node::{
    node_id_from_name, BitLayout, IdParts, Settings, SnowNode, DEFAULT_EPOCH_MS,
    DEFAULT_NODE_BITS, DEFAULT_STEP_BITS, MAX_NODE_STEP_BITS,
};
