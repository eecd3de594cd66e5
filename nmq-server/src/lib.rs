//! # nmq-server
//!
//! TCP server for nmq.
//!
//! This crate provides:
//! - A listener with an accept loop and one read loop task per connection
//! - A registry of live connections keyed by snowflake id
//! - Ping/pong and close handling, fragment assembly and message dispatch
//! - YAML + environment configuration
//! - Prometheus metrics

pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod registry;
pub mod server;

pub use config::{Config, ConfigError, MetricsConfig, NetworkConfig, NodeConfig};
pub use connection::ConnectionHandle;
pub use error::ServerError;
pub use handler::{ChannelHandler, ConnectionEvent, LoggingHandler, MessageHandler};
pub use metrics::{run_metrics_server, Metrics};
pub use registry::Registry;
pub use server::{Network, Server, ServerConfig, ServerState, ServerStats};
