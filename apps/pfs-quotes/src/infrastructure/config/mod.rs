//! Configuration Module
//!
//! Configuration for the quote client and its demo binary.

mod settings;

pub use settings::{AccessId, ClientConfig, ConfigError, ConnectionSettings, parse_bool};
