//! Configuration Module
//!
//! Configuration loading for the stream server and the sync client.

mod settings;

pub use settings::{
    ClientConfig, ConfigError, DatabaseSettings, PollSettings, ReconnectSettings, ServerSettings,
    StreamConfig,
};
