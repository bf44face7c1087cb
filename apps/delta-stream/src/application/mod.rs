//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for the data store, producers and outbound transport.
pub mod ports;

/// Application services for polling and delivery.
pub mod services;
