//! Script exporter HTTP server library.
//!
//! Exposes config, state, error handling and routes so integration tests and
//! the binary entrypoint build exactly the same application.

pub mod config;
pub mod error;
pub mod router;
pub mod routes;
pub mod state;
