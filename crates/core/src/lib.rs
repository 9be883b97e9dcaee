//! Script exporter domain logic.
//!
//! Runs external scripts under a cancellable deadline, throttles concurrent
//! runs per script, and turns script output into metric families ready for
//! text exposition. Nothing in this crate knows about HTTP; the `api` crate
//! wires it to routes.

pub mod context;
pub mod dispatcher;
pub mod error;
pub mod exposition;
pub mod model;
pub mod opentsdb;
pub mod runner;
pub mod telemetry;
pub mod textformat;
