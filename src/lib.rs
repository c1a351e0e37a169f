//! Code evaluation orchestrator
//!
//! Accepts submissions, runs them against a challenge's tests in a streamed
//! evaluation session and commits exactly one outcome per submission. The
//! [`reducer`] and [`protocol`] modules are also what stream consumers use to
//! fold the event stream into an outcome.

pub mod catalog;
pub mod config;
pub mod error;
pub mod feedback;
pub mod gateway;
pub mod languages;
pub mod protocol;
pub mod reducer;
pub mod runner;
pub mod scoring;
pub mod server;
pub mod session;
pub mod store;
