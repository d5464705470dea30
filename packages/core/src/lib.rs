// Library root. Exposes internal modules for integration tests in `tests/`.
// Production entry point remains `src/main.rs`.

pub mod api;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod notification;
pub mod publisher;
pub mod queue;
pub mod repository;
pub mod scheduler;
pub mod senders;

// Startup-only modules, used by the binary.
pub mod cli;
pub mod config;
pub mod logging;

#[cfg(test)]
pub(crate) mod mock;
