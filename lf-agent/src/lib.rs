//! Log-forwarding agent.
//!
//! Inputs produce [`event::Event`]s, parsers and filters transform or drop them, and the
//! [`engine::Engine`] batches them into outputs. The `tail` input follows files matched by a
//! glob and remembers its position per file in a SQLite state database.

pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod filters;
pub mod inputs;
pub mod metrics;
pub mod outputs;
pub mod parsers;
pub mod plugin;
pub mod registry;
pub mod runner;
pub mod tag;
pub mod tailer;
pub mod watcher;
