// Public API - the runner plus the types the CLI and callers build batches from
pub mod config;
pub mod coordination;
pub mod db;
pub mod error;
pub mod runner;
pub mod source;

// Internal modules - organized by subsystem
mod loader;
mod normalize;
mod telemetry;
