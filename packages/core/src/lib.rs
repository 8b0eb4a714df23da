// GrimoireLab Core
//
// Scheduling and execution of recurring data-collection and identity
// management jobs, plus the archivist pipeline that drains the produced
// events into a search index.

pub mod archivist;
pub mod common;
pub mod config;
pub mod eventizer;
pub mod scheduler;
pub mod server;
pub mod stream;

pub use config::Config;
