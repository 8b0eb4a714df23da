//! Built-in task types.
//!
//! Task types register once at process start. The eventizer task converts
//! repository data into events; the identity tasks drive the identity
//! management operations.

pub mod eventizer;
pub mod identities;

use std::sync::Arc;

use crate::config::Config;

use super::error::SchedulerError;
use super::registry::TaskRegistry;
use identities::ImporterRegistry;

/// Register all built-in task types.
pub fn register_default_task_types(
    registry: &mut TaskRegistry,
    config: &Config,
    importers: Arc<ImporterRegistry>,
) -> Result<(), SchedulerError> {
    registry.register(eventizer::eventizer_task_type(config))?;
    for descriptor in identities::identity_task_types(config, importers) {
        registry.register(descriptor)?;
    }
    Ok(())
}
