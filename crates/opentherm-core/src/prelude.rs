/*!
 * Prelude module for OpenTherm Core.
 *
 * This module re-exports commonly used types and functions from the core
 * crate to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export config types
pub use crate::config::{CompensationMode, Config, ConfigBuilder, DhwMode, PollPriority};

// Re-export utility functions
pub use crate::utils::{spawn_and_log, with_timeout};

// Re-export logging
pub use crate::logging::{component_span, operation_span, FRAME_TARGET};
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
