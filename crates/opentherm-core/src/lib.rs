/*!
 * OpenTherm Core
 *
 * This crate provides the shared foundation of the OpenTherm driver:
 * configuration, logging and async helpers.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod utils;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use tokio;
    pub use tracing;
}

/// OpenTherm core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization from a loaded configuration
pub fn init(config: &config::Config) -> Result<(), error::Error> {
    logging::init_from_config(&config.logging)?;
    tracing::info!("OpenTherm Core {} initialized", VERSION);
    Ok(())
}
