//! Built-in connector, driver, mapper, and metrics plugins.
use crate::Error;

pub mod connectors;
pub mod driver;
pub mod mapper;
pub mod metrics;

#[cfg(feature = "scylla")]
pub mod scylla_driver;

/// Registers every built-in plugin with the global registry. Called once by
/// [`crate::Runtime::from_config`] before a configuration is validated.
pub(crate) fn register_builtins() -> Result<(), Error> {
    connectors::register_plugins()?;
    driver::register_plugins()?;
    metrics::register_plugins()?;

    #[cfg(feature = "scylla")]
    scylla_driver::register_scylla()?;

    Ok(())
}
