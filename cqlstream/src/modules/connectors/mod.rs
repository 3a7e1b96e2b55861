//! Record sources (load direction) and sinks (unload direction).
//!
//! The [`crate::Connector`] trait itself lives in the crate root, alongside the rest of the
//! core's plugin interfaces; this module holds concrete implementations and their registration.
use crate::Error;

pub mod file;
pub mod stdin;
pub mod stdout;

#[cfg(test)]
pub mod mock;

pub(crate) fn register_plugins() -> Result<(), Error> {
    file::register_file()?;
    stdin::register_stdin()?;
    stdout::register_stdout()?;
    Ok(())
}
