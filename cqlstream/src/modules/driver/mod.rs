//! CQL driver adapters. The [`crate::Driver`] trait itself lives in the crate root; this module
//! holds concrete implementations and their registration.
use crate::Error;

pub mod mock;

pub(crate) fn register_plugins() -> Result<(), Error> {
    mock::register_mock()?;
    Ok(())
}
