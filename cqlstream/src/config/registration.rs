use super::{Callback, ConfigSpec, ItemType, RegisteredItem, ENV};
use crate::Error;
use tracing::{debug, error};

/// Registers a plugin implementation under `name` within the given category, with the schema
/// that will validate its configuration block and the callback that constructs it.
///
/// Plugins must be registered before any [`super::Config::validate`] call resolves them; built-in
/// plugins register themselves from [`crate::modules::register_builtins`].
pub fn register_plugin(
    name: String,
    itype: ItemType,
    format: ConfigSpec,
    creator: Callback,
) -> Result<(), Error> {
    let r = RegisteredItem { creator, format };

    match ENV.lock() {
        Ok(mut lock) => match lock.get_mut(&itype) {
            Some(i) => {
                if i.insert(name.clone(), r).is_some() {
                    error!(name = name.clone(), "plugin is already registered");
                    return Err(Error::DuplicateRegisteredName(name));
                }
                debug!(
                    name = name.clone(),
                    plugin_type = format!("{itype}"),
                    "plugin registered"
                );
            }
            None => {
                error!(kind = "unable to borrow mut", "internal error");
                return Err(Error::UnableToSecureLock);
            }
        },
        Err(_) => {
            error!(kind = "unable to secure lock", "internal error");
            return Err(Error::UnableToSecureLock);
        }
    }

    Ok(())
}
