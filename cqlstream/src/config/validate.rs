use super::{ItemType, ParsedRegisteredItem, RegisteredItem, ENV};
use crate::Error;
use serde_yaml::Value;
use std::collections::HashMap;
use tracing::trace;

/// Looks up the single registered plugin named by `map`'s only key, validates its configuration
/// block against the plugin's schema, and returns the item ready for construction.
pub async fn parse_configuration_item(
    itype: ItemType,
    map: &HashMap<String, Value>,
) -> Result<ParsedRegisteredItem, Error> {
    let keys: Vec<String> = map.keys().cloned().collect();
    let first_key = keys
        .first()
        .ok_or_else(|| Error::ConfigFailedValidation(format!("unable to determine {itype} key")))?;
    trace!("validating item {} of type {}", first_key, itype);
    let item = get_item(&itype, first_key)?;

    let content = map.get(first_key).ok_or_else(|| {
        Error::ConfigFailedValidation(format!("unable to validate {itype} key {first_key}"))
    })?;

    let content_str = serde_yaml::to_string(content)?;
    item.format.validate(&content_str)?;
    trace!("format for {} validated", first_key);
    Ok(ParsedRegisteredItem {
        creator: item.creator,
        config: content.clone(),
    })
}

fn get_item(itype: &ItemType, key: &String) -> Result<RegisteredItem, Error> {
    match ENV.lock() {
        Ok(lock) => {
            if let Some(i) = lock.get(itype) {
                if let Some(item) = i.get(key) {
                    return Ok(item.clone());
                }
            } else {
                return Err(Error::UnableToSecureLock);
            }
        }
        Err(_) => return Err(Error::UnableToSecureLock),
    }
    Err(Error::ConfigurationItemNotFound(key.clone()))
}
