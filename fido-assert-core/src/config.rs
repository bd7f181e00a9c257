//! Environment lookups shared by the config loaders.

use std::str::FromStr;

/// Parse `key` from the environment. Unset or unparseable values are `None`.
pub(crate) fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
