//! Process-wide feature store.
//!
//! Features are string key/value pairs that recipes query to steer their
//! builds. A key can be scoped to a package by prefixing it with the
//! package name (`zlib:debug`); lookups walk from the most specific
//! prefix to the bare key.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeatureError {
  #[error("no such feature: {0}")]
  NoKey(String),
}

/// A key→value map with scoped override rules.
///
/// Single-writer during recipe evaluation, read-only during builds.
#[derive(Debug, Default)]
pub struct FeatureMap {
  features: Mutex<HashMap<String, String>>,
}

impl FeatureMap {
  pub fn new() -> Self {
    Self::default()
  }

  /// Insert `key` if absent; replace an existing value only when
  /// `override_existing` is set.
  pub fn set(&self, key: &str, value: &str, override_existing: bool) {
    let mut map = self.features.lock().unwrap();
    if map.contains_key(key) {
      if override_existing {
        map.insert(key.to_string(), value.to_string());
      }
      return;
    }
    map.insert(key.to_string(), value.to_string());
  }

  pub fn get(&self, key: &str) -> Result<String, FeatureError> {
    self
      .features
      .lock()
      .unwrap()
      .get(key)
      .cloned()
      .ok_or_else(|| FeatureError::NoKey(key.to_string()))
  }

  /// Look `key` up for a package.
  ///
  /// Tries `<package_name>:<key>` first, then the same with each parent
  /// directory of the package name (`a/b/c` → `a/b` → `a`), and finally
  /// the bare key.
  pub fn get_scoped(&self, package_name: &str, key: &str) -> Result<String, FeatureError> {
    if package_name.is_empty() {
      return self.get(key);
    }
    if let Ok(value) = self.get(&format!("{package_name}:{key}")) {
      return Ok(value);
    }
    match package_name.rfind('/') {
      Some(pos) => self.get_scoped(&package_name[..pos], key),
      None => self.get(key),
    }
  }

  /// Parse a `key=value` command-line argument and set it with override.
  pub fn set_from_arg(&self, arg: &str) -> Result<(), FeatureError> {
    let (key, value) = arg
      .split_once('=')
      .ok_or_else(|| FeatureError::NoKey(arg.to_string()))?;
    self.set(key, value, true);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn set_does_not_replace_without_override() {
    let map = FeatureMap::new();
    map.set("arch", "arm", false);
    map.set("arch", "x86", false);
    assert_eq!(map.get("arch").unwrap(), "arm");

    map.set("arch", "x86", true);
    assert_eq!(map.get("arch").unwrap(), "x86");
  }

  #[test]
  fn missing_key_is_an_error() {
    let map = FeatureMap::new();
    assert!(matches!(map.get("nope"), Err(FeatureError::NoKey(_))));
  }

  #[test]
  fn scoped_lookup_prefers_package_prefix() {
    let map = FeatureMap::new();
    map.set("debug", "no", false);
    map.set("zlib:debug", "yes", false);
    assert_eq!(map.get_scoped("zlib", "debug").unwrap(), "yes");
    assert_eq!(map.get_scoped("openssl", "debug").unwrap(), "no");
  }

  #[test]
  fn scoped_lookup_walks_parent_directories() {
    let map = FeatureMap::new();
    map.set("tools:opt", "base", false);
    map.set("tools/editors/vim:opt", "deep", false);
    assert_eq!(map.get_scoped("tools/editors/vim", "opt").unwrap(), "deep");
    assert_eq!(map.get_scoped("tools/editors/nano", "opt").unwrap(), "base");
    assert!(map.get_scoped("other/pkg", "opt").is_err());
  }

  #[test]
  fn arg_parsing() {
    let map = FeatureMap::new();
    map.set_from_arg("board=ax300").unwrap();
    assert_eq!(map.get("board").unwrap(), "ax300");
    assert!(map.set_from_arg("malformed").is_err());
  }
}
