//! Overlay search for recipe-relative paths.
//!
//! Recipes name patches, required files, and copy sources relative to
//! their own directory. Those names are resolved against an ordered list
//! of overlay roots, so a product tree can shadow files from a base
//! tree. Resolution rules:
//!
//! - absolute paths and `dl/` paths pass through unchanged;
//! - paths starting with `.` are tried as `<overlay>/<path>`;
//! - anything else is tried as `<overlay>/package/<name>/<path>`, and,
//!   when the caller allows it, as `<overlay>/<path>` too.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
  #[error("file not found in any overlay: {0}")]
  FileNotFound(String),
}

/// The ordered overlay roots. The default list is just `.`, the working
/// directory itself.
#[derive(Debug)]
pub struct OverlayList {
  overlays: Mutex<Vec<String>>,
}

impl Default for OverlayList {
  fn default() -> Self {
    Self {
      overlays: Mutex::new(vec![".".to_string()]),
    }
  }
}

impl OverlayList {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add an overlay root, either at the front (highest priority) or the
  /// back of the search order.
  pub fn add(&self, path: &str, top: bool) {
    let mut overlays = self.overlays.lock().unwrap();
    if top {
      overlays.insert(0, path.to_string());
    } else {
      overlays.push(path.to_string());
    }
  }

  /// Resolve `location` for `package_name`, returning a path relative to
  /// `pwd` (or absolute, when the input was).
  pub fn resolve(
    &self,
    pwd: &Path,
    package_name: &str,
    location: &str,
    also_root: bool,
  ) -> Result<String, PathError> {
    if location.starts_with('/') || location.starts_with("dl/") {
      return Ok(location.to_string());
    }

    let overlays = self.overlays.lock().unwrap();
    for overlay in overlays.iter() {
      let mut candidates: Vec<String> = Vec::new();
      if location.starts_with('.') {
        candidates.push(format!("{overlay}/{location}"));
      } else {
        candidates.push(format!("{overlay}/package/{package_name}/{location}"));
        if also_root {
          candidates.push(format!("{overlay}/{location}"));
        }
      }
      for candidate in candidates {
        if pwd.join(&candidate).exists() {
          return Ok(candidate);
        }
      }
    }
    Err(PathError::FileNotFound(location.to_string()))
  }

  /// Like [`resolve`](Self::resolve) but returns an absolute path.
  pub fn resolve_absolute(
    &self,
    pwd: &Path,
    package_name: &str,
    location: &str,
    also_root: bool,
  ) -> Result<PathBuf, PathError> {
    let rel = self.resolve(pwd, package_name, location, also_root)?;
    if rel.starts_with('/') {
      Ok(PathBuf::from(rel))
    } else {
      Ok(pwd.join(rel))
    }
  }
}
