//! The build-info fingerprint.
//!
//! A package's `.build.info` file is the ordered concatenation of
//! [`BuildUnit`] lines: the recipe file's hash, every feature value the
//! recipe queried, every required file, the extraction fingerprint, and
//! one line per dependency. The SHA-256 of the file is the package's
//! build-info hash, the package's cache key and stable identity.

use std::collections::HashSet;
use std::fmt::Write;

/// One line of the build-info file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildUnit {
  /// The recipe file itself.
  PackageFile { path: String, hash: String },
  /// This package's own extraction fingerprint.
  ExtractionInfoFile { path: String, hash: String },
  /// A normal dependency's build fingerprint.
  BuildInfoFile { path: String, hash: String },
  /// A `hash_output` dependency's output-content fingerprint.
  OutputInfoFile { path: String, hash: String },
  /// A file pulled in via `require`/`optionally_require`.
  RequireFile { path: String, hash: String },
  /// A feature the recipe queried, with the value it saw.
  FeatureValue { key: String, value: String },
  /// A feature the recipe queried that was absent.
  FeatureNil { key: String },
}

impl BuildUnit {
  pub fn print_line(&self) -> String {
    match self {
      BuildUnit::PackageFile { path, hash } => format!("PackageFile {path} {hash}\n"),
      BuildUnit::ExtractionInfoFile { path, hash } => format!("ExtractionInfoFile {path} {hash}\n"),
      BuildUnit::BuildInfoFile { path, hash } => format!("BuildInfoFile {path} {hash}\n"),
      BuildUnit::OutputInfoFile { path, hash } => format!("OutputInfoFile {path} {hash}\n"),
      BuildUnit::RequireFile { path, hash } => format!("RequireFile {path} {hash}\n"),
      BuildUnit::FeatureValue { key, value } => format!("FeatureValue {key} {value}\n"),
      BuildUnit::FeatureNil { key } => format!("FeatureValueNil {key}\n"),
    }
  }

  fn feature_key(&self) -> Option<&str> {
    match self {
      BuildUnit::FeatureValue { key, .. } | BuildUnit::FeatureNil { key } => Some(key),
      _ => None,
    }
  }
}

/// The ordered build-info lines for one package.
///
/// Units are appended as recipe evaluation and build preparation
/// discover them; the order is part of the fingerprint.
#[derive(Debug, Default)]
pub struct BuildDescription {
  units: Vec<BuildUnit>,
}

impl BuildDescription {
  pub fn add(&mut self, unit: BuildUnit) {
    self.units.push(unit);
  }

  pub fn add_package_file(&mut self, path: &str, hash: &str) {
    self.add(BuildUnit::PackageFile {
      path: path.to_string(),
      hash: hash.to_string(),
    });
  }

  pub fn add_feature_value(&mut self, key: &str, value: &str) {
    self.add(BuildUnit::FeatureValue {
      key: key.to_string(),
      value: value.to_string(),
    });
  }

  pub fn add_nil_feature_value(&mut self, key: &str) {
    self.add(BuildUnit::FeatureNil { key: key.to_string() });
  }

  pub fn add_require_file(&mut self, path: &str, hash: &str) {
    self.add(BuildUnit::RequireFile {
      path: path.to_string(),
      hash: hash.to_string(),
    });
  }

  pub fn add_extraction_info_file(&mut self, path: &str, hash: &str) {
    self.add(BuildUnit::ExtractionInfoFile {
      path: path.to_string(),
      hash: hash.to_string(),
    });
  }

  pub fn add_build_info_file(&mut self, path: &str, hash: &str) {
    self.add(BuildUnit::BuildInfoFile {
      path: path.to_string(),
      hash: hash.to_string(),
    });
  }

  pub fn add_output_info_file(&mut self, path: &str, hash: &str) {
    self.add(BuildUnit::OutputInfoFile {
      path: path.to_string(),
      hash: hash.to_string(),
    });
  }

  /// Drop the dependency and extraction lines so the description can be
  /// re-composed on a later build of the same process.
  pub fn reset_build_lines(&mut self) {
    self.units.retain(|u| {
      !matches!(
        u,
        BuildUnit::ExtractionInfoFile { .. }
          | BuildUnit::BuildInfoFile { .. }
          | BuildUnit::OutputInfoFile { .. }
      )
    });
  }

  /// Render the info file. Features on the ignored list are omitted
  /// entirely, so flipping them never invalidates caches.
  pub fn render(&self, ignored_features: &HashSet<String>) -> String {
    let mut out = String::new();
    for unit in &self.units {
      if let Some(key) = unit.feature_key() {
        if ignored_features.contains(key) {
          continue;
        }
      }
      let _ = out.write_str(&unit.print_line());
    }
    out
  }
}
