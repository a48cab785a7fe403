//! Package namespaces.
//!
//! Packages are unique by (namespace, name); each namespace gets its
//! own `output/<ns>/` directory tree. The namespace owns its packages;
//! dependency edges elsewhere are shared handles into this arena.

use std::sync::{Arc, Mutex};

use crate::package::Package;

/// A named package arena.
#[derive(Debug)]
pub struct NameSpace {
  name: String,
  packages: Mutex<Vec<Arc<Package>>>,
}

impl NameSpace {
  pub fn new(name: &str) -> Arc<Self> {
    Arc::new(Self {
      name: name.to_string(),
      packages: Mutex::new(Vec::new()),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn get_package(&self, name: &str) -> Option<Arc<Package>> {
    self
      .packages
      .lock()
      .unwrap()
      .iter()
      .find(|p| p.name() == name)
      .cloned()
  }

  /// Register a freshly created package. Returns the existing handle
  /// instead when the name is already taken, keeping names unique.
  pub fn register(&self, package: Arc<Package>) -> Arc<Package> {
    let mut packages = self.packages.lock().unwrap();
    if let Some(existing) = packages.iter().find(|p| p.name() == package.name()) {
      return existing.clone();
    }
    packages.push(package.clone());
    package
  }

  pub fn packages(&self) -> Vec<Arc<Package>> {
    self.packages.lock().unwrap().clone()
  }
}
