//! On-disk layout of one package's work area.
//!
//! Every package owns a `BuildDir` rooted at
//! `<pwd>/output/<namespace>/<name>/`:
//!
//! ```text
//! output/<ns>/<name>/work/          build tree (extraction targets)
//! output/<ns>/<name>/new/staging/   pre-package staging output
//! output/<ns>/<name>/new/install/   pre-package install output
//! output/<ns>/<name>/staging/       composed staging for this build
//! output/<ns>/<name>/build.log      per-package command log
//! output/<ns>/staging/<name>.tar    archived staging output (public)
//! output/<ns>/install/<name>.tar    archived install output (public)
//! ```
//!
//! The fingerprint files (`.extraction.info`, `.build.info`,
//! `.output.info`) live inside `work/`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Path accessors and cleanup operations for a package work area.
#[derive(Debug, Clone)]
pub struct BuildDir {
  pwd: PathBuf,
  ns: String,
  name: String,
}

impl BuildDir {
  pub fn new(pwd: &Path, ns: &str, name: &str) -> Self {
    Self {
      pwd: pwd.to_path_buf(),
      ns: ns.to_string(),
      name: name.to_string(),
    }
  }

  fn base(&self) -> PathBuf {
    self.pwd.join("output").join(&self.ns).join(&self.name)
  }

  /// The work tree extraction units materialise into.
  pub fn path(&self) -> PathBuf {
    self.base().join("work")
  }

  /// `path()` made relative to the working directory, so info files
  /// record paths that are portable across checkouts.
  pub fn short_path(&self) -> PathBuf {
    PathBuf::from("output").join(&self.ns).join(&self.name).join("work")
  }

  pub fn new_path(&self) -> PathBuf {
    self.base().join("new")
  }

  pub fn new_staging(&self) -> PathBuf {
    self.base().join("new").join("staging")
  }

  pub fn new_install(&self) -> PathBuf {
    self.base().join("new").join("install")
  }

  /// The staging tree composed from dependency outputs for this build.
  pub fn staging(&self) -> PathBuf {
    self.base().join("staging")
  }

  pub fn build_log(&self) -> PathBuf {
    self.base().join("build.log")
  }

  /// The public staging tarball for this package.
  pub fn staging_tar(&self) -> PathBuf {
    self.pwd.join("output").join(&self.ns).join("staging").join(format!("{}.tar", self.name))
  }

  /// The public install tarball for this package.
  pub fn install_tar(&self) -> PathBuf {
    self.pwd.join("output").join(&self.ns).join("install").join(format!("{}.tar", self.name))
  }

  /// The public install directory (used by install-file mode).
  pub fn install_dir(&self) -> PathBuf {
    self.pwd.join("output").join(&self.ns).join("install")
  }

  pub fn extraction_info(&self) -> PathBuf {
    self.path().join(".extraction.info")
  }

  pub fn extraction_info_new(&self) -> PathBuf {
    self.path().join(".extraction.info.new")
  }

  pub fn build_info(&self) -> PathBuf {
    self.path().join(".build.info")
  }

  pub fn build_info_new(&self) -> PathBuf {
    self.path().join(".build.info.new")
  }

  pub fn output_info(&self) -> PathBuf {
    self.path().join(".output.info")
  }

  pub fn pwd(&self) -> &Path {
    &self.pwd
  }

  /// Create the whole directory layout. Idempotent; called before any
  /// part of the engine relies on the paths existing.
  pub fn create_all(&self) -> io::Result<()> {
    fs::create_dir_all(self.path())?;
    fs::create_dir_all(self.new_staging())?;
    fs::create_dir_all(self.new_install())?;
    fs::create_dir_all(self.staging())?;
    fs::create_dir_all(self.staging_tar().parent().unwrap_or(&self.pwd))?;
    fs::create_dir_all(self.install_dir())?;
    Ok(())
  }

  /// Wipe and recreate the pre-package and composed staging trees.
  pub fn clean(&self) -> io::Result<()> {
    for dir in [self.new_staging(), self.new_install(), self.staging()] {
      remove_and_recreate(&dir)?;
    }
    Ok(())
  }

  /// Wipe and recreate the work tree (`builddir(true)` in a recipe).
  pub fn clean_work(&self) -> io::Result<()> {
    remove_and_recreate(&self.path())
  }

  /// Remove the composed staging tree to reclaim space; a no-op when the
  /// package asked to keep it.
  pub fn clean_staging(&self, suppressed: bool) -> io::Result<()> {
    if suppressed {
      return Ok(());
    }
    let staging = self.staging();
    if staging.exists() {
      fs::remove_dir_all(&staging)?;
    }
    Ok(())
  }
}

fn remove_and_recreate(dir: &Path) -> io::Result<()> {
  if dir.exists() {
    fs::remove_dir_all(dir)?;
  }
  fs::create_dir_all(dir)
}
