//! The unit of work.
//!
//! A `Package` owns its fetch and extraction steps, build commands,
//! build-info description, dependency edges, and work directory. Its
//! life runs `Declared → Processed → Building → Built` (or `Failed`;
//! `Suppressed` is the Built-equivalent terminal state of forced-mode
//! exclusions). Recipe evaluation populates it single-threaded; after
//! that only the build worker that owns it mutates it.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::builddir::BuildDir;
use crate::buildinfo::BuildDescription;
use crate::cmd::{CmdError, Logger, PackageCmd};
use crate::extraction::{ExtractError, Extraction, ExtractionUnit};
use crate::fetch::{Fetch, FetchCtx, FetchError, FetchUnit};
use crate::namespace::NameSpace;
use crate::overlay::PathError;
use crate::recipe::{self, RecipeError};
use crate::util::copy::{copy_tree, LinkPolicy};
use crate::util::hash::{hash_file, hash_string};
use crate::world::World;

#[derive(Debug, Error)]
pub enum BuildError {
  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error(transparent)]
  Extract(#[from] ExtractError),

  #[error("build command failed: {0}")]
  Command(#[from] CmdError),

  #[error("dependency {package} failed")]
  DependencyFailed { package: String },

  #[error(transparent)]
  Path(#[from] PathError),

  #[error("io error: {0}")]
  Io(#[from] io::Error),
}

/// Per-package build state. `Suppressed` counts as built for
/// scheduling purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BuildState {
  Declared = 0,
  Processed = 1,
  Building = 2,
  Built = 3,
  Failed = 4,
  Suppressed = 5,
}

impl BuildState {
  fn from_u8(v: u8) -> Self {
    match v {
      1 => BuildState::Processed,
      2 => BuildState::Building,
      3 => BuildState::Built,
      4 => BuildState::Failed,
      5 => BuildState::Suppressed,
      _ => BuildState::Declared,
    }
  }
}

/// A dependency edge. `locally` forces the dependency to build again
/// when this package builds, even if its outputs already exist.
#[derive(Debug, Clone)]
pub struct Depend {
  package: Arc<Package>,
  locally: bool,
}

impl Depend {
  pub fn new(package: Arc<Package>, locally: bool) -> Self {
    Self { package, locally }
  }

  pub fn package(&self) -> &Arc<Package> {
    &self.package
  }

  pub fn locally(&self) -> bool {
    self.locally
  }
}

/// Recipe-populated state, guarded by one lock. Written by the recipe
/// evaluator before scheduling and by the owning build worker after.
#[derive(Debug, Default)]
struct PackageInner {
  depends: Vec<Depend>,
  commands: Vec<PackageCmd>,
  fetch: Fetch,
  extraction: Extraction,
  description: BuildDescription,
  install_files: Vec<String>,
  intercept_install: bool,
  intercept_staging: bool,
  hash_output: bool,
  suppress_remove_staging: bool,
  clean_before_build: bool,
  deps_extraction: Option<PathBuf>,
  deps_extraction_direct_only: bool,
}

/// Where a package's recipe lives: absolute path plus the short form
/// recorded in info files.
#[derive(Debug, Clone)]
pub struct RecipeFile {
  pub path: PathBuf,
  pub short: String,
}

pub struct Package {
  ns: Arc<NameSpace>,
  name: String,
  bd: BuildDir,
  file: Mutex<Option<RecipeFile>>,
  inner: Mutex<PackageInner>,
  buildinfo_hash: Mutex<Option<String>>,
  state: AtomicU8,
  was_built: AtomicBool,
  code_updated: AtomicBool,
  build_lock: Mutex<()>,
  run_secs: AtomicU64,
  logger: OnceLock<Logger>,
}

impl std::fmt::Debug for Package {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Package")
      .field("ns", &self.ns.name())
      .field("name", &self.name)
      .field("state", &self.state())
      .finish()
  }
}

impl Package {
  /// Create a declared package. `file` is given for the base package;
  /// everything else resolves its recipe through the overlays at
  /// process time.
  pub fn new(ns: Arc<NameSpace>, name: &str, pwd: &Path, file: Option<RecipeFile>) -> Arc<Self> {
    let bd = BuildDir::new(pwd, ns.name(), name);
    Arc::new(Self {
      ns,
      name: name.to_string(),
      bd,
      file: Mutex::new(file),
      inner: Mutex::new(PackageInner::default()),
      buildinfo_hash: Mutex::new(None),
      state: AtomicU8::new(BuildState::Declared as u8),
      was_built: AtomicBool::new(false),
      code_updated: AtomicBool::new(false),
      build_lock: Mutex::new(()),
      run_secs: AtomicU64::new(0),
      logger: OnceLock::new(),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn ns(&self) -> &Arc<NameSpace> {
    &self.ns
  }

  pub fn bd(&self) -> &BuildDir {
    &self.bd
  }

  pub fn logger(&self) -> &Logger {
    self.logger.get_or_init(|| {
      if let Some(parent) = self.bd.build_log().parent() {
        let _ = fs::create_dir_all(parent);
      }
      Logger::new(&self.name, &self.bd.build_log())
    })
  }

  // --- state machine ---------------------------------------------------

  pub fn state(&self) -> BuildState {
    BuildState::from_u8(self.state.load(Ordering::Acquire))
  }

  fn set_state(&self, state: BuildState) {
    self.state.store(state as u8, Ordering::Release);
  }

  pub fn is_built(&self) -> bool {
    matches!(self.state(), BuildState::Built | BuildState::Suppressed)
  }

  pub fn is_building(&self) -> bool {
    self.state() == BuildState::Building
  }

  pub fn is_failed(&self) -> bool {
    self.state() == BuildState::Failed
  }

  /// Claim the package for a worker. Returns false when another worker
  /// got there first.
  pub fn set_building(&self) -> bool {
    self
      .state
      .compare_exchange(
        BuildState::Processed as u8,
        BuildState::Building as u8,
        Ordering::AcqRel,
        Ordering::Acquire,
      )
      .is_ok()
  }

  pub fn mark_failed(&self) {
    self.set_state(BuildState::Failed);
  }

  pub fn was_built(&self) -> bool {
    self.was_built.load(Ordering::Acquire)
  }

  pub fn run_secs(&self) -> u64 {
    self.run_secs.load(Ordering::Acquire)
  }

  pub fn set_code_updated(&self) {
    self.code_updated.store(true, Ordering::Release);
  }

  pub fn is_code_updated(&self) -> bool {
    self.code_updated.load(Ordering::Acquire)
  }

  // --- recipe-facing mutators ------------------------------------------

  pub fn depend(&self, dep: Depend) {
    self.inner.lock().unwrap().depends.push(dep);
  }

  pub fn add_command(&self, cmd: PackageCmd) {
    self.inner.lock().unwrap().commands.push(cmd);
  }

  pub fn add_fetch_unit(&self, unit: FetchUnit) -> Arc<FetchUnit> {
    self.inner.lock().unwrap().fetch.add(unit)
  }

  pub fn add_extraction_unit(&self, unit: ExtractionUnit) {
    self.inner.lock().unwrap().extraction.add(unit);
  }

  pub fn add_install_file(&self, path: &str) {
    self.inner.lock().unwrap().install_files.push(path.to_string());
  }

  pub fn set_intercept(&self, install: bool, staging: bool) {
    let mut inner = self.inner.lock().unwrap();
    inner.intercept_install = install;
    inner.intercept_staging = staging;
  }

  pub fn set_suppress_remove_staging(&self) {
    self.inner.lock().unwrap().suppress_remove_staging = true;
  }

  pub fn set_hash_output(&self) {
    self.inner.lock().unwrap().hash_output = true;
  }

  pub fn set_clean_before_build(&self) {
    self.inner.lock().unwrap().clean_before_build = true;
  }

  pub fn set_deps_extract(&self, path: PathBuf, direct_only: bool) {
    let mut inner = self.inner.lock().unwrap();
    inner.deps_extraction = Some(path);
    inner.deps_extraction_direct_only = direct_only;
  }

  /// Run `f` against the build description (feature and require lines
  /// are appended during evaluation).
  pub fn with_description<R>(&self, f: impl FnOnce(&mut BuildDescription) -> R) -> R {
    f(&mut self.inner.lock().unwrap().description)
  }

  pub fn depends_snapshot(&self) -> Vec<Depend> {
    self.inner.lock().unwrap().depends.clone()
  }

  pub fn command_count(&self) -> usize {
    self.inner.lock().unwrap().commands.len()
  }

  pub fn intercept_install(&self) -> bool {
    self.inner.lock().unwrap().intercept_install
  }

  pub fn intercept_staging(&self) -> bool {
    self.inner.lock().unwrap().intercept_staging
  }

  pub fn is_hashing_output(&self) -> bool {
    self.inner.lock().unwrap().hash_output
  }

  pub fn recipe_file(&self) -> Option<RecipeFile> {
    self.file.lock().unwrap().clone()
  }

  // --- processing -------------------------------------------------------

  /// Evaluate the recipe, populating this package. Called exactly once,
  /// from the single-threaded evaluation phase.
  pub fn process(self: &Arc<Self>, world: &Arc<World>) -> Result<(), RecipeError> {
    if self.state() != BuildState::Declared {
      return Ok(());
    }

    let file = self.resolve_recipe_file(world)?;
    info!(package = %self.name, file = %file.short, "processing");

    let recipe_hash = hash_file(&file.path).map_err(RecipeError::Io)?;
    self.with_description(|d| d.add_package_file(&file.short, &recipe_hash));

    recipe::evaluate(world, self, &file)?;
    self.set_state(BuildState::Processed);
    Ok(())
  }

  fn resolve_recipe_file(&self, world: &World) -> Result<RecipeFile, RecipeError> {
    if let Some(file) = self.recipe_file() {
      return Ok(file);
    }
    let leaf = self.name.rsplit('/').next().unwrap_or(&self.name);
    let short = world
      .overlays()
      .resolve(world.pwd(), &self.name, &format!("{leaf}.lua"), false)?;
    let file = RecipeFile {
      path: world.pwd().join(&short),
      short,
    };
    *self.file.lock().unwrap() = Some(file.clone());
    Ok(file)
  }

  // --- fingerprints -----------------------------------------------------

  pub fn buildinfo_hash(&self) -> Option<String> {
    self.buildinfo_hash.lock().unwrap().clone()
  }

  /// Compose the build description and write `.build.info.new`.
  fn prepare_build_info(&self, world: &World) -> Result<(), BuildError> {
    let mut inner = self.inner.lock().unwrap();
    inner.description.reset_build_lines();

    if !inner.extraction.is_empty() {
      let (path, hash) = inner.extraction.info(&self.bd)?;
      inner.description.add_extraction_info_file(&path, &hash);
    }

    let deps = inner.depends.clone();
    for dep in &deps {
      let (path, hash, from_output) = dep.package().build_info();
      if from_output {
        inner.description.add_output_info_file(&path, &hash);
      } else {
        inner.description.add_build_info_file(&path, &hash);
      }
    }

    let contents = inner.description.render(world.ignored_features());
    fs::write(self.bd.build_info_new(), &contents)?;
    *self.buildinfo_hash.lock().unwrap() = Some(hash_string(&contents));
    Ok(())
  }

  /// The line dependents record for this package: the output-content
  /// fingerprint when `hash_output` is set, the build fingerprint
  /// otherwise.
  pub fn build_info(&self) -> (String, String, bool) {
    let short = self.bd.short_path();
    if self.is_hashing_output() {
      let path = short.join(".output.info");
      let hash = hash_file(&self.bd.output_info()).unwrap_or_default();
      (path.display().to_string(), hash, true)
    } else {
      let path = short.join(".build.info");
      let hash = self
        .buildinfo_hash()
        .or_else(|| hash_file(&self.bd.build_info()).ok())
        .unwrap_or_default();
      (path.display().to_string(), hash, false)
    }
  }

  fn update_buildinfo_hash_existing(&self) {
    *self.buildinfo_hash.lock().unwrap() = hash_file(&self.bd.build_info()).ok();
  }

  fn commit_build_info(&self) -> io::Result<()> {
    fs::rename(self.bd.build_info_new(), self.bd.build_info())
  }

  /// Write `.output.info`: one `sha256sum`-style line per file under
  /// `new/`, sorted by path.
  fn write_output_info(&self) -> Result<(), BuildError> {
    let root = self.bd.new_path();
    let mut entries: Vec<(String, String)> = Vec::new();
    for entry in WalkDir::new(&root).sort_by_file_name() {
      let entry = entry.map_err(io::Error::other)?;
      if !entry.file_type().is_file() {
        continue;
      }
      let rel = entry.path().strip_prefix(&root).map_err(io::Error::other)?;
      entries.push((rel.display().to_string(), hash_file(entry.path())?));
    }
    entries.sort();
    let contents: String = entries
      .into_iter()
      .map(|(path, hash)| format!("{hash}  {path}\n"))
      .collect();
    fs::write(self.bd.output_info(), contents)?;
    Ok(())
  }

  // --- rebuild decision -------------------------------------------------

  /// Decide whether this package actually needs work: changed inputs,
  /// missing outputs, or a forced condition.
  fn should_build(&self, locally: bool) -> bool {
    if self.is_code_updated() || locally {
      return true;
    }
    {
      let inner = self.inner.lock().unwrap();
      if !inner.install_files.is_empty() {
        return true;
      }
    }
    if !self.bd.staging_tar().exists() || !self.bd.install_tar().exists() {
      return true;
    }
    let committed = fs::read_to_string(self.bd.build_info());
    let new = fs::read_to_string(self.bd.build_info_new());
    match (committed, new) {
      (Ok(committed), Ok(new)) => committed != new,
      _ => true,
    }
  }

  // --- the build sequence ----------------------------------------------

  /// Build this package to completion. Dependencies must already be
  /// built when called from the scheduler; direct calls recurse.
  pub fn build(&self, world: &World, locally: bool) -> Result<(), BuildError> {
    let _guard = self.build_lock.lock().unwrap();
    if self.is_built() && !locally {
      return Ok(());
    }

    let started = Instant::now();

    // 1. Dependencies first.
    let deps = self.depends_snapshot();
    for dep in &deps {
      if !dep.package().is_built() {
        dep.package().build(world, false).map_err(|err| {
          warn!(package = %self.name, dependency = %dep.package().name(), error = %err, "dependency failed");
          BuildError::DependencyFailed {
            package: dep.package().name().to_string(),
          }
        })?;
      }
    }

    // 2. Forced-mode suppression: keep the old fingerprint visible to
    // dependents and skip the work.
    if world.is_forced_mode() && !world.is_forced(&self.name) {
      self.update_buildinfo_hash_existing();
      self.set_state(BuildState::Suppressed);
      info!(package = %self.name, "suppressed (not in forced list)");
      return Ok(());
    }

    self.bd.create_all()?;
    let logger = self.logger();

    if world.clean_packages() || self.inner.lock().unwrap().clean_before_build {
      self.bd.clean_work()?;
    }

    let ctx = FetchCtx {
      pwd: world.pwd(),
      registry: world.registry(),
      logger,
      ref_patterns: world.ref_patterns(),
    };

    // 3. Fetch sources and prepare the new extraction fingerprint.
    {
      let inner = self.inner.lock().unwrap();
      inner.fetch.fetch(&self.bd, &ctx)?;
      if inner.fetch.force_updated() {
        self.set_code_updated();
      }
      inner.extraction.prepare_new_info(&self.bd, &ctx)?;
    }

    // 4. Prepare the new build fingerprint.
    self.prepare_build_info(world)?;

    // 5. Anything to do?
    if !self.should_build(locally) {
      debug!(package = %self.name, "up to date");
      self.set_state(BuildState::Built);
      return Ok(());
    }

    // 5b. A remote cache can stand in for the local build, except under
    // a locally-triggered rebuild.
    if !locally && !world.is_fetch_only() {
      if let (Some(cache), Some(hash)) = (world.cache(), self.buildinfo_hash()) {
        let hashing = self.is_hashing_output();
        if cache
          .fetch_package(self.ns.name(), &self.name, &hash, hashing, &self.bd)
          .is_ok()
        {
          self.commit_build_info()?;
          self.set_state(BuildState::Built);
          return Ok(());
        }
        debug!(package = %self.name, "cache miss, building locally");
      }
    }

    // 6. Locally-flagged dependencies rebuild into their existing
    // output paths before this package consumes them.
    for dep in deps.iter().filter(|d| d.locally()) {
      dep.package().build(world, true).map_err(|_| BuildError::DependencyFailed {
        package: dep.package().name().to_string(),
      })?;
    }

    // 7. Fetch-only runs stop once sources are local.
    if world.is_fetch_only() {
      self.set_state(BuildState::Built);
      return Ok(());
    }

    // 8. Re-materialise the work tree when its fingerprint moved.
    {
      let inner = self.inner.lock().unwrap();
      if inner.extraction.extraction_required(&self.bd) || self.is_code_updated() {
        info!(package = %self.name, "extracting sources");
        inner.extraction.extract(&self.bd, &ctx)?;
      }
    }

    // 9. Fresh output trees, then the dependency staging closure.
    self.bd.clean()?;
    self.compose_staging(world, logger)?;

    // 10. Optional install-tree extraction for the recipe to pick over.
    let deps_extract = {
      let inner = self.inner.lock().unwrap();
      inner.deps_extraction.clone().map(|p| (p, inner.deps_extraction_direct_only))
    };
    if let Some((dir, direct_only)) = deps_extract {
      self.extract_install_deps(world, &dir, direct_only, logger)?;
    }

    // 11. The recipe's commands, in order.
    let commands = self.inner.lock().unwrap().commands.clone();
    for cmd in &commands {
      cmd.run(world.pwd(), logger)?;
    }

    // 12. Capture outputs.
    self.package_new_staging(world, logger)?;
    self.package_new_install(world, logger)?;

    // 13. Commit fingerprints.
    self.commit_build_info()?;
    if self.is_hashing_output() {
      self.write_output_info()?;
    }

    // 14. Reclaim the composed staging tree.
    let keep = self.inner.lock().unwrap().suppress_remove_staging || world.keep_staging();
    self.bd.clean_staging(keep)?;

    // 15. Done.
    self.run_secs.store(started.elapsed().as_secs(), Ordering::Release);
    self.was_built.store(true, Ordering::Release);
    self.set_state(BuildState::Built);
    info!(package = %self.name, secs = self.run_secs(), "built");
    Ok(())
  }

  // --- staging / install composition ------------------------------------

  fn collect_staging_packages(&self, out: &mut Vec<Arc<Package>>, seen: &mut HashSet<(String, String)>) {
    for dep in self.depends_snapshot() {
      let p = dep.package();
      let key = (p.ns().name().to_string(), p.name().to_string());
      if seen.insert(key) {
        out.push(p.clone());
        if !p.intercept_staging() {
          p.collect_staging_packages(out, seen);
        }
      }
    }
  }

  fn collect_install_packages(
    &self,
    out: &mut Vec<Arc<Package>>,
    seen: &mut HashSet<(String, String)>,
    include_children: bool,
  ) {
    for dep in self.depends_snapshot() {
      let p = dep.package();
      let key = (p.ns().name().to_string(), p.name().to_string());
      if seen.insert(key) {
        out.push(p.clone());
        if include_children && !p.intercept_install() {
          p.collect_install_packages(out, seen, include_children);
        }
      }
    }
  }

  /// Unpack every transitively staged dependency into this package's
  /// staging tree. Parallel across dependencies when the thread limit
  /// is unlimited; all-or-nothing either way.
  fn compose_staging(&self, world: &World, logger: &Logger) -> Result<(), BuildError> {
    let mut list = Vec::new();
    let mut seen = HashSet::new();
    self.collect_staging_packages(&mut list, &mut seen);
    if list.is_empty() {
      return Ok(());
    }
    debug!(package = %self.name, deps = list.len(), "composing staging");

    let staging = self.bd.staging();
    let pwd = world.pwd();
    if world.threads_limit() == 0 {
      let results: Vec<Result<(), BuildError>> = std::thread::scope(|scope| {
        let staging = &staging;
        let handles: Vec<_> = list
          .iter()
          .map(|dep| scope.spawn(move || extract_tarball(&dep.bd().staging_tar(), staging, pwd, logger)))
          .collect();
        handles.into_iter().map(|h| h.join().expect("staging extraction panicked")).collect()
      });
      for result in results {
        result?;
      }
    } else {
      for dep in &list {
        extract_tarball(&dep.bd().staging_tar(), &staging, pwd, logger)?;
      }
    }
    Ok(())
  }

  /// Unpack dependency install tarballs into the recipe's chosen
  /// directory (`bd:fetch{method='deps'}`).
  fn extract_install_deps(
    &self,
    world: &World,
    dir: &Path,
    direct_only: bool,
    logger: &Logger,
  ) -> Result<(), BuildError> {
    if dir.exists() {
      fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;

    let mut list = Vec::new();
    let mut seen = HashSet::new();
    self.collect_install_packages(&mut list, &mut seen, !direct_only);
    for dep in &list {
      extract_tarball(&dep.bd().install_tar(), dir, world.pwd(), logger)?;
    }
    Ok(())
  }

  // --- output capture ----------------------------------------------------

  fn package_new_staging(&self, world: &World, logger: &Logger) -> Result<(), BuildError> {
    create_tarball(&self.bd.new_staging(), &self.bd.staging_tar(), world.pwd(), logger)
  }

  fn package_new_install(&self, world: &World, logger: &Logger) -> Result<(), BuildError> {
    let install_files = self.inner.lock().unwrap().install_files.clone();
    if install_files.is_empty() {
      return create_tarball(&self.bd.new_install(), &self.bd.install_tar(), world.pwd(), logger);
    }
    for file in &install_files {
      let src = self.bd.new_install().join(file);
      let dest = self.bd.install_dir().join(file);
      if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
      }
      copy_tree(&src, &dest, LinkPolicy::Follow)?;
    }
    Ok(())
  }
}

/// `tar xf <tarball>` with the destination as working directory.
fn extract_tarball(tarball: &Path, into: &Path, pwd: &Path, logger: &Logger) -> Result<(), BuildError> {
  let mut cmd = PackageCmd::new(into, "tar");
  cmd.add_arg("xf");
  cmd.add_arg(tarball.display().to_string());
  cmd.run(pwd, logger)?;
  Ok(())
}

/// Capture a tree as a POSIX tarball with numeric owners and 256-block
/// records.
fn create_tarball(tree: &Path, tarball: &Path, pwd: &Path, logger: &Logger) -> Result<(), BuildError> {
  let mut cmd = PackageCmd::new(tree, "tar");
  cmd.add_arg("--format=posix");
  cmd.add_arg("--numeric-owner");
  cmd.add_arg("-b");
  cmd.add_arg("256");
  cmd.add_arg("-cf");
  cmd.add_arg(tarball.display().to_string());
  cmd.add_arg(".");
  cmd.run(pwd, logger)?;
  Ok(())
}
