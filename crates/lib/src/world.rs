//! The process-wide orchestrator.
//!
//! A `World` owns the package arena, the feature map, the overlay list,
//! the download registry, and the run configuration. `run` drives the
//! whole pipeline: evaluate the base recipe (which declares further
//! packages), check the dependency graph for cycles, then repeatedly
//! hand ready packages to a pool of worker threads until the graph is
//! empty or a failure ends the run.

use std::collections::{HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use thiserror::Error;
use tracing::{debug, error, info};

use crate::cache::CacheClient;
use crate::features::FeatureMap;
use crate::fetch::DownloadRegistry;
use crate::graph::{DepGraph, GraphError};
use crate::namespace::NameSpace;
use crate::overlay::OverlayList;
use crate::package::{Package, RecipeFile};
use crate::recipe::RecipeError;

#[derive(Debug, Error)]
pub enum WorldError {
  #[error(transparent)]
  Recipe(#[from] RecipeError),

  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error("{} package(s) failed: {}", .packages.len(), .packages.join(", "))]
  PackagesFailed { packages: Vec<String> },

  #[error("io error: {0}")]
  Io(#[from] io::Error),
}

/// Run configuration, fixed before any package is processed.
#[derive(Debug, Default)]
pub struct WorldOpts {
  /// Stop after recipe evaluation.
  pub parse_only: bool,
  /// Let unaffected subtrees keep building after a failure.
  pub keep_going: bool,
  /// Stop each package once its sources are local.
  pub fetch_only: bool,
  /// Worker thread limit; 0 means unlimited.
  pub threads_limit: usize,
  /// Wipe every package's work tree before building.
  pub clean_packages: bool,
  /// Keep every composed staging tree after building.
  pub keep_staging: bool,
  /// Forced mode: only these packages build, the rest are suppressed.
  pub forced: Vec<String>,
  /// Base URL of the remote build cache.
  pub fetch_from: Option<String>,
  /// Feature keys omitted from build-info files.
  pub ignored_features: HashSet<String>,
  /// `prefix,replacement` patterns for git mirror references.
  pub ref_patterns: Vec<(String, String)>,
}

/// Outcome of a run, for front-end reporting.
#[derive(Debug)]
pub struct RunSummary {
  pub packages: usize,
  pub built: usize,
  pub failed: Vec<String>,
}

#[derive(Default)]
struct Scheduler {
  graph: Option<DepGraph>,
}

pub struct World {
  pwd: PathBuf,
  opts: WorldOpts,
  features: FeatureMap,
  overlays: OverlayList,
  registry: DownloadRegistry,
  cache: Option<CacheClient>,
  namespaces: Mutex<Vec<Arc<NameSpace>>>,
  pending: Mutex<VecDeque<Arc<Package>>>,
  scheduler: Mutex<Scheduler>,
  cond: Condvar,
  threads_running: AtomicUsize,
  failed: AtomicBool,
  failed_packages: Mutex<Vec<String>>,
}

impl World {
  pub fn new(pwd: &Path, opts: WorldOpts) -> Arc<Self> {
    let cache = opts.fetch_from.as_deref().map(CacheClient::new);
    Arc::new(Self {
      pwd: pwd.to_path_buf(),
      opts,
      features: FeatureMap::new(),
      overlays: OverlayList::new(),
      registry: DownloadRegistry::new(),
      cache,
      namespaces: Mutex::new(Vec::new()),
      pending: Mutex::new(VecDeque::new()),
      scheduler: Mutex::new(Scheduler::default()),
      cond: Condvar::new(),
      threads_running: AtomicUsize::new(0),
      failed: AtomicBool::new(false),
      failed_packages: Mutex::new(Vec::new()),
    })
  }

  // --- accessors --------------------------------------------------------

  pub fn pwd(&self) -> &Path {
    &self.pwd
  }

  pub fn features(&self) -> &FeatureMap {
    &self.features
  }

  pub fn overlays(&self) -> &OverlayList {
    &self.overlays
  }

  pub fn registry(&self) -> &DownloadRegistry {
    &self.registry
  }

  pub fn cache(&self) -> Option<&CacheClient> {
    self.cache.as_ref()
  }

  pub fn ref_patterns(&self) -> &[(String, String)] {
    &self.opts.ref_patterns
  }

  pub fn ignored_features(&self) -> &HashSet<String> {
    &self.opts.ignored_features
  }

  pub fn threads_limit(&self) -> usize {
    self.opts.threads_limit
  }

  pub fn is_fetch_only(&self) -> bool {
    self.opts.fetch_only
  }

  pub fn keep_going(&self) -> bool {
    self.opts.keep_going
  }

  pub fn clean_packages(&self) -> bool {
    self.opts.clean_packages
  }

  pub fn keep_staging(&self) -> bool {
    self.opts.keep_staging
  }

  pub fn is_forced_mode(&self) -> bool {
    !self.opts.forced.is_empty()
  }

  pub fn is_forced(&self, name: &str) -> bool {
    self.opts.forced.iter().any(|f| f == name)
  }

  pub fn is_failed(&self) -> bool {
    self.failed.load(Ordering::Acquire)
  }

  // --- package arena ----------------------------------------------------

  pub fn find_namespace(&self, name: &str) -> Arc<NameSpace> {
    let mut namespaces = self.namespaces.lock().unwrap();
    if let Some(ns) = namespaces.iter().find(|ns| ns.name() == name) {
      return ns.clone();
    }
    let ns = NameSpace::new(name);
    namespaces.push(ns.clone());
    ns
  }

  /// Look a package up in its namespace, declaring it (and queueing it
  /// for processing) when it does not exist yet.
  pub fn find_package(&self, ns: &Arc<NameSpace>, name: &str) -> Arc<Package> {
    if let Some(existing) = ns.get_package(name) {
      return existing;
    }
    let package = ns.register(Package::new(ns.clone(), name, &self.pwd, None));
    self.pending.lock().unwrap().push_back(package.clone());
    package
  }

  /// Every package in every namespace, in declaration order.
  pub fn packages(&self) -> Vec<Arc<Package>> {
    self
      .namespaces
      .lock()
      .unwrap()
      .iter()
      .flat_map(|ns| ns.packages())
      .collect()
  }

  // --- the run ----------------------------------------------------------

  /// Declare the base package from an explicit recipe file. The file's
  /// stem names both the package and its namespace.
  pub fn base_package(&self, file: &str) -> Arc<Package> {
    let path = if Path::new(file).is_absolute() {
      PathBuf::from(file)
    } else {
      self.pwd.join(file)
    };
    let stem = Path::new(file)
      .file_stem()
      .map(|s| s.to_string_lossy().to_string())
      .unwrap_or_else(|| file.to_string());

    let ns = self.find_namespace(&stem);
    let package = ns.register(Package::new(
      ns.clone(),
      &stem,
      &self.pwd,
      Some(RecipeFile {
        path,
        short: file.to_string(),
      }),
    ));
    self.pending.lock().unwrap().push_back(package.clone());
    package
  }

  /// Evaluate recipes until no declared package remains. Evaluation is
  /// single-threaded; `depend()` calls grow the queue.
  pub fn process_pending(self: &Arc<Self>) -> Result<(), RecipeError> {
    loop {
      let next = self.pending.lock().unwrap().pop_front();
      match next {
        Some(package) => package.process(self)?,
        None => return Ok(()),
      }
    }
  }

  /// The whole pipeline: evaluate, cycle-check, schedule, report.
  pub fn run(self: &Arc<Self>, file: &str) -> Result<RunSummary, WorldError> {
    let base = self.base_package(file);
    self.process_pending()?;
    info!(packages = self.packages().len(), "recipes processed");

    if self.opts.parse_only {
      return Ok(self.summary());
    }

    self.build_all(&base)?;

    let summary = self.summary();
    if !summary.failed.is_empty() {
      return Err(WorldError::PackagesFailed {
        packages: summary.failed,
      });
    }
    Ok(summary)
  }

  fn summary(&self) -> RunSummary {
    let packages = self.packages();
    RunSummary {
      packages: packages.len(),
      built: packages.iter().filter(|p| p.was_built()).count(),
      failed: self.failed_packages.lock().unwrap().clone(),
    }
  }

  // --- scheduling -------------------------------------------------------

  fn build_all(self: &Arc<Self>, base: &Arc<Package>) -> Result<(), WorldError> {
    let graph = DepGraph::fill(base);
    graph.check_for_dependency_loops()?;
    let _ = graph.output_dot(&self.pwd.join("dependencies.dot"));
    info!(packages = graph.len(), threads = self.opts.threads_limit, "scheduling builds");

    self.scheduler.lock().unwrap().graph = Some(graph);

    let mut handles = Vec::new();
    loop {
      let mut sched = self.scheduler.lock().unwrap();
      let graph = sched.graph.as_mut().expect("scheduler graph installed above");

      if graph.is_empty() {
        break;
      }
      if self.is_failed() && !self.opts.keep_going {
        break;
      }

      // Finished-elsewhere packages (recursive or suppressed builds)
      // just leave the graph.
      let ready = graph.ready();
      if let Some(done) = ready.iter().find(|p| p.is_built()) {
        graph.delete_node(done);
        continue;
      }

      let limit = self.opts.threads_limit;
      let slot_free = limit == 0 || self.threads_running.load(Ordering::Acquire) < limit;
      let candidate = ready
        .into_iter()
        .find(|p| slot_free && !p.is_building() && !p.is_failed());

      match candidate {
        Some(package) => {
          let _ = package.set_building();
          drop(sched);
          self.threads_running.fetch_add(1, Ordering::AcqRel);
          let world = Arc::clone(self);
          let handle = std::thread::spawn(move || worker(world, package));
          handles.push(handle);
        }
        None => {
          if self.threads_running.load(Ordering::Acquire) == 0 {
            // No worker running and nothing ready: either everything
            // left is blocked behind a failure, or (the safety net) a
            // residual cycle survived the pre-pass.
            if !self.is_failed() {
              let cycled = graph.cycled_packages();
              if !cycled.is_empty() {
                return Err(GraphError::Cycle { packages: cycled }.into());
              }
            }
            break;
          }
          let _unused = self.cond.wait(sched).unwrap();
        }
      }
    }

    for handle in handles {
      let _ = handle.join();
    }
    Ok(())
  }

  /// A worker finished a package: drop it from the graph and wake the
  /// scheduler.
  pub fn package_finished(&self, package: &Package) {
    let mut sched = self.scheduler.lock().unwrap();
    if let Some(graph) = sched.graph.as_mut() {
      graph.delete_node(package);
    }
    debug!(package = %package.name(), "finished");
    self.cond.notify_all();
  }

  /// Record a failure. The package stays in the graph so its
  /// dependents never become ready.
  pub fn set_failed(&self, package: &Package) {
    let _sched = self.scheduler.lock().unwrap();
    self.failed.store(true, Ordering::Release);
    self
      .failed_packages
      .lock()
      .unwrap()
      .push(package.name().to_string());
    self.cond.notify_all();
  }

  fn thread_ended(&self) {
    let _sched = self.scheduler.lock().unwrap();
    self.threads_running.fetch_sub(1, Ordering::AcqRel);
    self.cond.notify_all();
  }
}

/// Body of one build worker.
fn worker(world: Arc<World>, package: Arc<Package>) {
  match package.build(&world, false) {
    Ok(()) => world.package_finished(&package),
    Err(err) => {
      error!(package = %package.name(), error = %err, "build failed");
      package.logger().log(&format!("build failed: {err}"));
      package.mark_failed();
      world.set_failed(&package);
    }
  }
  world.thread_ended();
}
