//! Source acquisition.
//!
//! A [`FetchUnit`] is a single way of getting source material onto the
//! local disk: an HTTP download into `dl/`, or a link/copy of a local
//! tree into the work directory. Git checkouts are driven from the
//! extraction layer (see [`crate::extraction::git`]) because they are
//! both a fetch and a materialisation.
//!
//! Downloads are serialised per target filename through the
//! [`DownloadRegistry`] so two packages wanting the same tarball cause
//! exactly one network transfer.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, info};

use crate::builddir::BuildDir;
use crate::cmd::{CmdError, Logger, PackageCmd};
use crate::extraction::git;
use crate::overlay::PathError;
use crate::util::copy::{copy_tree, LinkPolicy};
use crate::util::hash::{hash_file, hash_tree};

#[derive(Debug, Error)]
pub enum FetchError {
  #[error("download failed for {uri}: {message}")]
  Download { uri: String, message: String },

  #[error("hash mismatch for {uri} (committed to {expected}, providing {actual})")]
  HashMismatch {
    uri: String,
    expected: String,
    actual: String,
  },

  #[error("don't know how to decompress {0}")]
  UnknownCompression(String),

  #[error("no hash available for unfetched {0}")]
  NotFetched(String),

  #[error(transparent)]
  Path(#[from] PathError),

  #[error(transparent)]
  Cmd(#[from] CmdError),

  #[error("io error: {0}")]
  Io(#[from] io::Error),
}

/// Per-filename download state: a lock to serialise transfers and the
/// cached content hash once a transfer completed.
#[derive(Debug, Default)]
pub struct DownloadEntry {
  lock: Mutex<()>,
  hash: Mutex<Option<String>>,
}

impl DownloadEntry {
  pub fn acquire(&self) -> MutexGuard<'_, ()> {
    self.lock.lock().unwrap()
  }

  pub fn cached_hash(&self) -> Option<String> {
    self.hash.lock().unwrap().clone()
  }

  pub fn set_hash(&self, hash: &str) {
    *self.hash.lock().unwrap() = Some(hash.to_string());
  }
}

/// Process-wide registry of in-flight and completed downloads, keyed by
/// the final on-disk filename.
#[derive(Debug, Default)]
pub struct DownloadRegistry {
  entries: Mutex<HashMap<String, Arc<DownloadEntry>>>,
}

impl DownloadRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn entry(&self, filename: &str) -> Arc<DownloadEntry> {
    let mut entries = self.entries.lock().unwrap();
    entries.entry(filename.to_string()).or_default().clone()
  }
}

/// Shared context handed to fetch operations.
pub struct FetchCtx<'a> {
  pub pwd: &'a Path,
  pub registry: &'a DownloadRegistry,
  pub logger: &'a Logger,
  /// `prefix,replacement` patterns for `git clone --reference-if-able`.
  pub ref_patterns: &'a [(String, String)],
}

/// A single source-acquisition step.
#[derive(Debug)]
pub enum FetchUnit {
  Download(DownloadFetch),
  Link(LinkFetch),
  Copy(CopyFetch),
}

impl FetchUnit {
  /// Materialise the source. Idempotent: an already-fetched unit is a
  /// no-op or a cheap refresh.
  pub fn fetch(&self, bd: &BuildDir, ctx: &FetchCtx) -> Result<(), FetchError> {
    match self {
      FetchUnit::Download(f) => f.fetch(ctx),
      FetchUnit::Link(f) => f.fetch(bd, ctx),
      FetchUnit::Copy(f) => f.fetch(bd, ctx),
    }
  }

  /// Content hash of the fetched material.
  pub fn hash(&self, pwd: &Path) -> Result<String, FetchError> {
    match self {
      FetchUnit::Download(f) => f.hash(pwd),
      FetchUnit::Link(f) => local_tree_hash(&f.resolved_target(pwd)),
      FetchUnit::Copy(f) => local_tree_hash(&f.resolved_source(pwd)),
    }
  }

  /// Where the extraction layer can find the result, relative to the
  /// work tree (or `dl/` for downloads).
  pub fn relative_path(&self) -> String {
    match self {
      FetchUnit::Download(f) => f.relative_path(),
      FetchUnit::Link(f) => f.link_name(),
      FetchUnit::Copy(f) => f.dest_name(),
    }
  }

  /// Links and copies track live local trees whose content cannot be
  /// assumed unchanged, so they force a rebuild of the owning package.
  pub fn force_updated(&self) -> bool {
    matches!(self, FetchUnit::Link(_) | FetchUnit::Copy(_))
  }
}

/// A file downloaded over HTTP into `dl/`.
#[derive(Debug)]
pub struct DownloadFetch {
  uri: String,
  decompress: bool,
  filename: Option<String>,
  hash: Mutex<Option<String>>,
}

impl DownloadFetch {
  pub fn new(uri: &str, decompress: bool, filename: Option<String>) -> Self {
    Self {
      uri: uri.to_string(),
      decompress,
      filename,
      hash: Mutex::new(None),
    }
  }

  /// The on-disk name: an explicit `filename` argument or the last URI
  /// path component.
  fn final_name(&self) -> String {
    match &self.filename {
      Some(name) => name.clone(),
      None => self.uri.rsplit('/').next().unwrap_or(&self.uri).to_string(),
    }
  }

  /// `final_name` with the compression suffix stripped.
  fn decompressed_name(&self) -> String {
    let name = self.final_name();
    match name.rfind('.') {
      Some(pos) => name[..pos].to_string(),
      None => name,
    }
  }

  pub fn relative_path(&self) -> String {
    if self.decompress {
      format!("dl/{}", self.decompressed_name())
    } else {
      format!("dl/{}", self.final_name())
    }
  }

  fn fetch(&self, ctx: &FetchCtx) -> Result<(), FetchError> {
    let dl_dir = ctx.pwd.join("dl");
    fs::create_dir_all(&dl_dir)?;

    let final_name = self.final_name();
    let entry = ctx.registry.entry(&final_name);
    let _guard = entry.acquire();

    let target = dl_dir.join(&final_name);
    if !target.exists() {
      info!(uri = %self.uri, file = %final_name, "downloading");
      ctx.logger.log(&format!("Downloading {}", self.uri));
      download_to(&self.uri, &target)?;
    } else {
      debug!(file = %final_name, "already downloaded");
    }

    if self.decompress {
      let decompressed = dl_dir.join(self.decompressed_name());
      if !decompressed.exists() {
        decompress_file(&final_name, &dl_dir, ctx.logger)?;
      }
    }

    // The recorded hash is always the compressed form's, even when a
    // decompressed sibling is what extraction consumes.
    let hash = match entry.cached_hash() {
      Some(hash) => hash,
      None => {
        let hash = hash_file(&target)?;
        entry.set_hash(&hash);
        hash
      }
    };
    *self.hash.lock().unwrap() = Some(hash);
    Ok(())
  }

  fn hash(&self, pwd: &Path) -> Result<String, FetchError> {
    if let Some(hash) = self.hash.lock().unwrap().clone() {
      return Ok(hash);
    }
    let target = pwd.join("dl").join(self.final_name());
    if !target.exists() {
      return Err(FetchError::NotFetched(self.uri.clone()));
    }
    let hash = hash_file(&target)?;
    *self.hash.lock().unwrap() = Some(hash.clone());
    Ok(hash)
  }
}

/// A local file or directory linked into the work tree.
#[derive(Debug)]
pub struct LinkFetch {
  /// Target path, already overlay-resolved, relative to the working
  /// directory (or absolute).
  uri: String,
}

impl LinkFetch {
  pub fn new(uri: &str) -> Self {
    Self { uri: uri.to_string() }
  }

  fn link_name(&self) -> String {
    basename(&self.uri)
  }

  fn resolved_target(&self, pwd: &Path) -> PathBuf {
    if self.uri.starts_with('/') {
      PathBuf::from(&self.uri)
    } else {
      pwd.join(&self.uri)
    }
  }

  fn fetch(&self, bd: &BuildDir, ctx: &FetchCtx) -> Result<(), FetchError> {
    let link = bd.path().join(self.link_name());
    let target = self.resolved_target(ctx.pwd);
    if let Ok(meta) = fs::symlink_metadata(&link) {
      if meta.file_type().is_symlink() && fs::read_link(&link)? == target {
        return Ok(());
      }
      if meta.is_dir() && !meta.file_type().is_symlink() {
        fs::remove_dir_all(&link)?;
      } else {
        fs::remove_file(&link)?;
      }
    }
    #[cfg(unix)]
    std::os::unix::fs::symlink(&target, &link)?;
    Ok(())
  }
}

/// A local file or directory copied into the work tree.
#[derive(Debug)]
pub struct CopyFetch {
  uri: String,
}

impl CopyFetch {
  pub fn new(uri: &str) -> Self {
    Self { uri: uri.to_string() }
  }

  fn dest_name(&self) -> String {
    basename(&self.uri)
  }

  fn resolved_source(&self, pwd: &Path) -> PathBuf {
    if self.uri.starts_with('/') {
      PathBuf::from(&self.uri)
    } else {
      pwd.join(&self.uri)
    }
  }

  fn fetch(&self, bd: &BuildDir, ctx: &FetchCtx) -> Result<(), FetchError> {
    let source = self.resolved_source(ctx.pwd);
    let dest = bd.path().join(self.dest_name());
    copy_tree(&source, &dest, LinkPolicy::Keep)?;
    Ok(())
  }
}

/// Hash for link/copy sources: a git working tree hashes as its HEAD
/// commit (plus a dirty marker when it differs from HEAD), anything
/// else by content.
fn local_tree_hash(path: &Path) -> Result<String, FetchError> {
  if path.join(".git").exists() {
    let head = git::head_hash(path)?;
    if git::is_dirty(path) {
      return Ok(format!("{head}-dirty-{}", git::diff_hash(path)?));
    }
    return Ok(head);
  }
  if path.is_dir() {
    Ok(hash_tree(path)?)
  } else {
    Ok(hash_file(path)?)
  }
}

fn basename(path: &str) -> String {
  let trimmed = path.trim_end_matches('/');
  trimmed.rsplit('/').next().unwrap_or(trimmed).to_string()
}

fn download_to(uri: &str, target: &Path) -> Result<(), FetchError> {
  let response = reqwest::blocking::get(uri).map_err(|e| FetchError::Download {
    uri: uri.to_string(),
    message: e.to_string(),
  })?;
  if !response.status().is_success() {
    return Err(FetchError::Download {
      uri: uri.to_string(),
      message: format!("HTTP {}", response.status()),
    });
  }
  let bytes = response.bytes().map_err(|e| FetchError::Download {
    uri: uri.to_string(),
    message: e.to_string(),
  })?;

  // Write through a temporary name so an interrupted transfer never
  // leaves a plausible-looking artifact behind.
  let partial = target.with_extension("partial");
  let mut file = fs::File::create(&partial)?;
  file.write_all(&bytes)?;
  file.flush()?;
  fs::rename(&partial, target)?;
  Ok(())
}

fn decompress_file(final_name: &str, dl_dir: &Path, logger: &Logger) -> Result<(), FetchError> {
  let program = match final_name.rsplit('.').next() {
    Some("gz") | Some("tgz") => "gzip",
    Some("bz2") => "bzip2",
    Some("xz") => "xz",
    _ => return Err(FetchError::UnknownCompression(final_name.to_string())),
  };
  let mut cmd = PackageCmd::new(dl_dir, program);
  cmd.add_arg("-dkf");
  cmd.add_arg(final_name);
  cmd.run(dl_dir, logger)?;
  Ok(())
}

/// The ordered fetch steps for one package.
#[derive(Debug, Default)]
pub struct Fetch {
  units: Vec<Arc<FetchUnit>>,
}

impl Fetch {
  pub fn add(&mut self, unit: FetchUnit) -> Arc<FetchUnit> {
    let unit = Arc::new(unit);
    self.units.push(unit.clone());
    unit
  }

  pub fn units(&self) -> &[Arc<FetchUnit>] {
    &self.units
  }

  /// Fetch everything, in declaration order, stopping at the first
  /// failure.
  pub fn fetch(&self, bd: &BuildDir, ctx: &FetchCtx) -> Result<(), FetchError> {
    for unit in &self.units {
      unit.fetch(bd, ctx)?;
    }
    Ok(())
  }

  /// True when any unit forces a rebuild of the owning package.
  pub fn force_updated(&self) -> bool {
    self.units.iter().any(|u| u.force_updated())
  }
}
