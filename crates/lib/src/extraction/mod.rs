//! Materialising sources into a package's work tree.
//!
//! Each [`ExtractionUnit`] is one re-runnable step: unpack an archive,
//! apply a patch, copy a file, link or copy or fetch a git directory.
//! The ordered steps serialise into the package's `.extraction.info`
//! file, one line per unit; the file's hash is the extraction
//! fingerprint that decides whether sources need re-materialising.

pub mod git;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::builddir::BuildDir;
use crate::cmd::{CmdError, PackageCmd};
use crate::fetch::{FetchCtx, FetchError, FetchUnit};
use crate::overlay::PathError;
use crate::util::copy::{copy_tree, LinkPolicy};
use crate::util::hash::{hash_file, hash_string};

use git::GitFetch;

#[derive(Debug, Error)]
pub enum ExtractError {
  #[error("failed to extract archive {0}")]
  Archive(String),

  #[error("patch {0} will fail to patch")]
  PatchDryRun(String),

  #[error("patch {0} truly failed to patch")]
  PatchApply(String),

  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error(transparent)]
  Path(#[from] PathError),

  #[error(transparent)]
  Cmd(#[from] CmdError),

  #[error("io error: {0}")]
  Io(#[from] io::Error),
}

/// What an archive unit unpacks: something a fetch step produced, or a
/// path recorded directly by the recipe.
#[derive(Debug)]
pub enum ArchiveSource {
  Fetched(Arc<FetchUnit>),
  Path(String),
}

impl ArchiveSource {
  fn uri(&self) -> String {
    match self {
      ArchiveSource::Fetched(f) => f.relative_path(),
      ArchiveSource::Path(p) => p.clone(),
    }
  }

  fn hash(&self, pwd: &Path) -> Result<String, ExtractError> {
    match self {
      ArchiveSource::Fetched(f) => Ok(f.hash(pwd)?),
      ArchiveSource::Path(p) => Ok(hash_file(&absolute(pwd, p))?),
    }
  }
}

/// A tar or zip archive unpacked into the work tree.
#[derive(Debug)]
pub struct ArchiveUnit {
  pub source: ArchiveSource,
}

/// A patch applied (with a dry run first) at a given strip level.
#[derive(Debug)]
pub struct PatchUnit {
  /// `-p` strip level.
  pub level: u32,
  /// Directory the patch is applied in, relative to the working
  /// directory.
  pub patch_dir: String,
  /// Resolved path of the patch file.
  pub patch_file: String,
  /// The recipe's own name for the patch, recorded in the info line.
  pub short_name: String,
  pub hash: String,
}

/// A local file or tree copied into the work tree, following symlinks.
#[derive(Debug)]
pub struct FileCopyUnit {
  /// Resolved source path.
  pub path: String,
  pub short_name: String,
  pub hash: String,
}

/// A fetched file copied to a recipe-chosen name in the work tree.
#[derive(Debug)]
pub struct FetchedFileCopyUnit {
  pub fetch: Arc<FetchUnit>,
  pub short_name: String,
}

#[derive(Debug)]
pub enum GitDirMode {
  /// Symlink the local tree into the work directory.
  Link,
  /// Copy the local tree, preserving links.
  Copy,
  /// Clone/update a remote and copy the checkout in.
  Fetch(GitFetch),
}

impl GitDirMode {
  fn name(&self) -> &'static str {
    match self {
      GitDirMode::Link => "link",
      GitDirMode::Copy => "copy",
      GitDirMode::Fetch(_) => "fetch",
    }
  }
}

/// A git directory materialised into the work tree.
#[derive(Debug)]
pub struct GitDirUnit {
  pub mode: GitDirMode,
  /// Local path (link/copy) or remote URI (fetch).
  pub uri: String,
  pub to_dir: String,
}

impl GitDirUnit {
  /// The on-disk tree this unit reflects.
  fn local_path(&self, pwd: &Path) -> PathBuf {
    match &self.mode {
      GitDirMode::Fetch(f) => pwd.join(f.local_path()),
      _ => absolute(pwd, &self.uri),
    }
  }

  pub fn is_dirty(&self, pwd: &Path) -> bool {
    git::is_dirty(&self.local_path(pwd))
  }

  pub fn dirty_hash(&self, pwd: &Path) -> Result<String, FetchError> {
    git::diff_hash(&self.local_path(pwd))
  }

  fn hash(&self, ctx: &FetchCtx) -> Result<String, ExtractError> {
    match &self.mode {
      GitDirMode::Fetch(f) => Ok(f.hash(ctx)?),
      _ => Ok(git::head_hash(&self.local_path(ctx.pwd))?),
    }
  }
}

/// A single materialisation step.
#[derive(Debug)]
pub enum ExtractionUnit {
  Tar(ArchiveUnit),
  Zip(ArchiveUnit),
  Patch(PatchUnit),
  FileCopy(FileCopyUnit),
  FetchedFileCopy(FetchedFileCopyUnit),
  GitDir(GitDirUnit),
}

impl ExtractionUnit {
  /// The leading token of this unit's info line.
  pub fn type_tag(&self) -> &'static str {
    match self {
      ExtractionUnit::Tar(_) => "TarFile",
      ExtractionUnit::Zip(_) => "ZipFile",
      ExtractionUnit::Patch(_) => "PatchFile",
      ExtractionUnit::FileCopy(_) => "FileCopy",
      ExtractionUnit::FetchedFileCopy(_) => "FetchedFileCopy",
      ExtractionUnit::GitDir(_) => "GitDir",
    }
  }

  /// The unit's canonical single-line serialisation for the
  /// extraction-info file, newline included.
  pub fn print_line(&self, ctx: &FetchCtx) -> Result<String, ExtractError> {
    let line = match self {
      ExtractionUnit::Tar(a) | ExtractionUnit::Zip(a) => {
        format!("{} {} {}\n", self.type_tag(), a.source.uri(), a.source.hash(ctx.pwd)?)
      }
      ExtractionUnit::Patch(p) => {
        format!("{} {} {} {} {}\n", self.type_tag(), p.level, p.patch_dir, p.short_name, p.hash)
      }
      ExtractionUnit::FileCopy(f) => {
        format!("{} {} {}\n", self.type_tag(), f.short_name, f.hash)
      }
      ExtractionUnit::FetchedFileCopy(f) => {
        format!("{} {} {}\n", self.type_tag(), f.short_name, f.fetch.hash(ctx.pwd)?)
      }
      ExtractionUnit::GitDir(g) => {
        let dirty = if g.is_dirty(ctx.pwd) {
          g.dirty_hash(ctx.pwd)?
        } else {
          String::new()
        };
        format!(
          "{} {} {} {} {} {}\n",
          self.type_tag(),
          g.mode.name(),
          g.uri,
          g.to_dir,
          g.hash(ctx)?,
          dirty
        )
      }
    };
    Ok(line)
  }

  /// Materialise this unit into the package work tree.
  pub fn extract(&self, bd: &BuildDir, ctx: &FetchCtx) -> Result<(), ExtractError> {
    match self {
      ExtractionUnit::Tar(a) => {
        let file = absolute(ctx.pwd, &a.source.uri());
        info!(archive = %file.display(), "untarring");
        let mut cmd = PackageCmd::new(bd.path(), "tar");
        cmd.add_arg("xf");
        cmd.add_arg(file.display().to_string());
        cmd
          .run(ctx.pwd, ctx.logger)
          .map_err(|_| ExtractError::Archive(a.source.uri()))
      }
      ExtractionUnit::Zip(a) => {
        let file = absolute(ctx.pwd, &a.source.uri());
        info!(archive = %file.display(), "unzipping");
        let mut cmd = PackageCmd::new(bd.path(), "unzip");
        cmd.add_arg("-o");
        cmd.add_arg(file.display().to_string());
        cmd
          .run(ctx.pwd, ctx.logger)
          .map_err(|_| ExtractError::Archive(a.source.uri()))
      }
      ExtractionUnit::Patch(p) => p.apply(ctx),
      ExtractionUnit::FileCopy(f) => {
        let src = absolute(ctx.pwd, &f.path);
        let dest = bd.path().join(basename(&f.path));
        copy_tree(&src, &dest, LinkPolicy::Follow)?;
        Ok(())
      }
      ExtractionUnit::FetchedFileCopy(f) => {
        let src = absolute(ctx.pwd, &f.fetch.relative_path());
        let dest = bd.path().join(&f.short_name);
        if let Some(parent) = dest.parent() {
          fs::create_dir_all(parent)?;
        }
        copy_tree(&src, &dest, LinkPolicy::Follow)?;
        Ok(())
      }
      ExtractionUnit::GitDir(g) => g.extract(bd, ctx),
    }
  }
}

impl PatchUnit {
  fn apply(&self, ctx: &FetchCtx) -> Result<(), ExtractError> {
    let patch_file = absolute(ctx.pwd, &self.patch_file);
    let apply_dir = absolute(ctx.pwd, &self.patch_dir);

    // Dry run first: a rejected patch is a hard recipe error, never a
    // silent partial application.
    let mut dry = PackageCmd::new(&apply_dir, "patch");
    dry.add_arg(format!("-p{}", self.level));
    dry.add_arg("-stN");
    dry.add_arg("-i");
    dry.add_arg(patch_file.display().to_string());
    dry.add_arg("--dry-run");
    if dry.run(ctx.pwd, ctx.logger).is_err() {
      ctx.logger.log(&format!("Patch file: {}", self.short_name));
      return Err(ExtractError::PatchDryRun(self.short_name.clone()));
    }

    let mut real = PackageCmd::new(&apply_dir, "patch");
    real.add_arg(format!("-p{}", self.level));
    real.add_arg("-stN");
    real.add_arg("-i");
    real.add_arg(patch_file.display().to_string());
    real
      .run(ctx.pwd, ctx.logger)
      .map_err(|_| ExtractError::PatchApply(self.short_name.clone()))
  }
}

impl GitDirUnit {
  fn extract(&self, bd: &BuildDir, ctx: &FetchCtx) -> Result<(), ExtractError> {
    match &self.mode {
      GitDirMode::Link => {
        // Only dot-prefixed uris are anchored to the working directory;
        // anything else is handed to the link verbatim, so a plain
        // relative uri resolves against the link's own directory
        // (`ln -sfT` with the work tree as cwd).
        let target = if self.uri.starts_with('.') {
          ctx.pwd.join(&self.uri)
        } else {
          PathBuf::from(&self.uri)
        };
        let link = bd.path().join(&self.to_dir);
        if let Ok(meta) = fs::symlink_metadata(&link) {
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
      GitDirMode::Copy => {
        // Same branching as link mode; a plain relative uri names a
        // path under the work tree, the copy's historical cwd.
        let src = if self.uri.starts_with('.') {
          ctx.pwd.join(&self.uri)
        } else if self.uri.starts_with('/') {
          PathBuf::from(&self.uri)
        } else {
          bd.path().join(&self.uri)
        };
        copy_tree(&src, &bd.path().join(&self.to_dir), LinkPolicy::Keep)?;
        Ok(())
      }
      GitDirMode::Fetch(f) => {
        f.fetch(ctx)?;
        let src = ctx.pwd.join(f.local_path());
        copy_tree(&src, &bd.path().join(&self.to_dir), LinkPolicy::Keep)?;
        Ok(())
      }
    }
  }
}

fn absolute(pwd: &Path, path: &str) -> PathBuf {
  if path.starts_with('/') {
    PathBuf::from(path)
  } else {
    pwd.join(path)
  }
}

fn basename(path: &str) -> String {
  let trimmed = path.trim_end_matches('/');
  trimmed.rsplit('/').next().unwrap_or(trimmed).to_string()
}

/// The ordered extraction steps for one package, plus the bookkeeping
/// for the extraction-info fingerprint.
#[derive(Debug, Default)]
pub struct Extraction {
  units: Vec<ExtractionUnit>,
}

impl Extraction {
  pub fn add(&mut self, unit: ExtractionUnit) {
    self.units.push(unit);
  }

  pub fn is_empty(&self) -> bool {
    self.units.is_empty()
  }

  /// Write `.extraction.info.new` from the current unit list.
  pub fn prepare_new_info(&self, bd: &BuildDir, ctx: &FetchCtx) -> Result<(), ExtractError> {
    let mut contents = String::new();
    for unit in &self.units {
      contents.push_str(&unit.print_line(ctx)?);
    }
    fs::write(bd.extraction_info_new(), contents)?;
    Ok(())
  }

  /// Whether the work tree must be re-materialised: the committed info
  /// file is missing or differs from the freshly prepared one.
  pub fn extraction_required(&self, bd: &BuildDir) -> bool {
    let committed = fs::read_to_string(bd.extraction_info());
    let new = fs::read_to_string(bd.extraction_info_new());
    match (committed, new) {
      (Ok(committed), Ok(new)) => committed != new,
      _ => true,
    }
  }

  /// Run every unit, in declaration order, then commit the new info
  /// file over the old one.
  pub fn extract(&self, bd: &BuildDir, ctx: &FetchCtx) -> Result<(), ExtractError> {
    for unit in &self.units {
      debug!(unit = unit.type_tag(), "extracting");
      unit.extract(bd, ctx)?;
    }
    fs::rename(bd.extraction_info_new(), bd.extraction_info())?;
    Ok(())
  }

  /// The (short path, hash) of the freshly prepared info file, for the
  /// build-info fingerprint.
  pub fn info(&self, bd: &BuildDir) -> io::Result<(String, String)> {
    let path = bd.short_path().join(".extraction.info");
    let contents = fs::read_to_string(bd.extraction_info_new())?;
    Ok((path.display().to_string(), hash_string(&contents)))
  }
}
