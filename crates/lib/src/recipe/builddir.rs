//! The `builddir()` object recipes drive.
//!
//! `bd:fetch{}` declares source acquisition, `bd:extract`/`bd:patch`
//! declare materialisation, `bd:cmd` queues build commands, and the
//! rest are small conveniences. Everything lands on the owning
//! [`Package`]; nothing runs until the build phase.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use mlua::prelude::*;
use tracing::warn;

use crate::cmd::PackageCmd;
use crate::extraction::git::GitFetch;
use crate::extraction::{
  ArchiveSource, ArchiveUnit, ExtractionUnit, FileCopyUnit, FetchedFileCopyUnit, GitDirMode, GitDirUnit, PatchUnit,
};
use crate::fetch::{CopyFetch, DownloadFetch, FetchUnit, LinkFetch};
use crate::package::Package;
use crate::util::hash::hash_file;
use crate::world::World;

/// Userdata handed back by `builddir()`.
pub struct BuildDirHandle {
  world: Arc<World>,
  package: Arc<Package>,
}

/// Userdata handed back by `bd:fetch{}` for methods that produce a
/// fetchable object (`dl`, `link`, `copy`), consumed by `bd:extract`.
pub struct FetchHandle {
  unit: Arc<FetchUnit>,
}

impl LuaUserData for FetchHandle {}

/// The parsed key set of a `bd:fetch{}` table.
#[derive(Debug, Default)]
struct FetchSpec {
  uri: String,
  method: String,
  filename: String,
  decompress: bool,
  branch: String,
  reponame: String,
  to: String,
  listedonly: bool,
  copyto: String,
}

impl FetchSpec {
  fn parse(table: &LuaTable, package: &Package) -> LuaResult<Self> {
    let mut spec = Self::default();
    for pair in table.pairs::<String, LuaValue>() {
      let (key, value) = pair?;
      match (key.as_str(), &value) {
        ("uri", LuaValue::String(s)) => spec.uri = s.to_str()?.to_string(),
        ("method", LuaValue::String(s)) => spec.method = s.to_str()?.to_string(),
        ("filename", LuaValue::String(s)) => spec.filename = s.to_str()?.to_string(),
        ("branch", LuaValue::String(s)) => spec.branch = s.to_str()?.to_string(),
        ("reponame", LuaValue::String(s)) => spec.reponame = s.to_str()?.to_string(),
        ("to", LuaValue::String(s)) => spec.to = s.to_str()?.to_string(),
        ("copyto", LuaValue::String(s)) => spec.copyto = s.to_str()?.to_string(),
        ("decompress", LuaValue::Boolean(b)) => spec.decompress = *b,
        ("decompress", LuaValue::String(s)) => spec.decompress = s.to_str()? == "true",
        ("listedonly", LuaValue::Boolean(b)) => spec.listedonly = *b,
        ("listedonly", LuaValue::String(s)) => spec.listedonly = s.to_str()? == "true",
        (key, _) => {
          warn!(package = %package.name(), key, "unknown fetch key");
          package.logger().log(&format!("Unknown key {key}"));
        }
      }
    }
    Ok(spec)
  }
}

impl BuildDirHandle {
  pub fn new(world: Arc<World>, package: Arc<Package>) -> Self {
    Self { world, package }
  }

  /// Resolve a recipe path relative to the work tree, passing `dl/`
  /// and absolute paths through.
  fn relative_path(&self, dir: &str) -> String {
    if dir.starts_with('/') || dir.starts_with("dl/") {
      dir.to_string()
    } else if dir.is_empty() {
      self.package.bd().short_path().display().to_string()
    } else {
      format!("{}/{dir}", self.package.bd().short_path().display())
    }
  }

  fn fetch_path(&self, location: &str) -> LuaResult<String> {
    self
      .world
      .overlays()
      .resolve(self.world.pwd(), self.package.name(), location, false)
      .map_err(LuaError::external)
  }

  fn fetch_path_absolute(&self, location: &str) -> LuaResult<PathBuf> {
    self
      .world
      .overlays()
      .resolve_absolute(self.world.pwd(), self.package.name(), location, false)
      .map_err(LuaError::external)
  }

  fn fetch(&self, table: LuaTable) -> LuaResult<Option<FetchHandle>> {
    let spec = FetchSpec::parse(&table, &self.package)?;
    match spec.method.as_str() {
      "dl" => {
        if spec.uri.is_empty() {
          return Err(LuaError::external("fetch method = dl requires uri to be set"));
        }
        let filename = (!spec.filename.is_empty()).then(|| spec.filename.clone());
        let unit = self
          .package
          .add_fetch_unit(FetchUnit::Download(DownloadFetch::new(&spec.uri, spec.decompress, filename)));
        if !spec.copyto.is_empty() {
          self.package.add_extraction_unit(ExtractionUnit::FetchedFileCopy(FetchedFileCopyUnit {
            fetch: unit.clone(),
            short_name: spec.copyto.clone(),
          }));
        }
        Ok(Some(FetchHandle { unit }))
      }
      "git" => {
        if spec.uri.is_empty() {
          return Err(LuaError::external("fetch method = git requires uri to be set"));
        }
        let reponame = if spec.reponame.is_empty() {
          derive_reponame(&spec.uri)?
        } else {
          spec.reponame.clone()
        };
        let branch = if spec.branch.is_empty() {
          "origin/master".to_string()
        } else {
          spec.branch.clone()
        };
        let digest = self.digest_lookup(&format!("{}#{branch}", spec.uri));
        let git = GitFetch::new(&spec.uri, &reponame, &branch, digest);
        self.package.add_extraction_unit(ExtractionUnit::GitDir(GitDirUnit {
          mode: GitDirMode::Fetch(git),
          uri: spec.uri.clone(),
          to_dir: reponame,
        }));
        Ok(None)
      }
      "linkgit" => {
        if spec.uri.is_empty() {
          return Err(LuaError::external("fetch method = linkgit requires uri to be set"));
        }
        // The overlay-resolved path only contributes the link name; the
        // unit keeps the recipe's own uri, whose dot prefix (or lack of
        // one) steers resolution at extract time.
        let resolved = self.fetch_path(&spec.uri)?;
        let trimmed = resolved.trim_end_matches('/');
        let to_dir = trimmed.rsplit('/').next().unwrap_or(trimmed).to_string();
        self.package.add_extraction_unit(ExtractionUnit::GitDir(GitDirUnit {
          mode: GitDirMode::Link,
          uri: spec.uri.clone(),
          to_dir,
        }));
        Ok(None)
      }
      "link" => {
        if spec.uri.is_empty() {
          return Err(LuaError::external("fetch method = link requires uri to be set"));
        }
        self.package.set_code_updated();
        let unit = self.package.add_fetch_unit(FetchUnit::Link(LinkFetch::new(&spec.uri)));
        Ok(Some(FetchHandle { unit }))
      }
      "copyfile" => {
        if spec.uri.is_empty() {
          return Err(LuaError::external("fetch method = copyfile requires uri to be set"));
        }
        let path = self.fetch_path(&spec.uri)?;
        let hash = hash_file(&self.fetch_path_absolute(&spec.uri)?).map_err(LuaError::external)?;
        self.package.add_extraction_unit(ExtractionUnit::FileCopy(FileCopyUnit {
          path,
          short_name: spec.uri.clone(),
          hash,
        }));
        Ok(None)
      }
      "copygit" => {
        if spec.uri.is_empty() {
          return Err(LuaError::external("fetch method = copygit requires uri to be set"));
        }
        let src = self.fetch_path(&spec.uri)?;
        let trimmed = src.trim_end_matches('/');
        let to_dir = trimmed.rsplit('/').next().unwrap_or(trimmed).to_string();
        self.package.add_extraction_unit(ExtractionUnit::GitDir(GitDirUnit {
          mode: GitDirMode::Copy,
          uri: src,
          to_dir,
        }));
        Ok(None)
      }
      "copy" => {
        if spec.uri.is_empty() {
          return Err(LuaError::external("fetch method = copy requires uri to be set"));
        }
        self.package.set_code_updated();
        let unit = self.package.add_fetch_unit(FetchUnit::Copy(CopyFetch::new(&spec.uri)));
        Ok(Some(FetchHandle { unit }))
      }
      "deps" => {
        let path = if spec.to.starts_with('/') {
          PathBuf::from(&spec.to)
        } else {
          self.package.bd().path().join(&spec.to)
        };
        self.package.set_deps_extract(path, spec.listedonly);
        self
          .package
          .logger()
          .log("Will add installed files, considering code updated");
        self.package.set_code_updated();
        Ok(None)
      }
      other => Err(LuaError::external(format!("unsupported fetch method: {other}"))),
    }
  }

  /// Look `key` up in the recipe's `Digest` sidecar, if one exists.
  fn digest_lookup(&self, key: &str) -> Option<String> {
    let rel = self
      .world
      .overlays()
      .resolve(self.world.pwd(), self.package.name(), "Digest", false)
      .ok()?;
    let contents = fs::read_to_string(self.world.pwd().join(rel)).ok()?;
    contents.lines().find_map(|line| {
      let (k, v) = line.split_once(char::is_whitespace)?;
      (k == key).then(|| v.trim().to_string())
    })
  }
}

/// The repository name implied by a git URI: the last path component,
/// `.git` stripped.
fn derive_reponame(uri: &str) -> LuaResult<String> {
  let trimmed = uri.trim_end_matches('/');
  let name = trimmed
    .rsplit('/')
    .next()
    .filter(|n| !n.is_empty())
    .ok_or_else(|| LuaError::external("fetch method = git failure parsing uri"))?;
  Ok(name.strip_suffix(".git").unwrap_or(name).to_string())
}

impl LuaUserData for BuildDirHandle {
  fn add_fields<F: LuaUserDataFields<Self>>(fields: &mut F) {
    fields.add_field_method_get("path", |_, this| Ok(this.package.bd().path().display().to_string()));
    fields.add_field_method_get("staging", |_, this| Ok(this.package.bd().staging().display().to_string()));
    fields.add_field_method_get("new_staging", |_, this| {
      Ok(this.package.bd().new_staging().display().to_string())
    });
    fields.add_field_method_get("new_install", |_, this| {
      Ok(this.package.bd().new_install().display().to_string())
    });
  }

  fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
    methods.add_method("fetch", |_, this, table: LuaTable| this.fetch(table));

    methods.add_method("extract", |_, this, handle: LuaAnyUserData| {
      let handle = handle.borrow::<FetchHandle>()?;
      let source = ArchiveSource::Fetched(handle.unit.clone());
      let unit = if handle.unit.relative_path().contains(".zip") {
        ExtractionUnit::Zip(ArchiveUnit { source })
      } else {
        // The catch-all for tar-compressed files.
        ExtractionUnit::Tar(ArchiveUnit { source })
      };
      this.package.add_extraction_unit(unit);
      Ok(())
    });

    methods.add_method("patch", |_, this, (dir, level, files): (String, u32, LuaTable)| {
      let patch_dir = this.relative_path(&dir);
      for file in files.sequence_values::<String>() {
        let file = file?;
        let patch_file = this.fetch_path(&file)?;
        let hash = hash_file(&this.fetch_path_absolute(&file)?).map_err(LuaError::external)?;
        this.package.add_extraction_unit(ExtractionUnit::Patch(PatchUnit {
          level,
          patch_dir: patch_dir.clone(),
          patch_file,
          short_name: file,
          hash,
        }));
      }
      Ok(())
    });

    methods.add_method(
      "cmd",
      |_, this, (dir, program, args, env, log): (String, String, LuaTable, Option<LuaTable>, Option<bool>)| {
        let cwd = this.relative_path(&dir);
        let mut cmd = PackageCmd::new(cwd, &program);
        for arg in args.sequence_values::<String>() {
          cmd.add_arg(arg?);
        }
        if let Some(env) = env {
          for entry in env.sequence_values::<String>() {
            let entry = entry?;
            let (key, value) = entry
              .split_once('=')
              .ok_or_else(|| LuaError::external("cmd() environment entries must be KEY=VALUE"))?;
            cmd.add_env(key, value);
          }
        }
        if !log.unwrap_or(true) {
          cmd.disable_logging();
        }
        cmd.add_env("BS_PACKAGE_NAME", this.package.name());
        this.package.add_command(cmd);
        Ok(())
      },
    );

    methods.add_method("installfile", |_, this, path: String| {
      this.package.add_install_file(&path);
      Ok(())
    });

    methods.add_method("ls", |_, this, location: String| {
      let dir = this.fetch_path_absolute(&location)?;
      let mut names: Vec<String> = fs::read_dir(&dir)
        .map_err(LuaError::external)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .collect();
      names.sort();
      Ok(names)
    });

    methods.add_method("restore", |_, this, (location, method): (String, String)| {
      if method != "copyfile" {
        return Err(LuaError::external("unsupported restore method"));
      }
      let mut cmd = PackageCmd::new(this.package.bd().path(), "cp");
      cmd.add_arg("-pRLuf");
      let name = location.rsplit('/').next().unwrap_or(&location);
      cmd.add_arg(name);
      cmd.add_arg(this.fetch_path_absolute(&location)?.display().to_string());
      cmd.add_env("BS_PACKAGE_NAME", this.package.name());
      this.package.add_command(cmd);
      Ok(())
    });
  }
}
