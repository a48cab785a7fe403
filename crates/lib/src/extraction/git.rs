//! Git-backed source acquisition.
//!
//! A `fetch`-mode git unit owns a local clone under `source/<reponame>`
//! and resolves a refspec to a commit hash three ways, cheapest first:
//! a literal 40-hex refspec is the hash; a `Digest` sidecar in the
//! recipe directory can carry a precomputed hash; otherwise the clone
//! is created or updated and the hash read from `HEAD`.
//!
//! All clone/fetch traffic for one local directory is serialised
//! through the download registry, the same way plain downloads are.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use tracing::{debug, info};

use crate::cmd::{Logger, PackageCmd};
use crate::fetch::{FetchCtx, FetchError};
use crate::util::hash::{hash_string, is_commit_id};

/// Run git in `dir`, capturing trimmed stdout. Non-zero exit yields an
/// empty string, which callers treat as "not present".
fn git_output(dir: &Path, args: &[&str]) -> String {
  let output = Command::new("git").args(args).current_dir(dir).output();
  match output {
    Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).trim().to_string(),
    _ => String::new(),
  }
}

/// `git rev-parse <refspec>` in `dir`.
pub(crate) fn rev_parse(dir: &Path, refspec: &str) -> Result<String, FetchError> {
  let hash = git_output(dir, &["rev-parse", refspec]);
  if hash.is_empty() {
    return Err(FetchError::Download {
      uri: dir.display().to_string(),
      message: format!("git rev-parse {refspec} failed"),
    });
  }
  Ok(hash)
}

/// The commit hash of `HEAD` in `dir`.
pub(crate) fn head_hash(dir: &Path) -> Result<String, FetchError> {
  rev_parse(dir, "HEAD")
}

/// Whether the working tree differs from `HEAD`. A directory that is
/// not there (yet) cannot be dirty.
pub(crate) fn is_dirty(dir: &Path) -> bool {
  if !dir.is_dir() {
    return false;
  }
  !Command::new("git")
    .args(["diff", "--quiet", "HEAD"])
    .current_dir(dir)
    .status()
    .map(|s| s.success())
    .unwrap_or(true)
}

/// Content hash of the working-tree delta, so a dirty tree changes the
/// extraction fingerprint.
pub(crate) fn diff_hash(dir: &Path) -> Result<String, FetchError> {
  let diff = git_output(dir, &["diff", "HEAD"]);
  Ok(hash_string(&diff))
}

fn remote_url(dir: &Path, remote: &str) -> String {
  git_output(dir, &["config", "--local", "--get", &format!("remote.{remote}.url")])
}

fn has_commit(dir: &Path, refspec: &str) -> bool {
  Command::new("git")
    .args(["cat-file", "-e", refspec])
    .current_dir(dir)
    .status()
    .map(|s| s.success())
    .unwrap_or(false)
}

fn is_local_branch(dir: &Path, refspec: &str) -> bool {
  Command::new("git")
    .args(["show-ref", "--quiet", "--verify", "--", &format!("refs/heads/{refspec}")])
    .current_dir(dir)
    .status()
    .map(|s| s.success())
    .unwrap_or(false)
}

/// Rewrite a clone URI into a local mirror directory when a configured
/// `prefix,replacement` pattern matches.
fn reference_dir(remote: &str, patterns: &[(String, String)]) -> Option<String> {
  patterns
    .iter()
    .find(|(prefix, _)| remote.starts_with(prefix.as_str()))
    .map(|(prefix, replacement)| remote.replacen(prefix.as_str(), replacement, 1))
}

#[derive(Debug, Default)]
struct GitState {
  fetched: bool,
  hash: Option<String>,
}

/// A remote git repository pinned to a refspec.
#[derive(Debug)]
pub struct GitFetch {
  remote: String,
  /// Clone directory, relative to the working directory.
  local: String,
  refspec: String,
  /// Hash from the recipe's `Digest` sidecar, when present.
  digest_hash: Option<String>,
  state: Mutex<GitState>,
}

impl GitFetch {
  pub fn new(remote: &str, reponame: &str, refspec: &str, digest_hash: Option<String>) -> Self {
    Self {
      remote: remote.to_string(),
      local: format!("source/{reponame}"),
      refspec: refspec.to_string(),
      digest_hash,
      state: Mutex::new(GitState::default()),
    }
  }

  pub fn remote(&self) -> &str {
    &self.remote
  }

  /// The clone directory, relative to the working directory.
  pub fn local_path(&self) -> &str {
    &self.local
  }

  fn local_dir(&self, pwd: &Path) -> PathBuf {
    pwd.join(&self.local)
  }

  /// Resolve the refspec to a commit hash without touching the network
  /// when possible.
  pub fn hash(&self, ctx: &FetchCtx) -> Result<String, FetchError> {
    if let Some(hash) = self.state.lock().unwrap().hash.clone() {
      return Ok(hash);
    }
    if is_commit_id(&self.refspec) {
      let hash = self.refspec.clone();
      self.state.lock().unwrap().hash = Some(hash.clone());
      return Ok(hash);
    }
    if let Some(hash) = &self.digest_hash {
      debug!(remote = %self.remote, refspec = %self.refspec, "hash from Digest sidecar");
      self.state.lock().unwrap().hash = Some(hash.clone());
      return Ok(hash.clone());
    }
    ctx.logger.log("Digest not found, will fetch code from git.");
    self.fetch(ctx)?;
    let state = self.state.lock().unwrap();
    state.hash.clone().ok_or_else(|| FetchError::NotFetched(self.remote.clone()))
  }

  /// Clone or update the local checkout and pin it to the refspec.
  pub fn fetch(&self, ctx: &FetchCtx) -> Result<(), FetchError> {
    if self.state.lock().unwrap().fetched {
      return Ok(());
    }

    // One clone/fetch per local directory at a time.
    let entry = ctx.registry.entry(&self.local);
    let _guard = entry.acquire();

    let dir = self.local_dir(ctx.pwd);
    if dir.is_dir() {
      self.update(&dir, ctx)?;
    } else {
      self.clone_repo(&dir, ctx)?;
    }
    self.checkout(&dir, ctx.logger)?;

    let head = head_hash(&dir)?;
    let expected = self
      .state
      .lock()
      .unwrap()
      .hash
      .clone()
      .or_else(|| self.digest_hash.clone());
    if let Some(expected) = expected {
      if expected != head {
        return Err(FetchError::HashMismatch {
          uri: self.remote.clone(),
          expected,
          actual: head,
        });
      }
    }

    let mut state = self.state.lock().unwrap();
    state.hash = Some(head);
    state.fetched = true;
    Ok(())
  }

  fn clone_repo(&self, dir: &Path, ctx: &FetchCtx) -> Result<(), FetchError> {
    info!(remote = %self.remote, local = %self.local, "cloning");
    let mut cmd = PackageCmd::new(ctx.pwd, "git");
    cmd.add_arg("clone");
    cmd.add_arg("-n");
    if let Some(reference) = reference_dir(&self.remote, ctx.ref_patterns) {
      cmd.add_arg("--reference-if-able");
      cmd.add_arg(reference);
    }
    cmd.add_arg(&self.remote);
    cmd.add_arg(dir.display().to_string());
    cmd.run(ctx.pwd, ctx.logger)?;
    Ok(())
  }

  fn update(&self, dir: &Path, ctx: &FetchCtx) -> Result<(), FetchError> {
    let current = remote_url(dir, "origin");
    if current != self.remote {
      let mut cmd = PackageCmd::new(dir, "git");
      cmd.add_arg("remote");
      cmd.add_arg(if current.is_empty() { "add" } else { "set-url" });
      cmd.add_arg("origin");
      cmd.add_arg(&self.remote);
      cmd.run(ctx.pwd, ctx.logger)?;

      let mut fetch = PackageCmd::new(dir, "git");
      fetch.add_arg("fetch");
      fetch.add_arg("origin");
      fetch.add_arg("--tags");
      fetch.run(ctx.pwd, ctx.logger)?;
      return Ok(());
    }

    if !has_commit(dir, &self.refspec) {
      let mut fetch = PackageCmd::new(dir, "git");
      fetch.add_arg("fetch");
      fetch.add_arg("origin");
      fetch.add_arg("--tags");
      fetch.run(ctx.pwd, ctx.logger)?;
    }
    Ok(())
  }

  fn checkout(&self, dir: &Path, logger: &Logger) -> Result<(), FetchError> {
    if self.refspec == "HEAD" {
      // The working tree is whatever the user left there.
      return Ok(());
    }
    if is_local_branch(dir, &self.refspec) {
      // Asked for a branch: the tree must already sit on it. Silently
      // moving a branch the user may be working on would lose state.
      let head = rev_parse(dir, "HEAD")?;
      let branch = rev_parse(dir, &self.refspec)?;
      if head != branch {
        return Err(FetchError::Download {
          uri: self.remote.clone(),
          message: format!(
            "asked to use branch {}, but {} is off somewhere else",
            self.refspec, self.local
          ),
        });
      }
      return Ok(());
    }
    // Tags and remote refs take a detached checkout.
    let mut cmd = PackageCmd::new(dir, "git");
    cmd.add_arg("checkout");
    cmd.add_arg("-q");
    cmd.add_arg("--detach");
    cmd.add_arg(&self.refspec);
    cmd.run(dir, logger)?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::fetch::DownloadRegistry;
  use std::fs;
  use tempfile::TempDir;

  fn git_in(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
      .args(args)
      .current_dir(dir)
      .env("GIT_AUTHOR_NAME", "t")
      .env("GIT_AUTHOR_EMAIL", "t@t")
      .env("GIT_COMMITTER_NAME", "t")
      .env("GIT_COMMITTER_EMAIL", "t@t")
      .output()
      .unwrap()
      .status;
    assert!(status.success(), "git {args:?} failed");
  }

  fn init_repo(dir: &Path) -> String {
    git_in(dir, &["init", "-q", "-b", "main"]);
    fs::write(dir.join("file"), "one").unwrap();
    git_in(dir, &["add", "file"]);
    git_in(dir, &["commit", "-q", "-m", "initial"]);
    rev_parse(dir, "HEAD").unwrap()
  }

  #[test]
  fn commit_refspec_needs_no_clone() {
    let top = TempDir::new().unwrap();
    let registry = DownloadRegistry::new();
    let logger = Logger::sink("t");
    let ctx = FetchCtx {
      pwd: top.path(),
      registry: &registry,
      logger: &logger,
      ref_patterns: &[],
    };

    let commit = "0123456789abcdef0123456789abcdef01234567";
    let unit = GitFetch::new("ssh://nowhere/repo.git", "repo", commit, None);
    assert_eq!(unit.hash(&ctx).unwrap(), commit);
  }

  #[test]
  fn digest_hash_short_circuits_fetch() {
    let top = TempDir::new().unwrap();
    let registry = DownloadRegistry::new();
    let logger = Logger::sink("t");
    let ctx = FetchCtx {
      pwd: top.path(),
      registry: &registry,
      logger: &logger,
      ref_patterns: &[],
    };

    let unit = GitFetch::new(
      "ssh://nowhere/repo.git",
      "repo",
      "v1.2",
      Some("feedfacefeedfacefeedfacefeedfacefeedface".into()),
    );
    assert_eq!(unit.hash(&ctx).unwrap(), "feedfacefeedfacefeedfacefeedfacefeedface");
  }

  #[test]
  fn clone_and_hash_from_local_remote() {
    let top = TempDir::new().unwrap();
    let remote = top.path().join("upstream");
    fs::create_dir(&remote).unwrap();
    let commit = init_repo(&remote);

    let registry = DownloadRegistry::new();
    let logger = Logger::sink("t");
    let ctx = FetchCtx {
      pwd: top.path(),
      registry: &registry,
      logger: &logger,
      ref_patterns: &[],
    };

    let unit = GitFetch::new(&remote.display().to_string(), "repo", "HEAD", None);
    unit.fetch(&ctx).unwrap();
    assert_eq!(unit.hash(&ctx).unwrap(), commit);
    assert!(top.path().join("source/repo").is_dir());

    // fetching again is a no-op
    unit.fetch(&ctx).unwrap();
  }

  #[test]
  fn dirty_tree_detection() {
    let top = TempDir::new().unwrap();
    let repo = top.path().join("repo");
    fs::create_dir(&repo).unwrap();
    init_repo(&repo);

    assert!(!is_dirty(&repo));
    let clean = diff_hash(&repo).unwrap();

    fs::write(repo.join("file"), "changed").unwrap();
    assert!(is_dirty(&repo));
    assert_ne!(diff_hash(&repo).unwrap(), clean);
  }

  #[test]
  fn missing_directory_is_not_dirty() {
    assert!(!is_dirty(Path::new("/nonexistent/path")));
  }

  #[test]
  fn reference_pattern_rewrites_prefix() {
    let patterns = vec![("https://git.example.com/".to_string(), "/mirror/".to_string())];
    assert_eq!(
      reference_dir("https://git.example.com/proj.git", &patterns),
      Some("/mirror/proj.git".to_string())
    );
    assert_eq!(reference_dir("https://other.com/proj.git", &patterns), None);
  }
}
