//! Update-only recursive copy with attribute preservation.
//!
//! Extraction steps and restore commands historically relied on
//! `cp -dpRuf` (keep symlinks) and `cp -pRLuf` (follow symlinks). The
//! semantics those flags encode (recurse, preserve mode and mtime,
//! overwrite only when the source is newer) are implemented natively
//! here so the engine does not depend on coreutils flag behaviour.

use std::fs;
use std::io;
use std::path::Path;

use filetime::FileTime;

/// What to do when the copy encounters a symbolic link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPolicy {
  /// Recreate the link itself (`cp -d`).
  Keep,
  /// Copy the link target's contents (`cp -L`).
  Follow,
}

/// Copy `src` to `dst`, merging into an existing destination tree.
///
/// `dst` names the destination of `src` itself, not a containing
/// directory. Regular files are skipped when the destination is at
/// least as new as the source; mode and mtime are preserved on
/// everything that is written.
pub fn copy_tree(src: &Path, dst: &Path, links: LinkPolicy) -> io::Result<()> {
  let meta = match links {
    LinkPolicy::Keep => fs::symlink_metadata(src)?,
    LinkPolicy::Follow => fs::metadata(src)?,
  };

  if meta.file_type().is_symlink() {
    replace_symlink(src, dst)
  } else if meta.is_dir() {
    copy_dir(src, dst, &meta, links)
  } else {
    copy_file_update(src, dst, &meta)
  }
}

fn copy_dir(src: &Path, dst: &Path, meta: &fs::Metadata, links: LinkPolicy) -> io::Result<()> {
  if !dst.is_dir() {
    fs::create_dir_all(dst)?;
    fs::set_permissions(dst, meta.permissions())?;
  }
  for entry in fs::read_dir(src)? {
    let entry = entry?;
    copy_tree(&entry.path(), &dst.join(entry.file_name()), links)?;
  }
  // Directory mtimes are restored after the children so the writes above
  // don't clobber them.
  filetime::set_file_mtime(dst, FileTime::from_last_modification_time(meta))?;
  Ok(())
}

fn copy_file_update(src: &Path, dst: &Path, meta: &fs::Metadata) -> io::Result<()> {
  if let Ok(existing) = fs::symlink_metadata(dst) {
    if !existing.file_type().is_symlink()
      && FileTime::from_last_modification_time(&existing)
        >= FileTime::from_last_modification_time(meta)
    {
      return Ok(());
    }
    remove_any(dst, &existing)?;
  }
  fs::copy(src, dst)?;
  fs::set_permissions(dst, meta.permissions())?;
  filetime::set_file_mtime(dst, FileTime::from_last_modification_time(meta))?;
  Ok(())
}

fn replace_symlink(src: &Path, dst: &Path) -> io::Result<()> {
  let target = fs::read_link(src)?;
  if let Ok(existing) = fs::symlink_metadata(dst) {
    if existing.file_type().is_symlink() && fs::read_link(dst)? == target {
      return Ok(());
    }
    remove_any(dst, &existing)?;
  }
  #[cfg(unix)]
  std::os::unix::fs::symlink(&target, dst)?;
  Ok(())
}

fn remove_any(path: &Path, meta: &fs::Metadata) -> io::Result<()> {
  if meta.is_dir() && !meta.file_type().is_symlink() {
    fs::remove_dir_all(path)
  } else {
    fs::remove_file(path)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn copies_nested_tree() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    fs::create_dir_all(src.join("a/b")).unwrap();
    fs::write(src.join("a/b/f"), "data").unwrap();

    let dst = dir.path().join("dst");
    copy_tree(&src, &dst, LinkPolicy::Keep).unwrap();
    assert_eq!(fs::read_to_string(dst.join("a/b/f")).unwrap(), "data");
  }

  #[test]
  fn newer_destination_is_not_overwritten() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    fs::write(&src, "old").unwrap();
    fs::write(&dst, "newer").unwrap();

    filetime::set_file_mtime(&src, FileTime::from_unix_time(100, 0)).unwrap();
    filetime::set_file_mtime(&dst, FileTime::from_unix_time(500, 0)).unwrap();

    copy_tree(&src, &dst, LinkPolicy::Keep).unwrap();
    assert_eq!(fs::read_to_string(&dst).unwrap(), "newer");
  }

  #[test]
  fn older_destination_is_overwritten() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    fs::write(&src, "fresh").unwrap();
    fs::write(&dst, "stale").unwrap();

    filetime::set_file_mtime(&src, FileTime::from_unix_time(500, 0)).unwrap();
    filetime::set_file_mtime(&dst, FileTime::from_unix_time(100, 0)).unwrap();

    copy_tree(&src, &dst, LinkPolicy::Keep).unwrap();
    assert_eq!(fs::read_to_string(&dst).unwrap(), "fresh");
  }

  #[test]
  fn mtime_is_preserved() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    fs::write(&src, "x").unwrap();
    filetime::set_file_mtime(&src, FileTime::from_unix_time(4242, 0)).unwrap();

    let dst = dir.path().join("dst");
    copy_tree(&src, &dst, LinkPolicy::Keep).unwrap();

    let meta = fs::metadata(&dst).unwrap();
    assert_eq!(FileTime::from_last_modification_time(&meta).unix_seconds(), 4242);
  }

  #[cfg(unix)]
  #[test]
  fn keep_preserves_symlinks_and_follow_dereferences() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    fs::create_dir(&src).unwrap();
    fs::write(src.join("real"), "content").unwrap();
    std::os::unix::fs::symlink("real", src.join("link")).unwrap();

    let kept = dir.path().join("kept");
    copy_tree(&src, &kept, LinkPolicy::Keep).unwrap();
    assert!(fs::symlink_metadata(kept.join("link")).unwrap().file_type().is_symlink());

    let followed = dir.path().join("followed");
    copy_tree(&src, &followed, LinkPolicy::Follow).unwrap();
    let meta = fs::symlink_metadata(followed.join("link")).unwrap();
    assert!(meta.file_type().is_file());
    assert_eq!(fs::read_to_string(followed.join("link")).unwrap(), "content");
  }
}
