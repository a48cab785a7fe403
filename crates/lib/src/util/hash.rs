//! Content hashing helpers.
//!
//! Everything the engine fingerprints (recipe files, fetched artifacts,
//! info files, whole output trees) goes through SHA-256 and is carried
//! around as a lowercase 64-character hex string.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// Hash an in-memory string.
pub fn hash_string(data: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(data.as_bytes());
  hex::encode(hasher.finalize())
}

/// Hash the contents of a file.
pub fn hash_file(path: &Path) -> io::Result<String> {
  let mut file = File::open(path)?;
  let mut hasher = Sha256::new();
  let mut buf = [0u8; 64 * 1024];
  loop {
    let n = file.read(&mut buf)?;
    if n == 0 {
      break;
    }
    hasher.update(&buf[..n]);
  }
  Ok(hex::encode(hasher.finalize()))
}

/// Hash a directory tree.
///
/// The digest covers every regular file's path (relative to `root`) and
/// contents, and every symlink's path and target, in sorted path order.
/// Directories contribute only through the files beneath them.
pub fn hash_tree(root: &Path) -> io::Result<String> {
  let mut entries: Vec<_> = WalkDir::new(root)
    .sort_by_file_name()
    .into_iter()
    .collect::<Result<Vec<_>, _>>()
    .map_err(io::Error::other)?;
  entries.retain(|e| !e.file_type().is_dir());

  let mut hasher = Sha256::new();
  for entry in entries {
    let rel = entry.path().strip_prefix(root).map_err(io::Error::other)?;
    hasher.update(rel.to_string_lossy().as_bytes());
    hasher.update([0u8]);
    if entry.file_type().is_symlink() {
      let target = std::fs::read_link(entry.path())?;
      hasher.update(target.to_string_lossy().as_bytes());
    } else {
      hasher.update(hash_file(entry.path())?.as_bytes());
    }
    hasher.update([0u8]);
  }
  Ok(hex::encode(hasher.finalize()))
}

/// True when `s` looks like a full git commit id (40 lowercase hex chars).
pub fn is_commit_id(s: &str) -> bool {
  s.len() == 40 && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}
