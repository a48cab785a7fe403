//! Remote build-cache client.
//!
//! Pre-built artifacts are published under
//! `<base>/<ns>/<pkg>/<buildinfo_hash>/` as `usable` (a sentinel),
//! `staging.tar`, `install.tar`, and, for `hash_output` packages,
//! `output.info`. A cache hit needs every one of them; any miss falls
//! the package back to a local build.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::builddir::BuildDir;

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("cache request failed for {url}: {message}")]
  Request { url: String, message: String },

  #[error("cache returned HTTP {status} for {url}")]
  Status { url: String, status: u16 },

  #[error("io error: {0}")]
  Io(#[from] io::Error),
}

/// Client for one remote artifact cache.
#[derive(Debug)]
pub struct CacheClient {
  base: String,
  client: reqwest::blocking::Client,
}

impl CacheClient {
  pub fn new(base: &str) -> Self {
    let client = reqwest::blocking::Client::builder()
      .timeout(Duration::from_secs(600))
      .build()
      .unwrap_or_default();
    Self {
      base: base.trim_end_matches('/').to_string(),
      client,
    }
  }

  fn url(&self, ns: &str, name: &str, hash: &str, artifact: &str) -> String {
    format!("{}/{ns}/{name}/{hash}/{artifact}", self.base)
  }

  fn get(&self, url: &str) -> Result<Vec<u8>, CacheError> {
    let response = self.client.get(url).send().map_err(|e| CacheError::Request {
      url: url.to_string(),
      message: e.to_string(),
    })?;
    if !response.status().is_success() {
      return Err(CacheError::Status {
        url: url.to_string(),
        status: response.status().as_u16(),
      });
    }
    response.bytes().map(|b| b.to_vec()).map_err(|e| CacheError::Request {
      url: url.to_string(),
      message: e.to_string(),
    })
  }

  fn get_to_file(&self, url: &str, target: &Path) -> Result<(), CacheError> {
    let bytes = self.get(url)?;
    let partial = target.with_extension("partial");
    let mut file = fs::File::create(&partial)?;
    file.write_all(&bytes)?;
    file.flush()?;
    fs::rename(&partial, target)?;
    Ok(())
  }

  /// Try to satisfy a package build from the cache.
  ///
  /// All artifacts must arrive for this to succeed; a partial download
  /// never replaces existing outputs because the tarballs are written
  /// through temporary names.
  pub fn fetch_package(
    &self,
    ns: &str,
    name: &str,
    buildinfo_hash: &str,
    hash_output: bool,
    bd: &BuildDir,
  ) -> Result<(), CacheError> {
    let usable = self.url(ns, name, buildinfo_hash, "usable");
    debug!(url = %usable, "probing build cache");
    self.get(&usable)?;

    self.get_to_file(&self.url(ns, name, buildinfo_hash, "staging.tar"), &bd.staging_tar())?;
    self.get_to_file(&self.url(ns, name, buildinfo_hash, "install.tar"), &bd.install_tar())?;
    if hash_output {
      self.get_to_file(&self.url(ns, name, buildinfo_hash, "output.info"), &bd.output_info())?;
    }

    info!(package = %name, hash = %buildinfo_hash, "fetched from build cache");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn urls_follow_the_cache_layout() {
    let client = CacheClient::new("http://cache.example.com/bake/");
    assert_eq!(
      client.url("host", "zlib", "abc123", "usable"),
      "http://cache.example.com/bake/host/zlib/abc123/usable"
    );
    assert_eq!(
      client.url("host", "zlib", "abc123", "staging.tar"),
      "http://cache.example.com/bake/host/zlib/abc123/staging.tar"
    );
  }

  #[test]
  fn unreachable_cache_is_an_error_not_a_panic() {
    let top = tempfile::TempDir::new().unwrap();
    let bd = BuildDir::new(top.path(), "ns", "pkg");
    bd.create_all().unwrap();

    let client = CacheClient::new("http://127.0.0.1:1/nope");
    let err = client.fetch_package("ns", "pkg", "hash", false, &bd).unwrap_err();
    assert!(matches!(err, CacheError::Request { .. }));
  }
}
