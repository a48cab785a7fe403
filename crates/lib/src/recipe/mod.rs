//! The Lua recipe evaluator.
//!
//! Each package's recipe runs in a fresh Lua state with the bake API
//! registered as globals: `depend`, `feature`, `builddir`, `intercept`,
//! `keepstaging`, `hashoutput`, `name`, `package_name`, `require`,
//! `optionally_require`, and `overlayadd`. Evaluation is
//! single-threaded and happens entirely before scheduling; everything
//! the recipe declares lands on the [`Package`] being processed.

mod builddir;

use std::fs;
use std::io;
use std::sync::Arc;

use mlua::prelude::*;
use thiserror::Error;
use tracing::debug;

use crate::overlay::PathError;
use crate::package::{Depend, Package, RecipeFile};
use crate::util::hash::hash_file;
use crate::world::World;

use builddir::BuildDirHandle;

#[derive(Debug, Error)]
pub enum RecipeError {
  #[error("recipe error: {0}")]
  Lua(#[from] mlua::Error),

  #[error(transparent)]
  Path(#[from] PathError),

  #[error("io error: {0}")]
  Io(#[from] io::Error),
}

/// Evaluate `file` against `package`.
pub fn evaluate(world: &Arc<World>, package: &Arc<Package>, file: &RecipeFile) -> Result<(), RecipeError> {
  let source = fs::read_to_string(&file.path).map_err(RecipeError::Io)?;

  let lua = Lua::new();
  register_globals(&lua, world, package)?;
  lua.load(source.as_str()).set_name(file.short.as_str()).exec()?;
  Ok(())
}

fn register_globals(lua: &Lua, world: &Arc<World>, package: &Arc<Package>) -> LuaResult<()> {
  let globals = lua.globals();

  // depend(name | {package=|packages=, namespace=, locally=})
  {
    let world = world.clone();
    let package = package.clone();
    globals.set(
      "depend",
      lua.create_function(move |_, arg: LuaValue| {
        match arg {
          LuaValue::String(name) => {
            declare_depend(&world, &package, &name.to_str()?, None, false);
            Ok(())
          }
          LuaValue::Table(spec) => {
            let mut names: Vec<String> = Vec::new();
            let mut namespace: Option<String> = None;
            let mut locally = false;
            for pair in spec.pairs::<String, LuaValue>() {
              let (key, value) = pair?;
              match key.as_str() {
                "package" | "packages" => match value {
                  LuaValue::String(s) => names.push(s.to_str()?.to_string()),
                  LuaValue::Table(list) => {
                    for entry in list.sequence_values::<String>() {
                      names.push(entry?);
                    }
                  }
                  _ => {
                    return Err(LuaError::external(
                      "depend() requires a single package name or table of package names",
                    ));
                  }
                },
                "namespace" => match value {
                  LuaValue::String(s) => namespace = Some(s.to_str()?.to_string()),
                  _ => return Err(LuaError::external("depend() requires a string for the namespace name")),
                },
                "locally" => match value {
                  LuaValue::Boolean(b) => locally = b,
                  LuaValue::String(s) => locally = s.to_str()? == "true",
                  _ => {}
                },
                _ => {}
              }
            }
            for name in &names {
              declare_depend(&world, &package, name, namespace.as_deref(), locally);
            }
            Ok(())
          }
          _ => Err(LuaError::external("depend() takes a string or a table")),
        }
      })?,
    )?;
  }

  // feature(key) -> value|nil ; feature(key, value[, override])
  {
    let world = world.clone();
    let package = package.clone();
    globals.set(
      "feature",
      lua.create_function(
        move |_, (key, value, override_existing): (String, Option<String>, Option<bool>)| match value {
          None => match world.features().get_scoped(package.name(), &key) {
            Ok(value) => {
              package.with_description(|d| d.add_feature_value(&key, &value));
              Ok(Some(value))
            }
            Err(_) => {
              package.with_description(|d| d.add_nil_feature_value(&key));
              Ok(None)
            }
          },
          Some(value) => {
            world.features().set(&key, &value, override_existing.unwrap_or(false));
            Ok(None)
          }
        },
      )?,
    )?;
  }

  // builddir([clean]) -> BuildDir object
  {
    let world = world.clone();
    let package = package.clone();
    globals.set(
      "builddir",
      lua.create_function(move |_, clean: Option<bool>| {
        if clean.unwrap_or(false) {
          package.set_clean_before_build();
        }
        Ok(BuildDirHandle::new(world.clone(), package.clone()))
      })?,
    )?;
  }

  // name() -> namespace name
  {
    let package = package.clone();
    globals.set(
      "name",
      lua.create_function(move |_, ()| Ok(package.ns().name().to_string()))?,
    )?;
  }

  // package_name() -> package name
  {
    let package = package.clone();
    globals.set(
      "package_name",
      lua.create_function(move |_, ()| Ok(package.name().to_string()))?,
    )?;
  }

  // intercept({staging=, install=}), defaulting to install-only
  {
    let package = package.clone();
    globals.set(
      "intercept",
      lua.create_function(move |_, spec: Option<LuaTable>| {
        let mut install = true;
        let mut staging = false;
        if let Some(spec) = spec {
          install = false;
          for pair in spec.pairs::<String, bool>() {
            let (key, value) = pair?;
            match key.as_str() {
              "install" => install = value,
              "staging" => staging = value,
              _ => {}
            }
          }
        }
        package.set_intercept(install, staging);
        Ok(())
      })?,
    )?;
  }

  // keepstaging()
  {
    let package = package.clone();
    globals.set(
      "keepstaging",
      lua.create_function(move |_, ()| {
        package.set_suppress_remove_staging();
        Ok(())
      })?,
    )?;
  }

  // hashoutput(): dependents fingerprint this package's output
  // contents instead of its recipe
  {
    let package = package.clone();
    globals.set(
      "hashoutput",
      lua.create_function(move |_, ()| {
        package.set_hash_output();
        Ok(())
      })?,
    )?;
  }

  // require(file) / optionally_require(file)
  {
    let world = world.clone();
    let package = package.clone();
    globals.set(
      "require",
      lua.create_function(move |lua, name: String| require_file(lua, &world, &package, &name, false))?,
    )?;
  }
  {
    let world = world.clone();
    let package = package.clone();
    globals.set(
      "optionally_require",
      lua.create_function(move |lua, name: String| require_file(lua, &world, &package, &name, true))?,
    )?;
  }

  // overlayadd(path)
  {
    let world = world.clone();
    globals.set(
      "overlayadd",
      lua.create_function(move |_, path: String| {
        world.overlays().add(&path, true);
        Ok(())
      })?,
    )?;
  }

  Ok(())
}

fn declare_depend(world: &Arc<World>, package: &Arc<Package>, name: &str, namespace: Option<&str>, locally: bool) {
  let ns = match namespace {
    Some(ns) => world.find_namespace(ns),
    None => package.ns().clone(),
  };
  let dep = world.find_package(&ns, name);
  debug!(package = %package.name(), depends_on = %dep.name(), locally, "dependency declared");
  package.depend(Depend::new(dep, locally));
}

/// Evaluate another recipe fragment in the caller's Lua state and
/// record it in the build-info fingerprint. A missing file is fatal
/// unless `optional`.
fn require_file(
  lua: &Lua,
  world: &Arc<World>,
  package: &Arc<Package>,
  name: &str,
  optional: bool,
) -> LuaResult<LuaMultiValue> {
  let fname = format!("{name}.lua");
  let resolved = match world.overlays().resolve(world.pwd(), package.name(), &fname, true) {
    Ok(resolved) => resolved,
    Err(err) => {
      if optional {
        return Ok(LuaMultiValue::new());
      }
      return Err(LuaError::external(err));
    }
  };
  let path = world.pwd().join(&resolved);
  let source = fs::read_to_string(&path).map_err(LuaError::external)?;
  let hash = hash_file(&path).map_err(LuaError::external)?;
  package.with_description(|d| d.add_require_file(&fname, &hash));
  lua.load(source.as_str()).set_name(fname.as_str()).eval::<LuaMultiValue>()
}
