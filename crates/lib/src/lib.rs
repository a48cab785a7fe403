//! bake-lib: the engine of bake.lua.
//!
//! bake.lua builds trees of packages described by Lua recipes. Each
//! package fetches sources, materialises them into an isolated work
//! tree, runs its build commands against a staging tree composed from
//! its dependencies' outputs, and captures a staging tarball (for
//! dependents) and an install tarball (the deployable output). Builds
//! are fingerprinted by their inputs (recipe file, queried features,
//! extraction steps, dependency outputs) and skipped when nothing
//! changed.
//!
//! [`World`] is the entry point: it owns the package arena and drives
//! recipe evaluation, cycle checking, and the parallel scheduler.

pub mod builddir;
pub mod buildinfo;
pub mod cache;
pub mod cmd;
pub mod extraction;
pub mod features;
pub mod fetch;
pub mod graph;
pub mod namespace;
pub mod overlay;
pub mod package;
pub mod recipe;
pub mod util;
pub mod world;

pub use builddir::BuildDir;
pub use features::FeatureMap;
pub use graph::GraphError;
pub use package::{BuildError, BuildState, Package};
pub use recipe::RecipeError;
pub use world::{RunSummary, World, WorldError, WorldOpts};
