//! End-to-end engine tests: recipes in, tarballs out.
//!
//! Each test gets an isolated working directory with its recipes laid
//! out the way a real checkout would be (`<target>.lua` at the root,
//! dependencies under `package/<name>/<name>.lua`).

use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use tempfile::TempDir;

use bake_lib::util::hash::{hash_file, hash_string};
use bake_lib::{BuildState, World, WorldError, WorldOpts};

fn write_base(top: &Path, name: &str, body: &str) {
  fs::write(top.join(format!("{name}.lua")), body).unwrap();
}

fn write_recipe(top: &Path, name: &str, body: &str) {
  let dir = top.join("package").join(name);
  fs::create_dir_all(&dir).unwrap();
  let leaf = name.rsplit('/').next().unwrap();
  fs::write(dir.join(format!("{leaf}.lua")), body).unwrap();
}

fn world(top: &Path) -> Arc<World> {
  World::new(top, WorldOpts::default())
}

fn tar_lists(tarball: &Path, entry: &str) -> bool {
  let output = Command::new("tar").arg("tf").arg(tarball).output().unwrap();
  assert!(output.status.success(), "tar tf {tarball:?} failed");
  String::from_utf8_lossy(&output.stdout).lines().any(|l| l.trim_end_matches('/') == entry)
}

fn was_built(world: &World, name: &str) -> bool {
  world
    .packages()
    .iter()
    .find(|p| p.name() == name)
    .unwrap_or_else(|| panic!("no package named {name}"))
    .was_built()
}

const TRIVIAL: &str = r#"
local bd = builddir()
bd:cmd(".", "sh", {"-c", "echo hi > " .. bd.new_install .. "/hi"})
"#;

const LIB_STAGING: &str = r#"
local bd = builddir()
bd:cmd(".", "sh", {"-c", "echo lib > " .. bd.new_staging .. "/lib.txt"})
"#;

#[test]
fn s1_trivial_build_produces_install_tarball() {
  let top = TempDir::new().unwrap();
  write_base(top.path(), "hello", TRIVIAL);

  let summary = world(top.path()).run("hello.lua").unwrap();
  assert_eq!(summary.packages, 1);
  assert_eq!(summary.built, 1);

  let install_tar = top.path().join("output/hello/install/hello.tar");
  assert!(install_tar.exists());
  assert!(tar_lists(&install_tar, "./hi"));

  // the fingerprint of a fetchless, depless package is just its recipe
  let build_info = top.path().join("output/hello/hello/work/.build.info");
  let recipe_hash = hash_file(&top.path().join("hello.lua")).unwrap();
  assert_eq!(
    fs::read_to_string(&build_info).unwrap(),
    format!("PackageFile hello.lua {recipe_hash}\n")
  );
}

#[test]
fn s2_unchanged_inputs_build_nothing() {
  let top = TempDir::new().unwrap();
  write_base(top.path(), "hello", TRIVIAL);

  world(top.path()).run("hello.lua").unwrap();
  let install_tar = top.path().join("output/hello/install/hello.tar");
  let mtime_before = fs::metadata(&install_tar).unwrap().modified().unwrap();

  let summary = world(top.path()).run("hello.lua").unwrap();
  assert_eq!(summary.built, 0);
  assert_eq!(fs::metadata(&install_tar).unwrap().modified().unwrap(), mtime_before);
}

#[test]
fn s3_recipe_edit_triggers_rebuild() {
  let top = TempDir::new().unwrap();
  write_base(top.path(), "hello", TRIVIAL);
  world(top.path()).run("hello.lua").unwrap();

  let recipe = top.path().join("hello.lua");
  let mut body = fs::read_to_string(&recipe).unwrap();
  body.push_str("-- tweak\n");
  fs::write(&recipe, body).unwrap();

  let summary = world(top.path()).run("hello.lua").unwrap();
  assert_eq!(summary.built, 1);
}

#[test]
fn s4_dependency_edit_cascades_to_dependents() {
  let top = TempDir::new().unwrap();
  write_base(
    top.path(),
    "app",
    r#"
depend("libb")
local bd = builddir()
bd:cmd(".", "sh", {"-c", "echo app > " .. bd.new_install .. "/app"})
"#,
  );
  write_recipe(top.path(), "libb", LIB_STAGING);

  let w1 = world(top.path());
  assert_eq!(w1.run("app.lua").unwrap().built, 2);

  let w2 = world(top.path());
  assert_eq!(w2.run("app.lua").unwrap().built, 0);

  let recipe = top.path().join("package/libb/libb.lua");
  let mut body = fs::read_to_string(&recipe).unwrap();
  body.push_str("-- touched\n");
  fs::write(&recipe, body).unwrap();

  let w3 = world(top.path());
  w3.run("app.lua").unwrap();
  assert!(was_built(&w3, "libb"));
  assert!(was_built(&w3, "app"));
}

#[test]
fn s5_hash_output_shields_dependents_from_cosmetic_edits() {
  let top = TempDir::new().unwrap();
  write_base(
    top.path(),
    "app2",
    r#"
depend("libh")
local bd = builddir()
bd:cmd(".", "sh", {"-c", "echo app > " .. bd.new_install .. "/app"})
"#,
  );
  write_recipe(
    top.path(),
    "libh",
    r#"
hashoutput()
local bd = builddir()
bd:cmd(".", "sh", {"-c", "echo fixed > " .. bd.new_install .. "/data"})
"#,
  );

  assert_eq!(world(top.path()).run("app2.lua").unwrap().built, 2);

  // cosmetic edit: the recipe changes, the produced bytes do not
  let recipe = top.path().join("package/libh/libh.lua");
  let mut body = fs::read_to_string(&recipe).unwrap();
  body.push_str("-- cosmetic\n");
  fs::write(&recipe, body).unwrap();

  let w = world(top.path());
  w.run("app2.lua").unwrap();
  assert!(was_built(&w, "libh"));
  assert!(!was_built(&w, "app2"));
}

#[test]
fn s6_dependency_cycle_fails_before_any_build() {
  let top = TempDir::new().unwrap();
  write_base(top.path(), "cyc", "depend(\"pa\")\n");
  write_recipe(top.path(), "pa", "depend(\"pb\")\nlocal bd = builddir()\n");
  write_recipe(top.path(), "pb", "depend(\"pa\")\nlocal bd = builddir()\n");

  let err = world(top.path()).run("cyc.lua").unwrap_err();
  match err {
    WorldError::Graph(graph_err) => {
      let message = graph_err.to_string();
      assert!(message.contains("pa"), "{message}");
      assert!(message.contains("pb"), "{message}");
    }
    other => panic!("expected a cycle error, got: {other}"),
  }
  assert!(!top.path().join("output/cyc/install/cyc.tar").exists());
  assert!(!top.path().join("output/cyc/staging/pa.tar").exists());
}

#[test]
fn forced_mode_builds_only_the_allowlist() {
  let top = TempDir::new().unwrap();
  write_base(
    top.path(),
    "app",
    r#"
depend("libb")
local bd = builddir()
bd:cmd(".", "sh", {"-c", "echo app > " .. bd.new_install .. "/app"})
"#,
  );
  write_recipe(top.path(), "libb", LIB_STAGING);

  let opts = WorldOpts {
    forced: vec!["libb".to_string()],
    ..Default::default()
  };
  let w = World::new(top.path(), opts);
  let summary = w.run("app.lua").unwrap();

  assert_eq!(summary.built, 1);
  let packages = w.packages();
  let libb = packages.iter().find(|p| p.name() == "libb").unwrap();
  let app = packages.iter().find(|p| p.name() == "app").unwrap();
  assert_eq!(libb.state(), BuildState::Built);
  assert!(libb.was_built());
  assert_eq!(app.state(), BuildState::Suppressed);
  assert!(!top.path().join("output/app/install/app.tar").exists());
}

#[test]
fn feature_changes_are_fingerprinted() {
  let top = TempDir::new().unwrap();
  write_base(
    top.path(),
    "feat",
    r#"
local flavor = feature("flavor")
local bd = builddir()
bd:cmd(".", "sh", {"-c", "echo " .. (flavor or "none") .. " > " .. bd.new_install .. "/flavor"})
"#,
  );

  let w1 = world(top.path());
  w1.features().set_from_arg("flavor=one").unwrap();
  assert_eq!(w1.run("feat.lua").unwrap().built, 1);

  let info = fs::read_to_string(top.path().join("output/feat/feat/work/.build.info")).unwrap();
  assert!(info.contains("FeatureValue flavor one"), "{info}");

  let w2 = world(top.path());
  w2.features().set_from_arg("flavor=two").unwrap();
  assert_eq!(w2.run("feat.lua").unwrap().built, 1);

  let w3 = world(top.path());
  w3.features().set_from_arg("flavor=two").unwrap();
  assert_eq!(w3.run("feat.lua").unwrap().built, 0);
}

#[test]
fn absent_features_fingerprint_as_nil() {
  let top = TempDir::new().unwrap();
  write_base(
    top.path(),
    "feat",
    r#"
local flavor = feature("flavor")
local bd = builddir()
bd:cmd(".", "sh", {"-c", "echo x > " .. bd.new_install .. "/x"})
"#,
  );

  world(top.path()).run("feat.lua").unwrap();
  let info = fs::read_to_string(top.path().join("output/feat/feat/work/.build.info")).unwrap();
  assert!(info.contains("FeatureValueNil flavor"), "{info}");
}

#[test]
fn ignored_features_never_invalidate() {
  let top = TempDir::new().unwrap();
  write_base(
    top.path(),
    "feat",
    r#"
local id = feature("job-id")
local bd = builddir()
bd:cmd(".", "sh", {"-c", "echo x > " .. bd.new_install .. "/x"})
"#,
  );

  let opts = || WorldOpts {
    ignored_features: ["job-id".to_string()].into(),
    ..Default::default()
  };

  let w1 = World::new(top.path(), opts());
  w1.features().set_from_arg("job-id=100").unwrap();
  assert_eq!(w1.run("feat.lua").unwrap().built, 1);

  let info = fs::read_to_string(top.path().join("output/feat/feat/work/.build.info")).unwrap();
  assert!(!info.contains("job-id"), "{info}");

  let w2 = World::new(top.path(), opts());
  w2.features().set_from_arg("job-id=200").unwrap();
  assert_eq!(w2.run("feat.lua").unwrap().built, 0);
}

#[test]
fn staging_composition_exposes_dependency_outputs() {
  let top = TempDir::new().unwrap();
  write_base(
    top.path(),
    "stag",
    r#"
depend("libb")
local bd = builddir()
bd:cmd(".", "sh", {"-c", "test -f " .. bd.staging .. "/lib.txt"})
bd:cmd(".", "sh", {"-c", "cp " .. bd.staging .. "/lib.txt " .. bd.new_install .. "/"})
"#,
  );
  write_recipe(top.path(), "libb", LIB_STAGING);

  let summary = world(top.path()).run("stag.lua").unwrap();
  assert_eq!(summary.built, 2);
  assert!(tar_lists(&top.path().join("output/stag/install/stag.tar"), "./lib.txt"));

  // the composed staging tree is removed after a successful build
  assert!(!top.path().join("output/stag/stag/staging").exists());
}

#[test]
fn keepstaging_preserves_the_composed_tree() {
  let top = TempDir::new().unwrap();
  write_base(
    top.path(),
    "keep",
    r#"
depend("libb")
keepstaging()
local bd = builddir()
bd:cmd(".", "sh", {"-c", "echo x > " .. bd.new_install .. "/x"})
"#,
  );
  write_recipe(top.path(), "libb", LIB_STAGING);

  world(top.path()).run("keep.lua").unwrap();
  assert!(top.path().join("output/keep/keep/staging/lib.txt").exists());
}

#[test]
fn deps_extraction_unpacks_install_trees() {
  let top = TempDir::new().unwrap();
  write_base(
    top.path(),
    "depsx",
    r#"
depend("libi")
local bd = builddir()
bd:fetch{method = "deps", to = "deps"}
bd:cmd(".", "sh", {"-c", "test -f deps/prog"})
bd:cmd(".", "sh", {"-c", "echo ok > " .. bd.new_install .. "/ok"})
"#,
  );
  write_recipe(
    top.path(),
    "libi",
    r#"
local bd = builddir()
bd:cmd(".", "sh", {"-c", "echo bin > " .. bd.new_install .. "/prog"})
"#,
  );

  let summary = world(top.path()).run("depsx.lua").unwrap();
  assert_eq!(summary.built, 2);
  assert!(tar_lists(&top.path().join("output/depsx/install/depsx.tar"), "./ok"));
}

#[test]
fn install_files_are_copied_individually_and_always_rebuild() {
  let top = TempDir::new().unwrap();
  write_base(
    top.path(),
    "inst",
    r#"
local bd = builddir()
bd:cmd(".", "sh", {"-c", "echo hi > " .. bd.new_install .. "/hi"})
bd:installfile("hi")
"#,
  );

  assert_eq!(world(top.path()).run("inst.lua").unwrap().built, 1);
  let installed = top.path().join("output/inst/install/hi");
  assert_eq!(fs::read_to_string(&installed).unwrap(), "hi\n");
  assert!(!top.path().join("output/inst/install/inst.tar").exists());

  // install-file packages never take the cached path
  assert_eq!(world(top.path()).run("inst.lua").unwrap().built, 1);
}

#[test]
fn parse_only_evaluates_but_builds_nothing() {
  let top = TempDir::new().unwrap();
  write_base(top.path(), "app", "depend(\"libb\")\nlocal bd = builddir()\n");
  write_recipe(top.path(), "libb", LIB_STAGING);

  let opts = WorldOpts {
    parse_only: true,
    ..Default::default()
  };
  let summary = World::new(top.path(), opts).run("app.lua").unwrap();
  assert_eq!(summary.packages, 2);
  assert_eq!(summary.built, 0);
  assert!(!top.path().join("output/app/staging/libb.tar").exists());
}

#[test]
fn fetch_only_stops_before_commands() {
  let top = TempDir::new().unwrap();
  write_base(top.path(), "hello", TRIVIAL);

  let opts = WorldOpts {
    fetch_only: true,
    ..Default::default()
  };
  let summary = World::new(top.path(), opts).run("hello.lua").unwrap();
  assert_eq!(summary.built, 0);
  assert!(!top.path().join("output/hello/install/hello.tar").exists());
}

#[test]
fn keep_going_finishes_unaffected_packages() {
  let top = TempDir::new().unwrap();
  write_base(top.path(), "kg", "depend(\"okpkg\")\ndepend(\"badpkg\")\nlocal bd = builddir()\n");
  write_recipe(
    top.path(),
    "okpkg",
    r#"
local bd = builddir()
bd:cmd(".", "sh", {"-c", "echo ok > " .. bd.new_staging .. "/ok"})
"#,
  );
  write_recipe(
    top.path(),
    "badpkg",
    r#"
local bd = builddir()
bd:cmd(".", "sh", {"-c", "exit 1"})
"#,
  );

  let opts = WorldOpts {
    keep_going: true,
    ..Default::default()
  };
  let w = World::new(top.path(), opts);
  let err = w.run("kg.lua").unwrap_err();
  match err {
    WorldError::PackagesFailed { packages } => assert_eq!(packages, vec!["badpkg".to_string()]),
    other => panic!("expected PackagesFailed, got: {other}"),
  }
  assert!(was_built(&w, "okpkg"));
  assert!(!was_built(&w, "kg"));
  assert!(!top.path().join("output/kg/install/kg.tar").exists());
}

#[test]
fn copyfile_extraction_refreshes_when_the_source_changes() {
  let top = TempDir::new().unwrap();
  write_base(
    top.path(),
    "cf",
    r#"
local bd = builddir()
bd:fetch{method = "copyfile", uri = "cfg.txt"}
bd:cmd(".", "sh", {"-c", "cp cfg.txt " .. bd.new_install .. "/"})
"#,
  );
  // copyfile sources resolve through the overlay package directory
  let pkg_dir = top.path().join("package/cf");
  fs::create_dir_all(&pkg_dir).unwrap();
  fs::write(pkg_dir.join("cfg.txt"), "v1\n").unwrap();

  world(top.path()).run("cf.lua").unwrap();
  let work_copy = top.path().join("output/cf/cf/work/cfg.txt");
  assert_eq!(fs::read_to_string(&work_copy).unwrap(), "v1\n");

  let info = fs::read_to_string(top.path().join("output/cf/cf/work/.extraction.info")).unwrap();
  assert_eq!(info, format!("FileCopy cfg.txt {}\n", hash_string("v1\n")));

  fs::write(pkg_dir.join("cfg.txt"), "v2\n").unwrap();
  let w = world(top.path());
  w.run("cf.lua").unwrap();
  assert!(was_built(&w, "cf"));
  assert_eq!(fs::read_to_string(&work_copy).unwrap(), "v2\n");
}

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

#[cfg(unix)]
#[test]
fn linkgit_links_a_local_checkout_into_the_work_tree() {
  let top = TempDir::new().unwrap();
  let repo = top.path().join("srcrepo");
  fs::create_dir(&repo).unwrap();
  git_in(&repo, &["init", "-q", "-b", "main"]);
  fs::write(repo.join("tracked"), "code\n").unwrap();
  git_in(&repo, &["add", "tracked"]);
  git_in(&repo, &["commit", "-q", "-m", "initial"]);
  let head = {
    let out = Command::new("git").args(["rev-parse", "HEAD"]).current_dir(&repo).output().unwrap();
    String::from_utf8_lossy(&out.stdout).trim().to_string()
  };

  write_base(
    top.path(),
    "lg",
    r#"
local bd = builddir()
bd:fetch{method = "linkgit", uri = "./srcrepo"}
bd:cmd(".", "sh", {"-c", "test -L srcrepo && test -f srcrepo/tracked"})
bd:cmd(".", "sh", {"-c", "echo x > " .. bd.new_install .. "/x"})
"#,
  );

  let summary = world(top.path()).run("lg.lua").unwrap();
  assert_eq!(summary.built, 1);

  // a dot-prefixed uri anchors the link to the working directory
  let link = top.path().join("output/lg/lg/work/srcrepo");
  assert_eq!(fs::read_link(&link).unwrap(), top.path().join("./srcrepo"));

  // a clean tree prints an empty dirty token after the commit hash
  let info = fs::read_to_string(top.path().join("output/lg/lg/work/.extraction.info")).unwrap();
  assert_eq!(info, format!("GitDir link ./srcrepo srcrepo {head} \n"));
}

#[test]
fn thread_limit_one_still_builds_everything() {
  let top = TempDir::new().unwrap();
  write_base(
    top.path(),
    "ser",
    r#"
depend("libb")
depend("libi")
local bd = builddir()
bd:cmd(".", "sh", {"-c", "echo x > " .. bd.new_install .. "/x"})
"#,
  );
  write_recipe(top.path(), "libb", LIB_STAGING);
  write_recipe(
    top.path(),
    "libi",
    r#"
local bd = builddir()
bd:cmd(".", "sh", {"-c", "echo bin > " .. bd.new_install .. "/prog"})
"#,
  );

  let opts = WorldOpts {
    threads_limit: 1,
    ..Default::default()
  };
  let summary = World::new(top.path(), opts).run("ser.lua").unwrap();
  assert_eq!(summary.built, 3);
}
