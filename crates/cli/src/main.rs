//! bake-cli: the `bake` command.
//!
//! `bake <target>.lua [feature=value ...]` evaluates the target recipe
//! and builds every package it (transitively) depends on.

use std::collections::HashSet;
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use owo_colors::OwoColorize;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use bake_lib::{World, WorldOpts};

#[derive(Parser)]
#[command(name = "bake")]
#[command(author, version, about = "Declarative package builds scripted in Lua")]
struct Cli {
  /// The target recipe file (its stem names the base package and
  /// output namespace)
  file: String,

  /// Feature assignments, key=value
  features: Vec<String>,

  /// Stop after evaluating all recipes
  #[arg(long)]
  parse_only: bool,

  /// Keep building unaffected packages after a failure
  #[arg(long)]
  keep_going: bool,

  /// Only fetch sources, build nothing
  #[arg(long)]
  fetch_only: bool,

  /// Worker thread limit (0 = unlimited)
  #[arg(short = 'j', long, default_value_t = 0)]
  threads: usize,

  /// Wipe package work trees before building
  #[arg(long)]
  clean: bool,

  /// Keep composed staging trees after building
  #[arg(long)]
  keep_staging: bool,

  /// Build only this package, suppressing the rest (repeatable)
  #[arg(long = "force-build", value_name = "PACKAGE")]
  force_build: Vec<String>,

  /// Base URL of a remote build cache
  #[arg(long, value_name = "URL")]
  fetch_from: Option<String>,

  /// Omit this feature from build-info fingerprints (repeatable)
  #[arg(long = "ignore-feature", value_name = "KEY")]
  ignore_feature: Vec<String>,

  /// Extra overlay root, searched before the working directory
  /// (repeatable)
  #[arg(long, value_name = "PATH")]
  overlay: Vec<String>,

  /// git mirror hook: clone with --reference-if-able when the remote
  /// matches PREFIX (repeatable)
  #[arg(long = "reference-if-able", value_name = "PREFIX,REPLACEMENT")]
  reference_if_able: Vec<String>,

  /// Enable verbose output
  #[arg(short, long)]
  verbose: bool,
}

fn run(cli: Cli) -> Result<()> {
  let mut ref_patterns = Vec::new();
  for pattern in &cli.reference_if_able {
    let (prefix, replacement) = pattern
      .split_once(',')
      .ok_or_else(|| anyhow!("--reference-if-able takes PREFIX,REPLACEMENT"))?;
    ref_patterns.push((prefix.to_string(), replacement.to_string()));
  }

  let opts = WorldOpts {
    parse_only: cli.parse_only,
    keep_going: cli.keep_going,
    fetch_only: cli.fetch_only,
    threads_limit: cli.threads,
    clean_packages: cli.clean,
    keep_staging: cli.keep_staging,
    forced: cli.force_build,
    fetch_from: cli.fetch_from,
    ignored_features: cli.ignore_feature.into_iter().collect::<HashSet<_>>(),
    ref_patterns,
  };

  let pwd = std::env::current_dir().context("cannot determine working directory")?;
  let world = World::new(&pwd, opts);

  for overlay in &cli.overlay {
    world.overlays().add(overlay, false);
  }
  for feature in &cli.features {
    world
      .features()
      .set_from_arg(feature)
      .map_err(|_| anyhow!("features must be described as feature=value: {feature}"))?;
  }

  let started = Instant::now();
  let summary = world.run(&cli.file)?;
  let elapsed = started.elapsed().as_secs();

  if cli.parse_only {
    println!("{} {} package(s) parsed", "ok:".green().bold(), summary.packages);
  } else {
    println!(
      "{} {} package(s), {} built, {}s",
      "ok:".green().bold(),
      summary.packages,
      summary.built,
      elapsed
    );
  }
  Ok(())
}

fn main() -> ExitCode {
  let cli = Cli::parse();

  let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
  let subscriber = FmtSubscriber::builder()
    .with_max_level(level)
    .with_writer(std::io::stderr)
    .finish();
  let _ = tracing::subscriber::set_global_default(subscriber);

  match run(cli) {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      eprintln!("{} {err:#}", "error:".red().bold());
      ExitCode::FAILURE
    }
  }
}
