//! Subprocess execution for package builds.
//!
//! A [`PackageCmd`] captures a single invocation: working directory,
//! program, arguments, extra environment, and whether its output should
//! land in the package's build log. Fetch, extraction, and build steps
//! all funnel through [`PackageCmd::run`].

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CmdError {
  #[error("failed to spawn {program}: {source}")]
  Spawn {
    program: String,
    #[source]
    source: io::Error,
  },

  #[error("{program} exited with status {code:?}")]
  Failed { program: String, code: Option<i32> },

  #[error("io error: {0}")]
  Io(#[from] io::Error),
}

/// Sink for engine messages and command output belonging to one package.
///
/// Lines go to the package's `build.log` and, at debug level, to the
/// process-wide trace output.
#[derive(Debug)]
pub struct Logger {
  prefix: String,
  file: Option<Mutex<File>>,
}

impl Logger {
  /// A logger appending to the file at `path`. Open failures are
  /// tolerated; the log is best-effort.
  pub fn new(prefix: &str, path: &Path) -> Self {
    let file = OpenOptions::new().create(true).append(true).open(path).ok();
    Self {
      prefix: prefix.to_string(),
      file: file.map(Mutex::new),
    }
  }

  /// A logger with no backing file, for contexts that only want trace
  /// output (tests, parse-only runs).
  pub fn sink(prefix: &str) -> Self {
    Self {
      prefix: prefix.to_string(),
      file: None,
    }
  }

  pub fn log(&self, message: &str) {
    debug!(package = %self.prefix, "{message}");
    if let Some(file) = &self.file {
      let mut file = file.lock().unwrap();
      let _ = writeln!(file, "{}: {message}", self.prefix);
    }
  }
}

/// One subprocess invocation within a package build.
#[derive(Debug, Clone)]
pub struct PackageCmd {
  cwd: PathBuf,
  program: String,
  args: Vec<String>,
  env: Vec<(String, String)>,
  log_output: bool,
}

impl PackageCmd {
  /// `cwd` may be relative; it is resolved against the run's working
  /// directory at execution time.
  pub fn new(cwd: impl Into<PathBuf>, program: &str) -> Self {
    Self {
      cwd: cwd.into(),
      program: program.to_string(),
      args: Vec::new(),
      env: Vec::new(),
      log_output: true,
    }
  }

  pub fn add_arg(&mut self, arg: impl Into<String>) {
    self.args.push(arg.into());
  }

  pub fn add_env(&mut self, key: &str, value: &str) {
    self.env.push((key.to_string(), value.to_string()));
  }

  pub fn disable_logging(&mut self) {
    self.log_output = false;
  }

  pub fn program(&self) -> &str {
    &self.program
  }

  /// Run the command to completion, streaming its output line-by-line
  /// into `logger`. The child inherits the process environment plus the
  /// explicitly appended variables, nothing else.
  pub fn run(&self, pwd: &Path, logger: &Logger) -> Result<(), CmdError> {
    let cwd = if self.cwd.is_absolute() {
      self.cwd.clone()
    } else {
      pwd.join(&self.cwd)
    };

    debug!(program = %self.program, args = ?self.args, cwd = %cwd.display(), "running");

    let mut command = Command::new(&self.program);
    command
      .args(&self.args)
      .current_dir(&cwd)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped());
    for (key, value) in &self.env {
      command.env(key, value);
    }

    let mut child = command.spawn().map_err(|source| CmdError::Spawn {
      program: self.program.clone(),
      source,
    })?;

    // Both pipes have to be drained regardless of the log flag or a
    // chatty child deadlocks on a full pipe.
    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");
    std::thread::scope(|scope| {
      scope.spawn(|| drain(stderr, logger, self.log_output));
      drain(stdout, logger, self.log_output);
    });

    let status = child.wait()?;
    if !status.success() {
      self.print_cmd(logger);
      return Err(CmdError::Failed {
        program: self.program.clone(),
        code: status.code(),
      });
    }
    Ok(())
  }

  /// Dump the full invocation into the log, for post-mortems of failed
  /// commands.
  fn print_cmd(&self, logger: &Logger) {
    warn!(program = %self.program, cwd = %self.cwd.display(), "command failed");
    logger.log(&format!("Path: {}", self.cwd.display()));
    logger.log(&format!("Program: {}", self.program));
    for (i, arg) in self.args.iter().enumerate() {
      logger.log(&format!("Arg[{i}] = '{arg}'"));
    }
  }
}

fn drain(pipe: impl io::Read, logger: &Logger, log_output: bool) {
  let reader = BufReader::new(pipe);
  for line in reader.lines() {
    match line {
      Ok(line) => {
        if log_output {
          logger.log(&line);
        }
      }
      Err(_) => break,
    }
  }
}
