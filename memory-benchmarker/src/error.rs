use libmemenv::MemEnvError;
use std::error::Error;
use std::fmt::Display;
use std::io;

#[derive(Debug)]
pub enum BenchError {
  Usage { program: String },
  /// `--help` or `--version` was requested; not a failure.
  Help(clap::Error),
  InvalidMode(String),
  EnvironmentStart(MemEnvError),
  EnvironmentTeardown(MemEnvError),
  Output(io::Error),
}

impl BenchError {
  pub fn exit_code(&self) -> i32 {
    match self {
      BenchError::Usage { .. } | BenchError::InvalidMode(_) | BenchError::Output(_) => 1,
      BenchError::Help(e) => e.exit_code(),
      BenchError::EnvironmentStart(e) | BenchError::EnvironmentTeardown(e) => e.code(),
    }
  }
}

impl Display for BenchError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      BenchError::Usage { program } => write!(
        f,
        "Usage: {program} <alloc_free|alloc_wait|reclaim> [use_shm]"
      ),
      BenchError::Help(e) => write!(f, "{e}"),
      BenchError::InvalidMode(mode) => write!(f, "Invalid mode: {mode}"),
      BenchError::EnvironmentStart(e) => write!(f, "ERROR starting memory environment: {e}"),
      BenchError::EnvironmentTeardown(e) => {
        write!(f, "ERROR tearing down memory environment: {e}")
      }
      BenchError::Output(e) => write!(f, "failed to write results: {e}"),
    }
  }
}

impl Error for BenchError {}

impl From<io::Error> for BenchError {
  fn from(e: io::Error) -> Self {
    BenchError::Output(e)
  }
}
