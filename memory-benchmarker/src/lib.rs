use crate::env::Environment;
use crate::error::BenchError;
use crate::mode::parse_args;
use std::io::Write;
use tracing::debug;

pub mod driver;
pub mod env;
pub mod error;
pub mod mode;
#[cfg(test)]
mod test_util;

/*

# Memory benchmarker

Measures how long a large-memory environment takes to come up with its whole region reserved, how long it takes to give that region back, and how long a new process takes to reattach to a region left behind by a killed one.

Typical session comparing persistent and anonymous regions:

```
memory-benchmarker alloc_wait use_shm &   # reserve, then get killed
kill -9 %1
memory-benchmarker reclaim use_shm        # attaches to the surviving hugetlbfs file
memory-benchmarker alloc_wait &
kill -9 %1
memory-benchmarker reclaim                # anonymous memory is gone, so this is a fresh reservation
```

Each invocation performs exactly one timed run; there's no aggregation across runs.

*/

/// Parses `args`, runs the benchmark, and returns the process exit code. Result lines go to `out`, diagnostics to `err`.
pub async fn run_cli<I, T, O, E>(args: I, env: &dyn Environment, out: &mut O, err: &mut E) -> i32
where
  I: IntoIterator<Item = T>,
  T: Into<String>,
  O: Write,
  E: Write,
{
  let res = match parse_args(args) {
    Ok(cfg) => {
      debug!(mode = %cfg.mode, persistence = ?cfg.persistence, "parsed arguments");
      driver::run(env, &cfg, out).await.map(|report| report.exit_code)
    }
    Err(e) => Err(e),
  };
  match res {
    Ok(exit_code) => exit_code,
    Err(BenchError::Help(e)) => {
      let code = e.exit_code();
      let _ = write!(out, "{e}");
      code
    }
    Err(e) => {
      let _ = writeln!(err, "{e}");
      e.exit_code()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::run_cli;
  use crate::test_util::MockEnvironment;
  use std::sync::atomic::Ordering;

  async fn invoke(env: &MockEnvironment, args: &[&str]) -> (i32, String, String) {
    let mut out = Vec::new();
    let mut err = Vec::new();
    let argv = std::iter::once("memory-benchmarker").chain(args.iter().copied());
    let code = run_cli(argv, env, &mut out, &mut err).await;
    (
      code,
      String::from_utf8(out).unwrap(),
      String::from_utf8(err).unwrap(),
    )
  }

  #[tokio::test]
  async fn test_alloc_free_end_to_end() {
    let env = MockEnvironment::new();
    let (code, out, err) = invoke(&env, &["alloc_free"]).await;
    assert_eq!(code, 0);
    assert!(err.is_empty());
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("Time to initialize "));
    assert!(lines[1].starts_with("Time to free "));
  }

  #[tokio::test]
  async fn test_reclaim_with_shm_end_to_end() {
    let env = MockEnvironment::new();
    let (code, out, err) = invoke(&env, &["reclaim", "use_shm"]).await;
    assert_eq!(code, 0);
    assert!(err.is_empty());
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("Time to reclaim "));
    assert_eq!(env.calls.torn_down.load(Ordering::Relaxed), 1);
  }

  #[tokio::test]
  async fn test_no_arguments_prints_usage_without_touching_environment() {
    let env = MockEnvironment::new();
    let (code, out, err) = invoke(&env, &[]).await;
    assert_eq!(code, 1);
    assert!(out.is_empty());
    assert_eq!(
      err,
      "Usage: memory-benchmarker <alloc_free|alloc_wait|reclaim> [use_shm]\n"
    );
    assert_eq!(env.calls.started.load(Ordering::Relaxed), 0);
  }

  #[tokio::test]
  async fn test_invalid_mode_prints_token() {
    let env = MockEnvironment::new();
    let (code, out, err) = invoke(&env, &["alloc"]).await;
    assert_eq!(code, 1);
    assert!(out.is_empty());
    assert_eq!(err, "Invalid mode: alloc\n");
    assert_eq!(env.calls.started.load(Ordering::Relaxed), 0);
  }

  #[tokio::test]
  async fn test_flag_like_mode_is_invalid_not_usage() {
    let env = MockEnvironment::new();
    let (code, out, err) = invoke(&env, &["-x"]).await;
    assert_eq!(code, 1);
    assert!(out.is_empty());
    assert_eq!(err, "Invalid mode: -x\n");
    assert_eq!(env.calls.started.load(Ordering::Relaxed), 0);
  }

  #[tokio::test]
  async fn test_odd_shm_token_and_extra_arguments_still_run() {
    let env = MockEnvironment::new();
    let (code, out, err) = invoke(&env, &["alloc_free", "-shm"]).await;
    assert_eq!(code, 0);
    assert!(err.is_empty());
    assert_eq!(out.lines().count(), 2);

    let env = MockEnvironment::new();
    let (code, out, err) = invoke(&env, &["reclaim", "use_shm", "extra"]).await;
    assert_eq!(code, 0);
    assert!(err.is_empty());
    assert!(out.starts_with("Time to reclaim "));
    assert_eq!(env.calls.torn_down.load(Ordering::Relaxed), 1);
  }

  #[tokio::test]
  async fn test_help_is_not_an_error() {
    let env = MockEnvironment::new();
    let (code, out, err) = invoke(&env, &["--help"]).await;
    assert_eq!(code, 0);
    assert!(out.contains("--hugepage-dir"));
    assert!(err.is_empty());
  }
}
