use crate::env::Environment;
use crate::env::RunningEnvironment;
use crate::error::BenchError;
use crate::mode::BenchCfg;
use crate::mode::RunMode;
use crate::mode::REGION_SIZE_MIB;
use bytesize::ByteSize;
use signal_future::SignalFuture;
use std::convert::Infallible;
use std::future::pending;
use std::io::Write;
use std::time::Duration;
use std::time::Instant;
use tracing::info;

/*

# Timing protocol

Run states: configuring -> awaiting ready -> (waiting | stopping -> tearing down -> exiting).

- T0 is taken immediately before asking the environment to start, and T1 as soon as the readiness signal resolves. Waiting for readiness is the only suspension point.
- In wait mode, the process then parks forever and is expected to be killed externally, so there's no teardown to measure.
- Otherwise the environment is stopped, its run loop is awaited, and the region is torn down. Only alloc_free times the teardown (T2 to T3); reclaim tears down untimed, as only its attach latency matters.

*/

/// Two monotonic readings bracketing one measured interval.
#[derive(Clone, Copy, Debug)]
pub struct TimestampPair {
  pub start: Instant,
  pub end: Instant,
}

impl TimestampPair {
  pub fn elapsed(&self) -> Duration {
    self.end.saturating_duration_since(self.start)
  }
}

#[derive(Debug)]
pub struct RunReport {
  pub init: TimestampPair,
  /// Only measured in alloc_free mode.
  pub free: Option<TimestampPair>,
  pub exit_code: i32,
}

/// Terminal state of alloc_wait mode. Holds the environment so that the region stays reserved until the process is killed.
async fn wait_to_be_killed(_env: Box<dyn RunningEnvironment>) -> Infallible {
  pending().await
}

/// Runs one benchmark to completion, writing result lines to `out`. Never resolves in alloc_wait mode.
pub async fn run<W: Write>(
  env: &dyn Environment,
  cfg: &BenchCfg,
  out: &mut W,
) -> Result<RunReport, BenchError> {
  let env_cfg = cfg.env_cfg();
  let (ready, on_ready) = SignalFuture::new();

  let t0 = Instant::now();
  let running = env
    .start(env_cfg, on_ready)
    .map_err(BenchError::EnvironmentStart)?;
  let region = ready.await;
  let t1 = Instant::now();
  let region = region.map_err(BenchError::EnvironmentStart)?;

  let init = TimestampPair { start: t0, end: t1 };
  let init_secs = init.elapsed().as_secs_f64();
  info!(
    mode = %cfg.mode,
    init_secs,
    size = %ByteSize(region.len),
    reclaimed = region.reclaimed,
    "environment ready",
  );
  match cfg.mode {
    RunMode::AllocAndFree | RunMode::AllocAndWait => writeln!(
      out,
      "Time to initialize memory environment with {}GB memory: {:.6} seconds",
      REGION_SIZE_MIB / 1024,
      init_secs
    )?,
    RunMode::Reclaim => writeln!(
      out,
      "Time to reclaim memory environment memory: {:.6} seconds",
      init_secs
    )?,
  };

  let timed_teardown = match cfg.mode {
    RunMode::AllocAndWait => {
      writeln!(out, "Memory environment initialized. Waiting to be killed...")?;
      out.flush()?;
      match wait_to_be_killed(running).await {}
    }
    RunMode::AllocAndFree => true,
    RunMode::Reclaim => false,
  };

  running.stop(0);
  let exit_code = running.wait_for_end().await;
  info!(exit_code, "environment run loop ended");

  let free = if timed_teardown {
    let t2 = Instant::now();
    running
      .teardown()
      .await
      .map_err(BenchError::EnvironmentTeardown)?;
    let t3 = Instant::now();
    let free = TimestampPair { start: t2, end: t3 };
    writeln!(
      out,
      "Time to free memory environment memory: {:.6} seconds",
      free.elapsed().as_secs_f64()
    )?;
    Some(free)
  } else {
    running
      .teardown()
      .await
      .map_err(BenchError::EnvironmentTeardown)?;
    None
  };
  out.flush()?;

  Ok(RunReport {
    init,
    free,
    exit_code,
  })
}
