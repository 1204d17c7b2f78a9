use async_trait::async_trait;
use libmemenv::MemEnv;
use libmemenv::MemEnvCfg;
use libmemenv::MemEnvError;
use libmemenv::ReadySignal;

/// The memory-environment runtime, as far as the benchmark is concerned. Using a trait here lets tests run the full timing protocol without reserving gigabytes.
pub trait Environment: Send + Sync {
  /// Begins reserving the region. `on_ready` must be signalled exactly once, when the region is usable or reservation has failed.
  fn start(
    &self,
    cfg: MemEnvCfg,
    on_ready: ReadySignal,
  ) -> Result<Box<dyn RunningEnvironment>, MemEnvError>;
}

#[async_trait]
pub trait RunningEnvironment: Send + Sync {
  fn stop(&self, rc: i32);

  /// Resolves with the code given to `stop`.
  async fn wait_for_end(&self) -> i32;

  /// Called at most once.
  async fn teardown(&self) -> Result<(), MemEnvError>;
}

pub struct MemEnvProvider;

impl Environment for MemEnvProvider {
  fn start(
    &self,
    cfg: MemEnvCfg,
    on_ready: ReadySignal,
  ) -> Result<Box<dyn RunningEnvironment>, MemEnvError> {
    Ok(Box::new(MemEnv::start(cfg, on_ready)?))
  }
}

#[async_trait]
impl RunningEnvironment for MemEnv {
  fn stop(&self, rc: i32) {
    MemEnv::stop(self, rc);
  }

  async fn wait_for_end(&self) -> i32 {
    MemEnv::wait_for_end(self).await
  }

  async fn teardown(&self) -> Result<(), MemEnvError> {
    MemEnv::teardown(self).await
  }
}
