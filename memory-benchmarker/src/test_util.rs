use crate::env::Environment;
use crate::env::RunningEnvironment;
use async_trait::async_trait;
use libmemenv::region::RegionBacking;
use libmemenv::MemEnvCfg;
use libmemenv::MemEnvError;
use libmemenv::ReadySignal;
use libmemenv::RegionInfo;
use libmemenv::ShmDirective;
use parking_lot::Mutex;
use signal_future::SignalFuture;
use signal_future::SignalFutureController;
use std::io;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::spawn;
use tokio::time::sleep;

pub const RESERVE_ERRNO: i32 = libc::ENOMEM;
pub const TEARDOWN_ERRNO: i32 = libc::EBUSY;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MockFailure {
  Start,
  Reserve,
  Teardown,
}

#[derive(Default)]
pub struct MockCalls {
  pub started: AtomicUsize,
  pub stopped: AtomicUsize,
  pub torn_down: AtomicUsize,
}

/// Pretends to reserve a region, taking `ready_delay` to become ready and `teardown_delay` to release it.
pub struct MockEnvironment {
  pub calls: Arc<MockCalls>,
  pub failure: Option<MockFailure>,
  pub ready_delay: Duration,
  pub teardown_delay: Duration,
}

impl MockEnvironment {
  pub fn new() -> Self {
    Self {
      calls: Default::default(),
      failure: None,
      ready_delay: Duration::from_millis(20),
      teardown_delay: Duration::from_millis(10),
    }
  }

  pub fn failing(failure: MockFailure) -> Self {
    Self {
      failure: Some(failure),
      ..Self::new()
    }
  }
}

impl Environment for MockEnvironment {
  fn start(
    &self,
    cfg: MemEnvCfg,
    on_ready: ReadySignal,
  ) -> Result<Box<dyn RunningEnvironment>, MemEnvError> {
    self.calls.started.fetch_add(1, Ordering::Relaxed);
    if self.failure == Some(MockFailure::Start) {
      return Err(MemEnvError::InvalidConfig("mock start failure"));
    };

    let fail_reserve = self.failure == Some(MockFailure::Reserve);
    let ready_delay = self.ready_delay;
    spawn(async move {
      sleep(ready_delay).await;
      on_ready.signal(if fail_reserve {
        Err(MemEnvError::Reserve(io::Error::from_raw_os_error(
          RESERVE_ERRNO,
        )))
      } else {
        Ok(RegionInfo {
          len: cfg.mem_size,
          backing: RegionBacking::Anonymous,
          reclaimed: matches!(cfg.shm, ShmDirective::CreateNamed(_)),
        })
      });
    });

    let (ended, stop) = SignalFuture::new();
    Ok(Box::new(MockRunning {
      calls: self.calls.clone(),
      fail_teardown: self.failure == Some(MockFailure::Teardown),
      teardown_delay: self.teardown_delay,
      stop: Mutex::new(Some(stop)),
      ended: Mutex::new(Some(ended)),
    }))
  }
}

struct MockRunning {
  calls: Arc<MockCalls>,
  fail_teardown: bool,
  teardown_delay: Duration,
  stop: Mutex<Option<SignalFutureController<i32>>>,
  ended: Mutex<Option<SignalFuture<i32>>>,
}

#[async_trait]
impl RunningEnvironment for MockRunning {
  fn stop(&self, rc: i32) {
    if let Some(stop) = self.stop.lock().take() {
      self.calls.stopped.fetch_add(1, Ordering::Relaxed);
      stop.signal(rc);
    };
  }

  async fn wait_for_end(&self) -> i32 {
    let ended = self.ended.lock().take().unwrap();
    ended.await
  }

  async fn teardown(&self) -> Result<(), MemEnvError> {
    if self.calls.torn_down.fetch_add(1, Ordering::Relaxed) > 0 {
      return Err(MemEnvError::NotRunning);
    };
    sleep(self.teardown_delay).await;
    if self.fail_teardown {
      return Err(MemEnvError::Release(io::Error::from_raw_os_error(
        TEARDOWN_ERRNO,
      )));
    };
    Ok(())
  }
}
