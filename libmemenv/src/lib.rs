use crate::region::Region;
use crate::region::RegionBacking;
use bytesize::ByteSize;
use parking_lot::Mutex;
use signal_future::SignalFuture;
use signal_future::SignalFutureController;
use std::error::Error;
use std::fmt::Display;
use std::io;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::spawn_blocking;
use tracing::info;

pub mod region;

/// How the region relates to regions created by other (possibly dead) processes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ShmDirective {
  /// Plain anonymous memory, released by the kernel when the process exits.
  None,
  /// Create the named file-backed region, or attach to it if it already exists.
  CreateNamed(i32),
  /// Attach to the named region if one exists, otherwise silently reserve fresh anonymous memory.
  AttachOrCreate(i32),
}

#[derive(Clone, Debug)]
pub struct MemEnvCfg {
  /// Prefix of the backing file name of named regions.
  pub name: String,
  /// Region size in bytes. On hugetlbfs this must be a multiple of the huge page size.
  pub mem_size: u64,
  pub shm: ShmDirective,
  /// Directory holding backing files of named regions; normally a hugetlbfs mount.
  pub hugepage_dir: PathBuf,
  /// Try MAP_HUGETLB for anonymous regions.
  pub anonymous_hugepages: bool,
  /// mlock the region once reserved.
  pub pin: bool,
}

impl MemEnvCfg {
  pub fn backing_path(&self, shm_id: i32) -> PathBuf {
    self.hugepage_dir.join(format!("{}_{}", self.name, shm_id))
  }

  fn validate(&self) -> Result<(), MemEnvError> {
    if self.mem_size == 0 {
      return Err(MemEnvError::InvalidConfig("region size must be greater than zero"));
    };
    if self.shm != ShmDirective::None && self.name.is_empty() {
      return Err(MemEnvError::InvalidConfig("named regions require a name"));
    };
    Ok(())
  }
}

#[derive(Debug)]
pub enum MemEnvError {
  InvalidConfig(&'static str),
  Reserve(io::Error),
  NotRunning,
  Release(io::Error),
}

impl MemEnvError {
  /// Nonzero status to report for this error: the OS error number where there is one.
  pub fn code(&self) -> i32 {
    match self {
      MemEnvError::Reserve(e) | MemEnvError::Release(e) => {
        e.raw_os_error().filter(|c| *c != 0).unwrap_or(1)
      }
      MemEnvError::InvalidConfig(_) | MemEnvError::NotRunning => 1,
    }
  }
}

impl Display for MemEnvError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      MemEnvError::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
      MemEnvError::Reserve(e) => write!(f, "failed to reserve region: {e}"),
      MemEnvError::NotRunning => write!(f, "environment has no region to release"),
      MemEnvError::Release(e) => write!(f, "failed to release region: {e}"),
    }
  }
}

impl Error for MemEnvError {}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RegionInfo {
  pub len: u64,
  pub backing: RegionBacking,
  /// True if an existing region was attached to instead of a new one being reserved.
  pub reclaimed: bool,
}

pub type ReadySignal = SignalFutureController<Result<RegionInfo, MemEnvError>>;

fn reserve(cfg: &MemEnvCfg) -> io::Result<Region> {
  match cfg.shm {
    ShmDirective::None => {
      Region::reserve_anonymous(cfg.mem_size, cfg.anonymous_hugepages, cfg.pin)
    }
    ShmDirective::CreateNamed(shm_id) => {
      Region::create_or_attach_file(&cfg.backing_path(shm_id), cfg.mem_size, cfg.pin)
    }
    ShmDirective::AttachOrCreate(shm_id) => {
      match Region::attach_file(&cfg.backing_path(shm_id), cfg.mem_size, cfg.pin) {
        Err(e) if e.kind() == ErrorKind::NotFound => {
          // Anonymous memory never leaves a backing file behind, so after a kill this always ends up here.
          info!(shm_id, "no existing region to attach to, reserving a fresh one");
          Region::reserve_anonymous(cfg.mem_size, cfg.anonymous_hugepages, cfg.pin)
        }
        res => res,
      }
    }
  }
}

struct State {
  region: Option<Region>,
  stop: Option<SignalFutureController<i32>>,
  ended: Option<SignalFuture<i32>>,
}

/// A started environment. Its region is reserved in the background; readiness is reported once through the signal given to `start`.
pub struct MemEnv {
  state: Arc<Mutex<State>>,
}

impl MemEnv {
  /// Returns an error immediately if `cfg` is unusable. Reservation errors are reported through `on_ready` instead.
  pub fn start(cfg: MemEnvCfg, on_ready: ReadySignal) -> Result<Self, MemEnvError> {
    cfg.validate()?;

    let (ended, stop) = SignalFuture::new();
    let state = Arc::new(Mutex::new(State {
      region: None,
      stop: Some(stop),
      ended: Some(ended),
    }));

    info!(
      name = %cfg.name,
      size = %ByteSize(cfg.mem_size),
      shm = ?cfg.shm,
      "starting memory environment",
    );
    spawn_blocking({
      let state = state.clone();
      move || {
        let res = reserve(&cfg).map_err(MemEnvError::Reserve).map(|region| {
          let info = RegionInfo {
            len: region.len(),
            backing: region.backing().clone(),
            reclaimed: region.reclaimed(),
          };
          state.lock().region = Some(region);
          info
        });
        on_ready.signal(res);
      }
    });

    Ok(Self { state })
  }

  /// Ends the run loop. Only the first call has any effect.
  pub fn stop(&self, rc: i32) {
    if let Some(stop) = self.state.lock().stop.take() {
      info!(rc, "stopping memory environment");
      stop.signal(rc);
    };
  }

  /// Resolves once `stop` has been called, with the code given to it.
  ///
  /// # Panics
  ///
  /// Panics if called more than once.
  pub async fn wait_for_end(&self) -> i32 {
    let ended = self
      .state
      .lock()
      .ended
      .take()
      .expect("wait_for_end called more than once");
    ended.await
  }

  /// Releases the region, deleting its backing file if it's file-backed.
  pub async fn teardown(&self) -> Result<(), MemEnvError> {
    let region = self
      .state
      .lock()
      .region
      .take()
      .ok_or(MemEnvError::NotRunning)?;
    let size = region.len();
    spawn_blocking(move || region.release())
      .await
      .map_err(|e| MemEnvError::Release(io::Error::new(ErrorKind::Other, e)))?
      .map_err(MemEnvError::Release)?;
    info!(size = %ByteSize(size), "released region");
    Ok(())
  }
}
