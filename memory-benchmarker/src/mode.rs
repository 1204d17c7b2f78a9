use crate::error::BenchError;
use clap::Parser;
use libmemenv::MemEnvCfg;
use libmemenv::ShmDirective;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

/// The region size reserved by every run, in MiB.
pub const REGION_SIZE_MIB: u64 = 6 * 1024;
/// Identifier of the persistent region. Fixed so that a later run can find what an earlier, killed run left behind.
pub const SHM_ID: i32 = 1;
/// Identifier used when attempting to reattach to anonymous memory.
pub const ANONYMOUS_SHM_ID: i32 = -1;
pub const DEFAULT_REGION_NAME: &str = "memory_benchmark";
pub const DEFAULT_HUGEPAGE_DIR: &str = "/dev/hugepages";
pub const USE_SHM_TOKEN: &str = "use_shm";

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum RunMode {
  AllocAndFree,
  AllocAndWait,
  Reclaim,
}

impl FromStr for RunMode {
  type Err = BenchError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "alloc_free" => Ok(RunMode::AllocAndFree),
      "alloc_wait" => Ok(RunMode::AllocAndWait),
      "reclaim" => Ok(RunMode::Reclaim),
      _ => Err(BenchError::InvalidMode(s.to_string())),
    }
  }
}

impl Display for RunMode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      RunMode::AllocAndFree => "alloc_free",
      RunMode::AllocAndWait => "alloc_wait",
      RunMode::Reclaim => "reclaim",
    })
  }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AttachMode {
  CreateNew,
  AttemptAttachElseCreate,
  NotApplicable,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PersistenceCfg {
  pub use_shared_memory: bool,
  pub attach_mode: AttachMode,
}

impl PersistenceCfg {
  pub fn new(mode: RunMode, use_shm: bool) -> Self {
    let attach_mode = if use_shm {
      AttachMode::CreateNew
    } else if mode == RunMode::Reclaim {
      // Anonymous memory is gone once its owner is killed, so this attach is expected to fail and fall back to a fresh reservation.
      AttachMode::AttemptAttachElseCreate
    } else {
      AttachMode::NotApplicable
    };
    Self {
      use_shared_memory: use_shm,
      attach_mode,
    }
  }

  pub fn directive(&self) -> ShmDirective {
    match self.attach_mode {
      // The runtime creates the named region, or attaches to it if it survived a previous run.
      AttachMode::CreateNew => ShmDirective::CreateNamed(SHM_ID),
      AttachMode::AttemptAttachElseCreate => ShmDirective::AttachOrCreate(ANONYMOUS_SHM_ID),
      AttachMode::NotApplicable => ShmDirective::None,
    }
  }
}

/// Options, which follow the positional tokens. The positional tokens are taken off the front of the arguments before clap sees them, so only the trailing ones that are ignored end up here.
#[derive(Debug, Parser)]
#[command(
  author,
  version,
  about,
  long_about = None,
  override_usage = "memory-benchmarker <alloc_free|alloc_wait|reclaim> [use_shm] [OPTIONS]",
  after_help = "Pass use_shm after the mode to back the region with a persistent file on hugetlbfs."
)]
struct Cli {
  #[arg(hide = true)]
  _ignored: Vec<String>,

  /// Name of the persistent region.
  #[arg(long, default_value = DEFAULT_REGION_NAME)]
  name: String,

  /// Directory for persistent region files, normally a hugetlbfs mount.
  #[arg(long, default_value = DEFAULT_HUGEPAGE_DIR)]
  hugepage_dir: PathBuf,

  /// Try to back anonymous regions with huge pages.
  #[arg(long)]
  anonymous_hugepages: bool,

  /// Don't mlock the region.
  #[arg(long)]
  no_pin: bool,
}

const HELP_FLAGS: [&str; 4] = ["-h", "--help", "-V", "--version"];

fn parse_options(program: &str, options: &[String]) -> Result<Cli, BenchError> {
  let argv = std::iter::once(program).chain(options.iter().map(String::as_str));
  Cli::try_parse_from(argv).map_err(|e| match e.kind() {
    clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
      BenchError::Help(e)
    }
    _ => BenchError::Usage {
      program: program.to_string(),
    },
  })
}

/// Fixed for the whole process once parsed.
#[derive(Clone, Debug)]
pub struct BenchCfg {
  pub mode: RunMode,
  pub persistence: PersistenceCfg,
  pub name: String,
  pub hugepage_dir: PathBuf,
  pub anonymous_hugepages: bool,
  pub pin: bool,
  /// Always `REGION_SIZE_MIB` MiB when parsed from arguments.
  pub region_size: u64,
}

impl BenchCfg {
  pub fn new(mode: RunMode, use_shm: bool) -> Self {
    Self {
      mode,
      persistence: PersistenceCfg::new(mode, use_shm),
      name: DEFAULT_REGION_NAME.to_string(),
      hugepage_dir: PathBuf::from(DEFAULT_HUGEPAGE_DIR),
      anonymous_hugepages: false,
      pin: true,
      region_size: REGION_SIZE_MIB * 1024 * 1024,
    }
  }

  pub fn env_cfg(&self) -> MemEnvCfg {
    MemEnvCfg {
      name: self.name.clone(),
      mem_size: self.region_size,
      shm: self.persistence.directive(),
      hugepage_dir: self.hugepage_dir.clone(),
      anonymous_hugepages: self.anonymous_hugepages,
      pin: self.pin,
    }
  }
}

/// `args` includes the program name, as with `std::env::args`.
///
/// The first argument is always the mode and the second, unless it starts with `--`, is the shm token; both are taken verbatim, so `-x` is an invalid mode and `-shm` simply means no shm. Options follow them, and any further positional arguments are ignored.
pub fn parse_args<I, T>(args: I) -> Result<BenchCfg, BenchError>
where
  I: IntoIterator<Item = T>,
  T: Into<String>,
{
  let args: Vec<String> = args.into_iter().map(Into::into).collect();
  let program = args
    .first()
    .cloned()
    .unwrap_or_else(|| "memory-benchmarker".to_string());

  let Some(mode_token) = args.get(1) else {
    return Err(BenchError::Usage { program });
  };
  if HELP_FLAGS.contains(&mode_token.as_str()) {
    // Always an error carrying the help or version text.
    parse_options(&program, &args[1..])?;
  };
  let mode: RunMode = mode_token.parse()?;

  let (shm, options) = match args.get(2) {
    Some(token) if !token.starts_with("--") && !HELP_FLAGS.contains(&token.as_str()) => {
      (Some(token.as_str()), &args[3..])
    }
    _ => (None, &args[2..]),
  };
  let cli = parse_options(&program, options)?;

  let use_shm = shm == Some(USE_SHM_TOKEN);
  Ok(BenchCfg {
    name: cli.name,
    hugepage_dir: cli.hugepage_dir,
    anonymous_hugepages: cli.anonymous_hugepages,
    pin: !cli.no_pin,
    ..BenchCfg::new(mode, use_shm)
  })
}
