use memory_benchmarker::env::MemEnvProvider;
use memory_benchmarker::run_cli;
use std::env;
use std::io::stderr;
use std::io::stdout;
use std::process::exit;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
  // Stdout carries only the result lines, so logs go to stderr and stay quiet unless RUST_LOG asks otherwise.
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
    .with_writer(stderr)
    .init();

  let code = run_cli(env::args(), &MemEnvProvider, &mut stdout(), &mut stderr()).await;
  exit(code);
}
