//! joblet — entry point
//!
//! One binary, two lives. Normally it is the daemon; re-invoked inside a
//! job's namespaces with `JOBLET_MODE=init` the same binary takes the
//! init branch instead, before any CLI parsing. Tracing goes to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "joblet")]
#[command(about = "Run user-submitted commands as isolated jobs", long_about = None)]
struct Cli {
    /// Path to the daemon configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    // The in-namespace branch must not touch the CLI: the init runs with
    // argv it does not own and an environment that is the whole contract.
    if joblet::init::is_init_invocation() {
        run_init();
    }

    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    if let Err(e) = run_daemon(cli) {
        eprintln!("joblet: {e:#}");
        std::process::exit(1);
    }
}

fn run_daemon(cli: Cli) -> Result<()> {
    let config = joblet::config::JobletConfig::load(cli.config.as_deref())?;

    #[cfg(target_os = "linux")]
    let platform: Arc<dyn joblet::platform::Platform> =
        Arc::new(joblet::platform::LinuxPlatform::new());
    #[cfg(not(target_os = "linux"))]
    let platform: Arc<dyn joblet::platform::Platform> = Arc::new(joblet::platform::StubPlatform);

    let daemon = joblet::joblet::Joblet::new(platform, config)
        .map_err(|e| anyhow::anyhow!("daemon init: {e}"))?;
    daemon.start();
    tracing::info!("joblet daemon running");

    // The gRPC surface lives outside this crate; the daemon parks until
    // it is killed.
    loop {
        std::thread::park();
    }
}

fn run_init() -> ! {
    #[cfg(target_os = "linux")]
    {
        match joblet::init::run() {
            // exec replaced the image; reaching Ok is impossible.
            Ok(never) => match never {},
            Err(e) => {
                eprintln!("joblet-init: {e:#}");
                std::process::exit(125);
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        eprintln!("joblet-init: isolated execution requires Linux");
        std::process::exit(125);
    }
}
