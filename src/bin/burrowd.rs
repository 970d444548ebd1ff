//! Daemon entry point: flag parsing, logging, signal handling and the
//! init/stop lifecycle.

use burrow::config::DaemonConfig;
use burrow::daemon::{Daemon, ShutdownSignal};
use burrow::os::Os;
use clap::Parser;
use env_logger::Env;
use log::{error, info, warn};
use nix::sys::signal::{SigSet, Signal};
use std::process::ExitCode;
use std::sync::mpsc;
use std::time::Duration;

const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Parser, Debug)]
#[command(name = "burrowd", about = "burrow node daemon")]
struct Cli {
    /// Directory holding daemon state
    #[arg(long, default_value = "/var/lib/burrow")]
    var_dir: String,

    /// Group allowed to talk to the local unix socket
    #[arg(long)]
    group: Option<String>,

    /// Sub-systems to trace (repeatable, e.g. --trace raft)
    #[arg(long)]
    trace: Vec<String>,

    /// Expected cluster latency multiplier
    #[arg(long, default_value_t = 3.0)]
    raft_latency: f64,

    /// How long to wait for the cluster database, in seconds
    #[arg(long, default_value_t = 36 * 60 * 60)]
    cluster_db_timeout: u64,

    /// env_logger-style filter string; overrides RUST_LOG
    #[arg(long)]
    log_filter: Option<String>,

    /// Enable verbose request logging
    #[arg(long)]
    debug: bool,

    /// Mock mode: skip privileged setup (testing only)
    #[arg(long, hide = true)]
    mock: bool,
}

fn init_logging(cli: &Cli) {
    let env = Env::default().default_filter_or(DEFAULT_LOG_FILTER);
    let mut builder = env_logger::Builder::from_env(env);
    if let Some(filter) = &cli.log_filter {
        builder.parse_filters(filter);
    }
    builder.init();
}

fn shutdown_signal_set() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set.add(Signal::SIGPWR);
    set
}

/// Waits for shutdown-worthy signals on a dedicated thread and forwards
/// them into the daemon's shutdown channel. The signals must already be
/// blocked process-wide (done in main, before any thread spawns, so the
/// mask is inherited everywhere).
fn spawn_signal_listener(sender: mpsc::Sender<ShutdownSignal>) {
    std::thread::spawn(move || {
        let set = shutdown_signal_set();
        loop {
            match set.wait() {
                Ok(Signal::SIGINT) => {
                    let _ = sender.send(ShutdownSignal::Interrupt);
                }
                Ok(Signal::SIGTERM) => {
                    let _ = sender.send(ShutdownSignal::Terminate);
                }
                Ok(Signal::SIGPWR) => {
                    let _ = sender.send(ShutdownSignal::PowerFailure);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("event=signal_wait_failed error={err}");
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        }
    });
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    if let Err(err) = shutdown_signal_set().thread_block() {
        warn!("event=signal_mask_failed error={err}");
    }

    let config = DaemonConfig {
        group: cli.group.clone(),
        trace: cli.trace.clone(),
        raft_latency: cli.raft_latency,
        cluster_db_setup_timeout: Duration::from_secs(cli.cluster_db_timeout),
    };
    let os = Os::new(&cli.var_dir, cli.mock);
    let daemon = Daemon::new(config, os);
    daemon.set_debug(cli.debug);

    let (sender, receiver) = mpsc::channel();
    daemon.set_shutdown_channel(sender.clone());
    spawn_signal_listener(sender);

    if let Err(err) = daemon.start() {
        error!("event=daemon_init_failed error={err}");
        return ExitCode::FAILURE;
    }

    // Block until a signal or an API shutdown request arrives, then run the
    // stop sequence once.
    let signal = receiver.recv().unwrap_or(ShutdownSignal::Terminate);
    info!("event=daemon_signal signal={signal}");
    match daemon.stop(signal) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("event=daemon_stop_failed error={err}");
            ExitCode::FAILURE
        }
    }
}
