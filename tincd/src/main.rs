// SPDX-License-Identifier: MIT

use clap::Parser;
use daemon::Daemonize;
use std::path::PathBuf;
use std::process::ExitCode;
use tincd::config::Config;
use tincd::crypto::PlaceholderCipher;
use tincd::dataplane::NullDataPlane;
use tincd::error::DaemonError;
use tincd::mainloop::MainLoop;
use tincd::names::{self, NetIdentity, DEFAULT_CONFDIR, DEFAULT_RUNDIR};
use tincd::state::DaemonState;

/// A peer-to-peer mesh VPN daemon: process lifecycle, control-plane mesh, and
/// administration. See `tincd --help` for options; cryptography and packet
/// forwarding are provided by collaborators linked in separately.
#[derive(Parser, Debug)]
#[clap(version, about)]
struct Args {
    #[clap(flatten)]
    daemonize: Daemonize,

    /// Configuration directory (default: /etc/tinc)
    #[clap(short = 'c', long = "config", value_name = "FILE")]
    confdir: Option<PathBuf>,

    /// Name of the net to use, if more than one is configured
    #[clap(short = 'n', long = "net", value_name = "NETNAME")]
    net_name: Option<String>,

    /// Increase debug level; may be repeated
    #[clap(short = 'd', action = clap::ArgAction::Count)]
    debug: u8,

    /// Kill a running tincd for this net and exit
    #[clap(short = 'k', long = "kill")]
    kill: bool,

    /// PING interval, in seconds
    #[clap(short = 't', long = "timeout", value_name = "SECONDS")]
    ping_interval: Option<u64>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let identity = NetIdentity::new(
        args.net_name.clone(),
        args.confdir.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_CONFDIR)),
        PathBuf::from(DEFAULT_RUNDIR),
    );

    tincd::logging::init(&identity, debug_level_to_filter(args.debug));

    if args.kill {
        return match names::kill_other(&identity) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("{e:#}");
                ExitCode::from(1)
            }
        };
    }

    match run(args, identity) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, checkpoint = %tincd::checkpoint!(), "fatal error, exiting");
            ExitCode::from(1)
        }
    }
}

fn debug_level_to_filter(level: u8) -> tracing::Level {
    match level {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    }
}

fn run(args: Args, identity: NetIdentity) -> Result<(), DaemonError> {
    let original_argv: Vec<std::ffi::OsString> = std::env::args_os().collect();

    // `Daemonize::run` forks when `--detach`/`--monitor` is requested: the process
    // that returns from it here is the surviving daemon, not whichever process ran
    // `main` first. Everything that records *this* process's pid — the pidfile, the
    // crash handler's re-exec state — must be set up after this call returns, or it
    // ends up describing the process that already called `exit(0)`.
    let _cleanup = unsafe { args.daemonize.run() };

    let pid_path = names::acquire_pid_lock(&identity)
        .map_err(|e| DaemonError::Fatal(format!("{e:#}")))?;
    tracing::info!(path = %pid_path.display(), "pidfile acquired");

    unsafe {
        tincd::crash::install(&identity, &original_argv)
            .map_err(|e| DaemonError::Fatal(format!("could not install crash handler: {e}")))?;
    }

    let mut config = Config::load(&identity.config_base_dir(), args.net_name.clone())?;
    if let Some(secs) = args.ping_interval {
        config.ping_interval = std::time::Duration::from_secs(secs);
    }

    let supervisor_pid = if args.daemonize.monitor {
        Some(unsafe { libc::getppid() })
    } else {
        None
    };
    let state = DaemonState::new(args.debug, args.daemonize.detach, original_argv, supervisor_pid);

    let self_name = identity
        .net_name
        .clone()
        .unwrap_or_else(|| "tincd".to_string());
    let control_socket_path = identity.pid_file().with_extension("control");

    let mut main_loop = MainLoop::new(
        self_name,
        config,
        identity.clone(),
        control_socket_path,
        Box::new(PlaceholderCipher),
        Box::new(NullDataPlane::default()),
        state,
    )?;

    main_loop.run()?;
    tincd::crash::clear_second_strike();
    Ok(())
}
