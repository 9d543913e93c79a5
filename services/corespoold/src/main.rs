//! The crash-dump collection daemon. Wires configuration, the pidfile and
//! daemonization around the `coffer` engine, sheds authority, then hands
//! control to the event loop.

mod config;
mod pidfile;

use clap::{App, Arg};
use coffer::gate::Gate;
use coffer::handler;
use coffer::net::dispenser::Dispenser;
use coffer::net::endpoint::Endpoint;
use coffer::resolve::Resolver;
use coffer::spool::Spool;
use config::DaemonConfig;
use nix::errno::Errno;
use nix::unistd::{self, AccessFlags};
use pidfile::Pidfile;
use std::fs::File;
use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process;
use strata::logging::{self, Logger};

fn main() {
    process::exit(run());
}

fn run() -> i32 {
    let matches = App::new("corespoold")
        .version("0.1.0")
        .about("Collects kernel crash dumps transmitted over the network.")
        .arg(
            Arg::with_name("bind")
                .short("a")
                .value_name("IP")
                .takes_value(true)
                .help("Address to listen on (default: all interfaces)"),
        )
        .arg(
            Arg::with_name("dumpdir")
                .short("d")
                .value_name("DIR")
                .takes_value(true)
                .help("Directory dumps are spooled under (default: /var/crash)"),
        )
        .arg(
            Arg::with_name("script")
                .short("i")
                .value_name("SCRIPT")
                .takes_value(true)
                .help("Program run once per finished, failed or timed-out dump"),
        )
        .arg(
            Arg::with_name("pidfile")
                .short("P")
                .value_name("FILE")
                .takes_value(true)
                .help("Pidfile location"),
        )
        .arg(
            Arg::with_name("debug")
                .short("D")
                .help("Stay in the foreground and log to stderr"),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .value_name("FILE")
                .takes_value(true)
                .help("Configuration file"),
        )
        .get_matches();

    let mut config = match matches.value_of("config") {
        Some(path) => match DaemonConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("corespoold: cannot load {}: {}", path, err);
                return 1;
            }
        },
        None => DaemonConfig::default(),
    };

    if let Some(value) = matches.value_of("bind") {
        config.server.bind_address = match value.parse::<Ipv4Addr>() {
            Ok(ip) => ip,
            Err(_) => {
                eprintln!("corespoold: invalid bind IP specified");
                return 1;
            }
        };
    }
    if let Some(value) = matches.value_of("dumpdir") {
        config.server.dumpdir = PathBuf::from(value);
    }
    if let Some(value) = matches.value_of("script") {
        config.server.handler_script = Some(PathBuf::from(value));
    }
    if let Some(value) = matches.value_of("pidfile") {
        config.server.pidfile = Some(PathBuf::from(value));
    }
    let debug = matches.is_present("debug");

    match serve(config, debug) {
        Ok(()) => 0,
        Err(err) => {
            // Reaches the operator when still attached to the terminal;
            // failures after detaching are reported through the log.
            eprintln!("corespoold: {}", err);
            1
        }
    }
}

/// Startup in dependency order. Everything that depends on the launch
/// directory — script resolution, the dump-directory handle — happens
/// before the daemon detaches and chdirs away; the logger is built only
/// after daemonization so its machinery lives in the final process.
fn serve(config: DaemonConfig, debug: bool) -> Result<(), StartupError> {
    let mut server = config.server;

    // Pin the script down to an absolute path once, before anything changes
    // directory; every later check and the worker's open see this path.
    if let Some(script) = server.handler_script.take() {
        let script = script.canonicalize().map_err(|err| {
            let errno = err
                .raw_os_error()
                .map(Errno::from_raw)
                .unwrap_or(Errno::ENOENT);
            StartupError::Script(script.clone(), errno)
        })?;
        unistd::access(script.as_path(), AccessFlags::F_OK | AccessFlags::X_OK)
            .map_err(|errno| StartupError::Script(script.clone(), errno))?;
        server.handler_script = Some(script);
    }

    let mut pidfile = match server.pidfile.take() {
        Some(path) => match Pidfile::claim(path) {
            Ok(pidfile) => Some(pidfile),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                return Err(StartupError::AlreadyRunning);
            }
            Err(err) => return Err(StartupError::Pidfile(err)),
        },
        None => None,
    };

    let metadata = std::fs::metadata(&server.dumpdir)
        .map_err(|_| StartupError::BadDumpdir(server.dumpdir.clone()))?;
    if !metadata.is_dir() {
        return Err(StartupError::BadDumpdir(server.dumpdir.clone()));
    }
    let dumpdir_writable = unistd::access(server.dumpdir.as_path(), AccessFlags::W_OK).is_ok();
    if !dumpdir_writable {
        eprintln!("corespoold: warning: may be unable to write into dump location");
    }
    // The directory handle must be taken now: a relative dumpdir points
    // somewhere else entirely once the daemon has chdir'd to /.
    let dumpdir = File::open(&server.dumpdir)
        .map_err(|_| StartupError::BadDumpdir(server.dumpdir.clone()))?;

    if !debug {
        unistd::daemon(false, false).map_err(StartupError::Daemonize)?;
    }

    let log = build_logger(&config.logging, debug).map_err(StartupError::Logging)?;
    if !dumpdir_writable {
        logging::warn!(log, "may be unable to write into dump location";
                       "dumpdir" => server.dumpdir.display().to_string());
    }

    if let Some(pidfile) = pidfile.as_mut() {
        pidfile.write_pid().map_err(StartupError::Pidfile)?;
    }

    let spool = Spool::from_dir(dumpdir, &server.dumpdir, &log);

    if server.bind_address == Ipv4Addr::UNSPECIFIED {
        logging::warn!(log, "default: listening on all interfaces");
    }
    let dispenser =
        Dispenser::bind(server.bind_address, server.port, &log).map_err(StartupError::Bind)?;

    // The worker is forked while we still hold full authority; after the
    // gate is sealed the daemon cannot execute anything on its own.
    let handler = match &server.handler_script {
        Some(script) => Some(handler::spawn(script, &log).map_err(StartupError::Setup)?),
        None => None,
    };

    let resolver = Resolver::new(&log);
    let gate =
        Gate::seal(spool, resolver, dispenser, handler, &log).map_err(StartupError::Setup)?;

    let mut endpoint = Endpoint::new(gate, &log).map_err(StartupError::Setup)?;
    endpoint.run().map_err(StartupError::Setup)?;

    logging::info!(log, "terminated normally");
    Ok(())
}

fn build_logger(choice: &config::Logging, debug: bool) -> Result<Logger, logging::InitError> {
    if debug {
        return logging::terminal(true);
    }
    match &choice.config {
        Some(path) => logging::from_config_file(path),
        None => logging::terminal(false),
    }
}

enum StartupError {
    AlreadyRunning,
    Pidfile(io::Error),
    Script(PathBuf, nix::errno::Errno),
    BadDumpdir(PathBuf),
    Logging(logging::InitError),
    Bind(io::Error),
    Daemonize(nix::errno::Errno),
    Setup(coffer::net::shared::SetupError),
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            StartupError::AlreadyRunning => write!(f, "already running"),
            StartupError::Pidfile(err) => write!(f, "pidfile: {}", err),
            StartupError::Script(path, errno) => {
                write!(f, "cannot access {}: {}", path.display(), errno.desc())
            }
            StartupError::BadDumpdir(path) => {
                write!(f, "invalid dump location {}", path.display())
            }
            StartupError::Logging(err) => write!(f, "{}", err),
            StartupError::Bind(err) => write!(f, "cannot bind listening socket: {}", err),
            StartupError::Daemonize(errno) => write!(f, "daemon(): {}", errno.desc()),
            StartupError::Setup(err) => write!(f, "{}", err),
        }
    }
}
