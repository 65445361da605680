//! The `debug_bridge` binary, run by the editor launcher inside the debug target's sandbox.
//!
//! # Architecture
//!
//! 1.  **Upstream**: works out the real target's port, by default from our parent's pid
//!     (the launcher is started by the process being debugged).
//! 2.  **Allocation**: finds a free identity and prints it, so the launcher can start the
//!     decoy process in the editor's sandbox.
//! 3.  **Relay**: forwards the debugger's connection until it ends, or until stdin closes
//!     when `--watch-stdin` is given.

mod args;

use args::{Args, Parsed, USAGE, UpstreamSource};
use sandbox_debug_bridge::relay::{RelayConfig, RelaySession, Upstream};
use sandbox_debug_bridge::wire::port_for_pid;
use sandbox_debug_bridge::{Error, Shutdown, allocate};
use serde::Serialize;
use std::io::{Read, Write};

/// What the launcher needs to know about the allocation.
#[derive(Debug, Serialize)]
struct Report<'a> {
    identity: u32,
    listen_port: u16,
    upstream_host: &'a str,
    upstream_port: u16,
}

fn main() {
    let raw = std::env::args().skip(1).collect::<Vec<String>>();
    let args = match args::parse(&raw) {
        Ok(Parsed::Help) => {
            println!("{USAGE}");
            return;
        }
        Ok(Parsed::Run(args)) => args,
        Err(e) => {
            eprintln!("{e}");
            eprintln!("Try 'debug_bridge --help'.");
            std::process::exit(2);
        }
    };
    if let Err(e) = run(args) {
        eprintln!("debug_bridge: {e}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Error> {
    let config = match &args.config {
        Some(path) => RelayConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => RelayConfig::default(),
    };
    let upstream_port = match args.upstream {
        UpstreamSource::ParentPid => {
            port_for_pid(args.base_port, std::os::unix::process::parent_id())?
        }
        UpstreamSource::Pid(pid) => port_for_pid(args.base_port, pid)?,
        UpstreamSource::Port(port) => port,
    };

    let allocation = allocate(args.base_port, args.min_identity)?;
    let report = Report {
        identity: allocation.identity(),
        listen_port: allocation.port(),
        upstream_host: &args.upstream_host,
        upstream_port,
    };
    let mut stdout = std::io::stdout().lock();
    if args.json {
        let json = serde_json::to_string(&report).map_err(std::io::Error::other)?;
        writeln!(stdout, "{json}")?;
    } else {
        writeln!(stdout, "{}", report.identity)?;
    }
    stdout.flush()?;
    drop(stdout);

    let session = RelaySession::with_config(
        allocation.into_listener(),
        Upstream::new(args.upstream_host.clone(), upstream_port),
        config,
    );
    if args.watch_stdin {
        watch_stdin(session.shutdown_handle())?;
    }
    session.spawn()?.join()
}

/// Triggers `shutdown` once stdin reaches end of file.
fn watch_stdin(shutdown: Shutdown) -> Result<(), Error> {
    std::thread::Builder::new()
        .name("debug_bridge::stdin".to_owned())
        .spawn(move || {
            let mut sink = [0u8; 256];
            let mut stdin = std::io::stdin().lock();
            loop {
                match stdin.read(&mut sink) {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            logwise::info_sync!("stdin closed, shutting the relay down");
            shutdown.trigger();
        })
        .map_err(Error::Spawn)?;
    Ok(())
}
