//! Command line parsing for `debug_bridge`.

use sandbox_debug_bridge::wire::{DEBUGGER_BASE_PORT, FIRST_DECOY_IDENTITY};
use std::path::PathBuf;

/// How the upstream port is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamSource {
    /// Apply the discovery transform to our parent's pid (the launching editor process).
    ParentPid,
    Pid(u32),
    Port(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Args {
    pub upstream: UpstreamSource,
    pub upstream_host: String,
    pub base_port: u16,
    pub min_identity: u32,
    pub config: Option<PathBuf>,
    pub json: bool,
    pub watch_stdin: bool,
}

impl Default for Args {
    fn default() -> Self {
        Args {
            upstream: UpstreamSource::ParentPid,
            upstream_host: "localhost".to_owned(),
            base_port: DEBUGGER_BASE_PORT,
            min_identity: FIRST_DECOY_IDENTITY,
            config: None,
            json: false,
            watch_stdin: false,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Parsed {
    Help,
    Run(Args),
}

pub const USAGE: &str = "\
Usage: debug_bridge [OPTIONS]

Allocates a decoy identity, prints it on stdout, and relays the debugger connection
arriving on base-port + identity to the real debug target.

Options:
  --upstream-pid PID     target pid (default: parent process)
  --upstream-port PORT   target port, overrides --upstream-pid
  --upstream-host HOST   target host (default: localhost)
  --base-port PORT       discovery base port (default: 56000)
  --min-identity N       first identity to try (default: 3)
  --config FILE          JSON relay configuration
  --json                 print the allocation as JSON
  --watch-stdin          shut down when stdin reaches end of file
  -h, --help             show this help";

fn value<'a>(flag: &str, iter: &mut impl Iterator<Item = &'a String>) -> Result<&'a String, String> {
    iter.next().ok_or_else(|| format!("{flag} expects a value"))
}

fn number<T: std::str::FromStr>(flag: &str, raw: &str) -> Result<T, String> {
    raw.parse()
        .map_err(|_| format!("{flag}: '{raw}' is not a valid number"))
}

pub fn parse(args: &[String]) -> Result<Parsed, String> {
    let mut parsed = Args::default();
    let mut pid = None;
    let mut port = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Parsed::Help),
            "--upstream-pid" => pid = Some(number(arg, value(arg, &mut iter)?)?),
            "--upstream-port" => port = Some(number(arg, value(arg, &mut iter)?)?),
            "--upstream-host" => parsed.upstream_host = value(arg, &mut iter)?.clone(),
            "--base-port" => parsed.base_port = number(arg, value(arg, &mut iter)?)?,
            "--min-identity" => parsed.min_identity = number(arg, value(arg, &mut iter)?)?,
            "--config" => parsed.config = Some(PathBuf::from(value(arg, &mut iter)?)),
            "--json" => parsed.json = true,
            "--watch-stdin" => parsed.watch_stdin = true,
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    parsed.upstream = match (port, pid) {
        (Some(port), _) => UpstreamSource::Port(port),
        (None, Some(pid)) => UpstreamSource::Pid(pid),
        (None, None) => UpstreamSource::ParentPid,
    };
    Ok(Parsed::Run(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn defaults_follow_parent_pid() {
        assert_eq!(parse(&[]).unwrap(), Parsed::Run(Args::default()));
    }

    #[test]
    fn port_overrides_pid() {
        let parsed = parse(&strings(&[
            "--upstream-pid",
            "7042",
            "--upstream-port",
            "9000",
            "--json",
        ]))
        .unwrap();
        let Parsed::Run(args) = parsed else {
            panic!("expected run");
        };
        assert_eq!(args.upstream, UpstreamSource::Port(9000));
        assert!(args.json);
    }

    #[test]
    fn explicit_values() {
        let parsed = parse(&strings(&[
            "--upstream-pid",
            "7042",
            "--upstream-host",
            "127.0.0.1",
            "--base-port",
            "40000",
            "--min-identity",
            "10",
            "--config",
            "relay.json",
            "--watch-stdin",
        ]))
        .unwrap();
        assert_eq!(
            parsed,
            Parsed::Run(Args {
                upstream: UpstreamSource::Pid(7042),
                upstream_host: "127.0.0.1".to_owned(),
                base_port: 40000,
                min_identity: 10,
                config: Some(PathBuf::from("relay.json")),
                json: false,
                watch_stdin: true,
            })
        );
    }

    #[test]
    fn help_wins() {
        assert_eq!(
            parse(&strings(&["--json", "-h", "--bogus"])).unwrap(),
            Parsed::Help
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse(&strings(&["--base-port", "70000"])).is_err());
        assert!(parse(&strings(&["--upstream-pid"])).is_err());
        assert!(parse(&strings(&["--frobnicate"])).is_err());
    }
}
