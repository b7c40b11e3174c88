use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand, ValueEnum};
use netmux_transport::ConnectionKind;

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod ping;
pub mod send;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a server that prints messages and echoes requests.
    Serve(ServeArgs),
    /// Connect, send one message, optionally wait for the reply.
    Send(SendArgs),
    /// Connect and report the measured round trip.
    Ping(PingArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Send(args) => send::run(args, format),
        Command::Ping(args) => ping::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum Transport {
    Tcp,
    Udp,
}

impl From<Transport> for ConnectionKind {
    fn from(transport: Transport) -> Self {
        match transport {
            Transport::Tcp => ConnectionKind::Stream,
            Transport::Udp => ConnectionKind::Datagram,
        }
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to bind, e.g. 127.0.0.1:7440.
    pub bind: SocketAddr,
    /// Transport to serve over.
    #[arg(long, value_enum, default_value = "tcp")]
    pub transport: Transport,
    /// Passphrase clients must present.
    #[arg(long, default_value = "netmux")]
    pub passphrase: String,
    /// Channel to answer requests on.
    #[arg(long, short = 'c', default_value = "5")]
    pub channel: u16,
    /// Exit after handling N messages.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Server address, e.g. 127.0.0.1:7440.
    pub addr: SocketAddr,
    /// Transport to connect over.
    #[arg(long, value_enum, default_value = "tcp")]
    pub transport: Transport,
    /// Passphrase to present.
    #[arg(long, default_value = "netmux")]
    pub passphrase: String,
    /// Channel to send on.
    #[arg(long, short = 'c', default_value = "5")]
    pub channel: u16,
    /// Raw string payload.
    #[arg(long, conflicts_with = "file")]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with = "data")]
    pub file: Option<PathBuf>,
    /// Send as a request and wait for the reply.
    #[arg(long)]
    pub wait: bool,
    /// Maximum time to wait for the reply (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub wait_timeout: String,
}

#[derive(Args, Debug)]
pub struct PingArgs {
    /// Server address, e.g. 127.0.0.1:7440.
    pub addr: SocketAddr,
    /// Transport to connect over.
    #[arg(long, value_enum, default_value = "tcp")]
    pub transport: Transport,
    /// Passphrase to present.
    #[arg(long, default_value = "netmux")]
    pub passphrase: String,
    /// Give up after this long (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build information.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        _ => Err(CliError::new(
            USAGE,
            format!("unsupported duration unit: {unit}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("").is_err());
    }
}
