use std::sync::Arc;
use std::time::Instant;

use netmux_frame::NullBus;
use netmux_peer::{Client, Config};
use netmux_sched::WorkerBoss;

use crate::cmd::{parse_duration, PingArgs};
use crate::exit::{peer_error, CliResult, SUCCESS, TIMEOUT};
use crate::output::OutputFormat;

pub fn run(args: PingArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;

    let config = Config::default().with_transport(args.transport.into());
    let client = Client::new(
        config,
        &args.passphrase,
        Arc::new(WorkerBoss::new()),
        Arc::new(NullBus),
    );
    client
        .connect(args.addr)
        .map_err(|err| peer_error("connect failed", err))?;

    // The liveness handshake needs a round trip in each direction.
    let deadline = Instant::now() + timeout;
    let ping = loop {
        if let Some(ping) = client.ping() {
            break Some(ping);
        }
        if Instant::now() >= deadline || !client.is_connected() {
            break None;
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
    };
    client.disconnect();

    match ping {
        Some(ping) => {
            match format {
                OutputFormat::Json => {
                    println!(
                        "{{\"addr\":\"{}\",\"ping_ms\":{}}}",
                        args.addr,
                        ping.as_millis()
                    );
                }
                _ => println!("ping to {}: {}ms", args.addr, ping.as_millis()),
            }
            Ok(SUCCESS)
        }
        None => Err(crate::exit::CliError::new(
            TIMEOUT,
            format!("no handshake reply from {} within {:?}", args.addr, timeout),
        )),
    }
}
