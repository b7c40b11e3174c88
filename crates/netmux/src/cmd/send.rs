use std::fs;
use std::sync::Arc;

use netmux_frame::{MessageChannel, NullBus, ReplyChannel};
use netmux_peer::{Client, Config};
use netmux_sched::WorkerBoss;

use crate::cmd::{parse_duration, SendArgs};
use crate::exit::{frame_error, peer_error, CliError, CliResult, FAILURE, SUCCESS};
use crate::output::{print_message, OutputFormat};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    let payload = resolve_payload(&args)?;

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
    let valve = client
        .valve()
        .ok_or_else(|| CliError::new(FAILURE, "no valve after connect"))?;

    let result = if args.wait {
        let channel = ReplyChannel::attach(&valve, args.channel, Arc::new(NullBus))
            .map_err(|err| frame_error("channel attach failed", err))?;
        let reply = channel
            .request(&[&payload], Some(wait_timeout))
            .map_err(|err| frame_error("request failed", err))?;

        let flat = crate::output::flatten_parts(&reply);
        print_message(args.addr, args.channel, &flat, format);
        Ok(SUCCESS)
    } else {
        let channel = MessageChannel::attach(&valve, args.channel, Box::new(|_| {}))
            .map_err(|err| frame_error("channel attach failed", err))?;
        channel
            .send(&payload)
            .map_err(|err| frame_error("send failed", err))?;
        // Give the pump a moment to flush before teardown.
        std::thread::sleep(std::time::Duration::from_millis(50));
        Ok(SUCCESS)
    };

    client.disconnect();
    result
}

fn resolve_payload(args: &SendArgs) -> CliResult<Vec<u8>> {
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path).map_err(|err| {
            crate::exit::io_error(&format!("failed reading {}", path.display()), err)
        });
    }
    Ok(Vec::new())
}
