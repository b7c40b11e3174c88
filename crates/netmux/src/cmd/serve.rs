use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use netmux_frame::{EventBus, NetEvent, ReplyChannel};
use netmux_peer::{Config, Server};
use netmux_sched::WorkerBoss;

use crate::cmd::ServeArgs;
use crate::exit::{peer_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_message, OutputFormat};

struct ForwardBus {
    tx: Mutex<mpsc::Sender<NetEvent>>,
}

impl EventBus for ForwardBus {
    fn publish(&self, event: NetEvent) {
        let _ = self.tx.lock().unwrap_or_else(|p| p.into_inner()).send(event);
    }
}

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let (tx, events) = mpsc::channel();
    let bus = Arc::new(ForwardBus { tx: Mutex::new(tx) });

    let config = Config::default().with_transport(args.transport.into());
    let server = Server::new(
        config,
        &args.passphrase,
        Arc::new(WorkerBoss::new()),
        bus.clone(),
    );
    let local = server
        .start(args.bind)
        .map_err(|err| peer_error("bind failed", err))?;
    eprintln!("serving on {local}");

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    // Request channels are attached lazily, one per connected peer.
    let mut responders: HashMap<SocketAddr, Arc<ReplyChannel>> = HashMap::new();
    let mut handled = 0usize;

    while running.load(Ordering::SeqCst) {
        let event = match events.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => event,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };

        match event {
            NetEvent::PostConnection { remote } => {
                if let Some(valve) = server.valve(&remote) {
                    match ReplyChannel::attach(&valve, args.channel, bus.clone()) {
                        Ok(channel) => {
                            responders.insert(remote, channel);
                        }
                        Err(err) => {
                            eprintln!("error: failed to attach channel for {remote}: {err}");
                        }
                    }
                }
            }
            NetEvent::Disconnection { remote, .. } => {
                responders.remove(&remote);
            }
            NetEvent::RequestReceived {
                remote,
                channel,
                request_id,
                payload,
            } => {
                let flat = crate::output::flatten_parts(&payload);
                print_message(remote, channel, &flat, format);

                // Echo the request payload back as the reply.
                if let Some(responder) = responders.get(&remote) {
                    let parts: Vec<&[u8]> = payload.iter().map(|p| p.as_ref()).collect();
                    if let Err(err) = responder.reply(request_id, &parts) {
                        eprintln!("error: reply to {remote} failed: {err}");
                    }
                }

                handled += 1;
                if let Some(count) = args.count {
                    if handled >= count {
                        break;
                    }
                }
            }
            _ => {}
        }
    }

    server.stop();
    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
